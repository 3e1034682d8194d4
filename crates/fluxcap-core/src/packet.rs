//! The packet value (C1): an immutable-after-capture, timestamped byte
//! buffer with a per-layer metadata slot appended as the pipeline walks it.

use std::ops::Range;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::field::LayerFields;

/// Monotonic capture clock reading alongside the corresponding wall-clock
/// timestamp. Both are recorded at capture time and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CaptureTimestamp {
    pub monotonic: Duration,
    pub wall: WallClock,
}

/// Thin wrapper so `CaptureTimestamp` can derive `Ord`; `SystemTime` itself
/// does not.
#[derive(Debug, Clone, Copy)]
pub struct WallClock(pub SystemTime);

impl PartialEq for WallClock {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for WallClock {}
impl PartialOrd for WallClock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for WallClock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

/// One parsed layer's record: which protocol parsed it, the fields it
/// wrote, and the payload slice (as an offset range into the packet's
/// bytes) it handed to the next layer.
#[derive(Debug, Clone)]
pub struct PacketLayerInfo {
    pub protocol: &'static str,
    pub fields: LayerFields,
    pub payload: Range<usize>,
}

/// An immutable-after-capture packet. Owned exclusively by the frame
/// currently processing it; may additionally be referenced from a
/// reassembly buffer (the `Bytes` handle is refcounted, so the last holder
/// to drop frees the backing allocation — no raw aliasing is required).
#[derive(Debug, Clone)]
pub struct Packet {
    pub captured_at: CaptureTimestamp,
    pub bytes: Bytes,
    pub layers: Vec<PacketLayerInfo>,
}

impl Packet {
    pub fn new(captured_at: CaptureTimestamp, bytes: impl Into<Bytes>) -> Self {
        Packet {
            captured_at,
            bytes: bytes.into(),
            layers: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The payload slice of the innermost parsed layer, or the whole
    /// buffer if nothing has been parsed yet.
    pub fn innermost_payload(&self) -> &[u8] {
        match self.layers.last() {
            Some(layer) => &self.bytes[layer.payload.clone()],
            None => &self.bytes[..],
        }
    }

    pub fn push_layer(&mut self, protocol: &'static str, fields: LayerFields, payload: Range<usize>) {
        self.layers.push(PacketLayerInfo {
            protocol,
            fields,
            payload,
        });
    }
}
