//! Input driver contract (C9, spec §4.7): an abstract source producing
//! `(ts, bytes, link_proto)` tuples into the pipeline.

use std::time::SystemTime;

use crate::error::FluxcapError;
use crate::packet::CaptureTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// One packet as handed from a driver to the pipeline, before a
/// `Packet` value has been constructed.
pub struct RawFrame {
    pub captured_at: CaptureTimestamp,
    pub bytes: Vec<u8>,
    pub link_protocol: &'static str,
}

impl RawFrame {
    pub fn now(bytes: Vec<u8>, link_protocol: &'static str, monotonic: std::time::Duration) -> Self {
        RawFrame {
            captured_at: CaptureTimestamp {
                monotonic,
                wall: crate::packet::WallClock(SystemTime::now()),
            },
            bytes,
            link_protocol,
        }
    }
}

/// An input driver: `{init, open, read, interrupt, close, cleanup}` plus a
/// `live` flag (spec §6). Implementations own their own capture thread;
/// `fluxcap-runtime` drives the state machine and exclusivity rule.
pub trait InputDriver: Send {
    /// Real-time source (network interface) vs. a file that can be
    /// deterministically paused/resumed. At most one non-live input may
    /// run at a time, and it cannot coexist with any live input (spec §4.7,
    /// scenario S5).
    fn is_live(&self) -> bool;

    fn open(&mut self) -> Result<(), FluxcapError>;

    /// Blocks until a frame is available or `interrupt` is called.
    /// Returns `Ok(None)` on a clean end-of-source (e.g. EOF on a file).
    fn read(&mut self) -> Result<Option<RawFrame>, FluxcapError>;

    /// Called from the control thread to unblock a `read` in progress.
    fn interrupt(&mut self);

    fn close(&mut self) -> Result<(), FluxcapError>;
}
