//! Typed field values written into a packet's per-layer info record by a
//! protocol's `parse` handler (spec §3, §6). Mirrors the closed set of
//! `ptype`s the original engine supported (`uint8`, `uint16`, `uint32`,
//! `ipv4`, `ipv6`, `string`, `bool`, `bytes`).

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// One declared field in a protocol's schema.
#[derive(Debug, Clone)]
pub struct FieldSchemaEntry {
    pub name: &'static str,
    pub kind: FieldKind,
    pub description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Uint8,
    Uint16,
    Uint32,
    Ipv4,
    Ipv6,
    String,
    Bool,
    Bytes,
}

/// A concrete field value, tagged with the kind it was declared as.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    String(Arc<str>),
    Bool(bool),
    Bytes(Arc<[u8]>),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Uint8(_) => FieldKind::Uint8,
            FieldValue::Uint16(_) => FieldKind::Uint16,
            FieldValue::Uint32(_) => FieldKind::Uint32,
            FieldValue::Ipv4(_) => FieldKind::Ipv4,
            FieldValue::Ipv6(_) => FieldKind::Ipv6,
            FieldValue::String(_) => FieldKind::String,
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Bytes(_) => FieldKind::Bytes,
        }
    }

    /// Render as a byte sequence suitable for use as a conntrack key
    /// component. Numbers are big-endian; this makes forward/reverse key
    /// comparisons byte-stable across platforms.
    pub fn to_key_bytes(&self) -> Vec<u8> {
        match self {
            FieldValue::Uint8(v) => vec![*v],
            FieldValue::Uint16(v) => v.to_be_bytes().to_vec(),
            FieldValue::Uint32(v) => v.to_be_bytes().to_vec(),
            FieldValue::Ipv4(v) => v.octets().to_vec(),
            FieldValue::Ipv6(v) => v.octets().to_vec(),
            FieldValue::String(v) => v.as_bytes().to_vec(),
            FieldValue::Bool(v) => vec![*v as u8],
            FieldValue::Bytes(v) => v.to_vec(),
        }
    }

    /// Inverse of [`Self::to_key_bytes`] for a given `kind` (spec §6
    /// `parse`). `None` if `bytes` isn't a valid encoding for that kind —
    /// wrong length for a fixed-width kind, or not valid UTF-8 for `String`.
    pub fn parse(kind: FieldKind, bytes: &[u8]) -> Option<FieldValue> {
        match kind {
            FieldKind::Uint8 => match *bytes {
                [v] => Some(FieldValue::Uint8(v)),
                _ => None,
            },
            FieldKind::Uint16 => <[u8; 2]>::try_from(bytes).ok().map(|b| FieldValue::Uint16(u16::from_be_bytes(b))),
            FieldKind::Uint32 => <[u8; 4]>::try_from(bytes).ok().map(|b| FieldValue::Uint32(u32::from_be_bytes(b))),
            FieldKind::Ipv4 => <[u8; 4]>::try_from(bytes).ok().map(|b| FieldValue::Ipv4(Ipv4Addr::from(b))),
            FieldKind::Ipv6 => <[u8; 16]>::try_from(bytes).ok().map(|b| FieldValue::Ipv6(Ipv6Addr::from(b))),
            FieldKind::String => std::str::from_utf8(bytes).ok().map(|s| FieldValue::String(Arc::from(s))),
            FieldKind::Bool => match *bytes {
                [0] => Some(FieldValue::Bool(false)),
                [1] => Some(FieldValue::Bool(true)),
                _ => None,
            },
            FieldKind::Bytes => Some(FieldValue::Bytes(Arc::from(bytes))),
        }
    }

    /// Human-readable rendering (spec §6 `print`). Byte strings print as
    /// lowercase hex since they're not generally printable text.
    pub fn print(&self) -> String {
        match self {
            FieldValue::Uint8(v) => v.to_string(),
            FieldValue::Uint16(v) => v.to_string(),
            FieldValue::Uint32(v) => v.to_string(),
            FieldValue::Ipv4(v) => v.to_string(),
            FieldValue::Ipv6(v) => v.to_string(),
            FieldValue::String(v) => v.to_string(),
            FieldValue::Bool(v) => v.to_string(),
            FieldValue::Bytes(v) => v.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }

    /// Orders two values of the same kind by their `to_key_bytes` encoding
    /// (spec §6 `compare`). `None` across kinds — a `Uint8` and an `Ipv4`
    /// have no meaningful order relative to each other.
    pub fn compare(&self, other: &FieldValue) -> Option<std::cmp::Ordering> {
        if self.kind() != other.kind() {
            return None;
        }
        Some(self.to_key_bytes().cmp(&other.to_key_bytes()))
    }

    // spec §6 `cleanup`: no method here. Every `FieldValue` variant owns
    // only plain data or a refcounted slice, so `Drop` already reclaims
    // everything `cleanup` would — the same reasoning `PrivateState`'s
    // blanket impl relies on in `registry.rs`.
}

/// A named, ordered set of `(name, value)` pairs parsed for one layer,
/// matching the field schema declared by that layer's protocol.
#[derive(Debug, Clone, Default)]
pub struct LayerFields {
    values: Vec<(&'static str, FieldValue)>,
}

impl LayerFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &'static str, value: FieldValue) {
        if let Some(slot) = self.values.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.values.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, FieldValue)> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<FieldValue> {
        vec![
            FieldValue::Uint8(7),
            FieldValue::Uint16(1234),
            FieldValue::Uint32(0xdead_beef),
            FieldValue::Ipv4(Ipv4Addr::new(192, 0, 2, 1)),
            FieldValue::Ipv6(Ipv6Addr::LOCALHOST),
            FieldValue::String(Arc::from("sip-invite")),
            FieldValue::Bool(true),
            FieldValue::Bytes(Arc::from(&b"\x01\x02\xff"[..])),
        ]
    }

    #[test]
    fn parse_of_to_key_bytes_round_trips_every_kind() {
        for value in samples() {
            let encoded = value.to_key_bytes();
            let decoded = FieldValue::parse(value.kind(), &encoded);
            assert_eq!(decoded, Some(value));
        }
    }

    #[test]
    fn parse_rejects_the_wrong_length_for_fixed_width_kinds() {
        assert_eq!(FieldValue::parse(FieldKind::Uint16, &[1]), None);
        assert_eq!(FieldValue::parse(FieldKind::Ipv4, &[1, 2, 3]), None);
        assert_eq!(FieldValue::parse(FieldKind::Bool, &[2]), None);
    }

    #[test]
    fn compare_is_none_across_kinds_and_orders_within_a_kind() {
        let a = FieldValue::Uint16(10);
        let b = FieldValue::Uint16(20);
        assert_eq!(a.compare(&b), Some(std::cmp::Ordering::Less));

        let bytes = FieldValue::Bytes(Arc::from(&b"\x00"[..]));
        assert_eq!(a.compare(&bytes), None);
    }

    #[test]
    fn print_renders_bytes_as_lowercase_hex() {
        let value = FieldValue::Bytes(Arc::from(&b"\x01\x0a\xff"[..]));
        assert_eq!(value.print(), "010aff");
    }
}
