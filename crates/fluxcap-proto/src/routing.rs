//! Shared routing helpers used across the transport/application modules:
//! the well-known-endpoint table SIP populates from an SDP body so that a
//! UDP datagram's *first* packet on a dynamically negotiated flow can
//! still be routed to the right handler in `parse`, before any conntrack
//! entry for that flow exists.
//!
//! This is deliberately separate from [`fluxcap_conntrack::Expectation`]:
//! the expectation is the CE-linking, single-shot-consumption primitive
//! spec'd in §4.5; this table only answers "who parses this payload".

use std::net::Ipv4Addr;
use std::sync::Arc;

use dashmap::DashMap;
use fluxcap_core::field::FieldValue;
use fluxcap_core::packet::Packet;

type Endpoint = [u8; 6];

fn endpoint_bytes(ip: Ipv4Addr, port: u16) -> Endpoint {
    let mut out = [0u8; 6];
    out[..4].copy_from_slice(&ip.octets());
    out[4..].copy_from_slice(&port.to_be_bytes());
    out
}

/// `(ip, port)` -> protocol name bindings, consulted by `udp::parse`.
#[derive(Default)]
pub struct PortRouter {
    bindings: DashMap<Endpoint, &'static str>,
}

impl PortRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bind(&self, ip: Ipv4Addr, port: u16, proto: &'static str) {
        self.bindings.insert(endpoint_bytes(ip, port), proto);
    }

    pub fn lookup(&self, ip: Ipv4Addr, port: u16) -> Option<&'static str> {
        self.bindings.get(&endpoint_bytes(ip, port)).map(|r| *r)
    }
}

/// Builds the `(fwd_key, rev_key)` pair used as a transport-layer
/// conntrack key: 4 address bytes + 2 port bytes, twice, forward then
/// reverse endpoint.
pub fn udp_keys(src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> (Vec<u8>, Vec<u8>) {
    let mut fwd = Vec::with_capacity(12);
    fwd.extend_from_slice(&src_ip.octets());
    fwd.extend_from_slice(&src_port.to_be_bytes());
    fwd.extend_from_slice(&dst_ip.octets());
    fwd.extend_from_slice(&dst_port.to_be_bytes());

    let mut rev = Vec::with_capacity(12);
    rev.extend_from_slice(&dst_ip.octets());
    rev.extend_from_slice(&dst_port.to_be_bytes());
    rev.extend_from_slice(&src_ip.octets());
    rev.extend_from_slice(&src_port.to_be_bytes());

    (fwd, rev)
}

/// Rebuilds the same `(fwd_key, rev_key)` a UDP layer used for its own
/// `get_or_create` call, by reading the already-parsed IP and UDP layer
/// fields sitting one and two frames up the stack. Lets a protocol
/// riding on top of UDP (e.g. SIP) land on the exact same conntrack
/// entry without re-deriving the key differently.
pub fn udp_keys_from_packet(packet: &Packet, udp_frame_index: usize) -> Option<(Vec<u8>, Vec<u8>)> {
    if udp_frame_index == 0 {
        return None;
    }
    let udp_fields = &packet.layers.get(udp_frame_index)?.fields;
    let ip_fields = &packet.layers.get(udp_frame_index - 1)?.fields;

    let src_port = match udp_fields.get("src_port") {
        Some(FieldValue::Uint16(v)) => *v,
        _ => return None,
    };
    let dst_port = match udp_fields.get("dst_port") {
        Some(FieldValue::Uint16(v)) => *v,
        _ => return None,
    };
    let src_ip = match ip_fields.get("src_addr") {
        Some(FieldValue::Ipv4(v)) => *v,
        _ => return None,
    };
    let dst_ip = match ip_fields.get("dst_addr") {
        Some(FieldValue::Ipv4(v)) => *v,
        _ => return None,
    };

    Some(udp_keys(src_ip, src_port, dst_ip, dst_port))
}

/// A predicate matching any 12-byte transport key with `ip`/`port` as
/// either endpoint, for an expectation whose peer port is not yet known
/// (spec §4.5, scenario S4).
pub fn matches_known_endpoint(ip: Ipv4Addr, port: u16) -> impl Fn(&[u8], &[u8]) -> bool + Send + 'static {
    let known = endpoint_bytes(ip, port);
    move |fwd_key: &[u8], _rev_key: &[u8]| {
        fwd_key.len() == 12 && (fwd_key[0..6] == known[..] || fwd_key[6..12] == known[..])
    }
}
