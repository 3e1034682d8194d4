//! End-to-end scenario tests driving the real dispatcher over the
//! built-in protocol modules: IPv4 fragment reassembly in order (S1)
//! and out of order (S2), and an SDP-negotiated RTP flow (S4).

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use fluxcap_conntrack::timer::TimerWheel;
use fluxcap_conntrack::ConntrackTable;
use fluxcap_core::field::FieldValue;
use fluxcap_core::packet::{CaptureTimestamp, Packet, WallClock};
use fluxcap_core::registry::{ConntrackAccess, Registry};
use fluxcap_core::{DispatchOutcome, PipelineDispatcher};

fn ts() -> CaptureTimestamp {
    CaptureTimestamp {
        monotonic: Duration::ZERO,
        wall: WallClock(SystemTime::UNIX_EPOCH),
    }
}

fn eth_header(ethertype: u16) -> Vec<u8> {
    let mut v = vec![0u8; 12];
    v.extend_from_slice(&ethertype.to_be_bytes());
    v
}

fn flags_frag(more_fragments: bool, offset_units: u16) -> u16 {
    (if more_fragments { 0x2000 } else { 0 }) | (offset_units & 0x1fff)
}

#[allow(clippy::too_many_arguments)]
fn ipv4_header(
    total_len: u16,
    id: u16,
    more_fragments: bool,
    frag_offset_units: u16,
    proto: u8,
    src: [u8; 4],
    dst: [u8; 4],
) -> Vec<u8> {
    let mut v = vec![0u8; 20];
    v[0] = 0x45;
    v[2..4].copy_from_slice(&total_len.to_be_bytes());
    v[4..6].copy_from_slice(&id.to_be_bytes());
    v[6..8].copy_from_slice(&flags_frag(more_fragments, frag_offset_units).to_be_bytes());
    v[8] = 64;
    v[9] = proto;
    v[12..16].copy_from_slice(&src);
    v[16..20].copy_from_slice(&dst);
    v
}

fn udp_header(src_port: u16, dst_port: u16, len: u16) -> Vec<u8> {
    let mut v = vec![0u8; 8];
    v[0..2].copy_from_slice(&src_port.to_be_bytes());
    v[2..4].copy_from_slice(&dst_port.to_be_bytes());
    v[4..6].copy_from_slice(&len.to_be_bytes());
    v
}

struct Harness {
    registry: Arc<Registry>,
    conntrack: Arc<ConntrackTable>,
}

impl Harness {
    fn new() -> Self {
        let registry = Arc::new(Registry::new());
        let conntrack = Arc::new(ConntrackTable::new(4, Duration::from_secs(60)));
        let timers = TimerWheel::new();
        let conntrack_dyn: Arc<dyn ConntrackAccess> = conntrack.clone();
        fluxcap_proto::install(&registry, conntrack_dyn, timers, 5.0).unwrap();
        Harness { registry, conntrack }
    }

    fn dispatch(&self, bytes: Vec<u8>) -> (DispatchOutcome, Packet) {
        let mut packet = Packet::new(ts(), Bytes::from(bytes));
        let dispatcher = PipelineDispatcher::new(self.registry.as_ref(), self.conntrack.as_ref());
        let outcome = dispatcher.process(&mut packet, "eth");
        (outcome, packet)
    }
}

const SRC: [u8; 4] = [10, 0, 0, 1];
const DST: [u8; 4] = [10, 0, 0, 2];

/// S1: an IPv4 datagram split across two in-order fragments reassembles
/// into one UDP packet and is processed exactly once.
#[test]
fn s1_ipv4_fragments_reassemble_in_order() {
    let h = Harness::new();

    let udp_payload = b"HELLOWORLD".to_vec(); // 10 bytes
    let mut udp_segment = udp_header(40000, 9000, 8 + udp_payload.len() as u16);
    udp_segment.extend_from_slice(&udp_payload);
    assert_eq!(udp_segment.len(), 18);

    let frag0 = {
        let mut buf = eth_header(0x0800);
        buf.extend_from_slice(&ipv4_header(20 + 8, 77, true, 0, 17, SRC, DST));
        buf.extend_from_slice(&udp_segment[0..8]);
        buf
    };
    let frag1 = {
        let mut buf = eth_header(0x0800);
        buf.extend_from_slice(&ipv4_header(20 + 10, 77, false, 1, 17, SRC, DST));
        buf.extend_from_slice(&udp_segment[8..18]);
        buf
    };

    let (outcome0, _) = h.dispatch(frag0);
    assert!(matches!(outcome0, DispatchOutcome::Delivered));
    let (outcome1, _) = h.dispatch(frag1);
    assert!(matches!(outcome1, DispatchOutcome::Delivered));

    // One CE for the IPv4 pair, one for the reassembled UDP flow.
    assert_eq!(h.conntrack.len(), 2);
}

/// S2: the same two fragments, delivered out of order, reassemble
/// identically.
#[test]
fn s2_ipv4_fragments_reassemble_out_of_order() {
    let h = Harness::new();

    let udp_payload = b"HELLOWORLD".to_vec();
    let mut udp_segment = udp_header(40000, 9000, 8 + udp_payload.len() as u16);
    udp_segment.extend_from_slice(&udp_payload);

    let frag0 = {
        let mut buf = eth_header(0x0800);
        buf.extend_from_slice(&ipv4_header(28, 55, true, 0, 17, SRC, DST));
        buf.extend_from_slice(&udp_segment[0..8]);
        buf
    };
    let frag1 = {
        let mut buf = eth_header(0x0800);
        buf.extend_from_slice(&ipv4_header(30, 55, false, 1, 17, SRC, DST));
        buf.extend_from_slice(&udp_segment[8..18]);
        buf
    };

    // Reverse arrival order relative to S1.
    let (outcome1, _) = h.dispatch(frag1);
    assert!(matches!(outcome1, DispatchOutcome::Delivered));
    let (outcome0, _) = h.dispatch(frag0);
    assert!(matches!(outcome0, DispatchOutcome::Delivered));

    assert_eq!(h.conntrack.len(), 2);
}

fn sip_invite(sdp_ip: &str, sdp_port: u16) -> Vec<u8> {
    let body = format!(
        "v=0\r\no=- 0 0 IN IP4 {sdp_ip}\r\ns=-\r\nc=IN IP4 {sdp_ip}\r\nt=0 0\r\nm=audio {sdp_port} RTP/AVP 0\r\n"
    );
    format!(
        "INVITE sip:bob@example.com SIP/2.0\r\n\
         Call-ID: abc123\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}

/// S4: a SIP INVITE carrying SDP binds the negotiated media address, and
/// the following UDP packet on that address is routed to `rtp` even
/// though its source port is arbitrary and unseen before.
#[test]
fn s4_sip_sdp_binds_subsequent_rtp_flow() {
    let h = Harness::new();

    let phone_a: [u8; 4] = [10, 0, 0, 5];
    let phone_b: [u8; 4] = [10, 0, 0, 9];
    let rtp_port: u16 = 40000;

    let sip_body = sip_invite("10.0.0.5", rtp_port);
    let mut udp_seg = udp_header(5060, 5060, 8 + sip_body.len() as u16);
    udp_seg.extend_from_slice(&sip_body);

    let mut invite_packet = eth_header(0x0800);
    invite_packet.extend_from_slice(&ipv4_header(
        20 + udp_seg.len() as u16,
        1,
        false,
        0,
        17,
        phone_b,
        phone_a,
    ));
    invite_packet.extend_from_slice(&udp_seg);

    let (outcome, packet) = h.dispatch(invite_packet);
    assert!(matches!(outcome, DispatchOutcome::Delivered));
    assert_eq!(packet.layers.len(), 3); // eth, ipv4, sip (stopped before recursing)

    // First RTP packet: arbitrary source port, destined at the negotiated
    // media address.
    let rtp_header: [u8; 12] = [0x80, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1];
    let mut rtp_udp = udp_header(33333, rtp_port, 8 + rtp_header.len() as u16);
    rtp_udp.extend_from_slice(&rtp_header);

    let mut rtp_packet = eth_header(0x0800);
    rtp_packet.extend_from_slice(&ipv4_header(20 + rtp_udp.len() as u16, 2, false, 0, 17, phone_b, phone_a));
    rtp_packet.extend_from_slice(&rtp_udp);

    let (rtp_outcome, packet) = h.dispatch(rtp_packet);
    assert!(matches!(rtp_outcome, DispatchOutcome::Delivered));
    assert_eq!(packet.layers.len(), 4);
    assert_eq!(packet.layers[3].protocol, "rtp");
    assert_eq!(packet.layers[3].fields.get("payload_type"), Some(&FieldValue::Uint8(0)));
}
