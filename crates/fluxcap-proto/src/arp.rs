//! ARP (supplemented from `proto_arp.h` — see `DESIGN.md`): a second,
//! non-fragmenting link-adjacent protocol, mostly here to exercise the
//! field schema beyond IPv4/UDP/SIP. Stateless in this engine: address
//! resolution tables are out of scope, only field extraction is done.

use fluxcap_core::field::{FieldKind, FieldSchemaEntry, FieldValue, LayerFields};
use fluxcap_core::packet::Packet;
use fluxcap_core::registry::{ParseOutcome, ProtocolHandlers};
use fluxcap_core::verdict::HandlerVerdict;

const MIN_HEADER_LEN: usize = 8;
const HTYPE_ETHERNET: u16 = 1;
const PTYPE_IPV4: u16 = 0x0800;

pub struct ArpHandlers;

pub fn field_schema() -> Vec<FieldSchemaEntry> {
    vec![
        FieldSchemaEntry { name: "hw_type", kind: FieldKind::Uint16, description: "hardware type" },
        FieldSchemaEntry { name: "proto_type", kind: FieldKind::Uint16, description: "protocol type" },
        FieldSchemaEntry { name: "opcode", kind: FieldKind::Uint16, description: "request (1) or reply (2)" },
        FieldSchemaEntry { name: "sender_mac", kind: FieldKind::Bytes, description: "sender hardware address" },
        FieldSchemaEntry { name: "sender_ip", kind: FieldKind::Ipv4, description: "sender protocol address" },
        FieldSchemaEntry { name: "target_mac", kind: FieldKind::Bytes, description: "target hardware address" },
        FieldSchemaEntry { name: "target_ip", kind: FieldKind::Ipv4, description: "target protocol address" },
    ]
}

impl ProtocolHandlers for ArpHandlers {
    fn parse(&self, packet: &mut Packet, frame_index: usize) -> Result<ParseOutcome, HandlerVerdict> {
        let range = packet
            .layers
            .get(frame_index)
            .map(|l| l.payload.clone())
            .unwrap_or(0..packet.len());
        let buf = &packet.bytes[range];
        if buf.len() < MIN_HEADER_LEN {
            return Err(HandlerVerdict::Invalid);
        }

        let hw_type = u16::from_be_bytes([buf[0], buf[1]]);
        let proto_type = u16::from_be_bytes([buf[2], buf[3]]);
        let hw_len = buf[4] as usize;
        let proto_len = buf[5] as usize;
        let opcode = u16::from_be_bytes([buf[6], buf[7]]);

        let header_len = MIN_HEADER_LEN + 2 * hw_len + 2 * proto_len;
        if buf.len() < header_len || hw_type != HTYPE_ETHERNET || proto_type != PTYPE_IPV4 || proto_len != 4 {
            return Err(HandlerVerdict::Invalid);
        }

        let sender_mac = &buf[8..8 + hw_len];
        let sender_ip_off = 8 + hw_len;
        let sender_ip = &buf[sender_ip_off..sender_ip_off + proto_len];
        let target_mac_off = sender_ip_off + proto_len;
        let target_mac = &buf[target_mac_off..target_mac_off + hw_len];
        let target_ip_off = target_mac_off + hw_len;
        let target_ip = &buf[target_ip_off..target_ip_off + proto_len];

        let mut fields = LayerFields::new();
        fields.set("hw_type", FieldValue::Uint16(hw_type));
        fields.set("proto_type", FieldValue::Uint16(proto_type));
        fields.set("opcode", FieldValue::Uint16(opcode));
        fields.set("sender_mac", FieldValue::Bytes(sender_mac.into()));
        fields.set(
            "sender_ip",
            FieldValue::Ipv4(std::net::Ipv4Addr::new(sender_ip[0], sender_ip[1], sender_ip[2], sender_ip[3])),
        );
        fields.set("target_mac", FieldValue::Bytes(target_mac.into()));
        fields.set(
            "target_ip",
            FieldValue::Ipv4(std::net::Ipv4Addr::new(target_ip[0], target_ip[1], target_ip[2], target_ip[3])),
        );

        Ok(ParseOutcome::new(header_len, None, fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use fluxcap_core::packet::CaptureTimestamp;

    fn ts() -> CaptureTimestamp {
        CaptureTimestamp {
            monotonic: std::time::Duration::ZERO,
            wall: fluxcap_core::packet::WallClock(std::time::SystemTime::UNIX_EPOCH),
        }
    }

    #[test]
    fn parses_ethernet_ipv4_request() {
        let mut buf = vec![0u8, 1, 0x08, 0x00, 6, 4, 0, 1];
        buf.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]); // sender mac
        buf.extend_from_slice(&[10, 0, 0, 1]); // sender ip
        buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // target mac
        buf.extend_from_slice(&[10, 0, 0, 2]); // target ip

        let mut packet = Packet::new(ts(), Bytes::from(buf));
        let outcome = ArpHandlers.parse(&mut packet, 0).unwrap();
        assert_eq!(outcome.header_len, 28);
        assert_eq!(outcome.next_proto, None);
        assert_eq!(
            outcome.fields.get("sender_ip"),
            Some(&FieldValue::Ipv4(std::net::Ipv4Addr::new(10, 0, 0, 1)))
        );
        assert_eq!(outcome.fields.get("opcode"), Some(&FieldValue::Uint16(1)));
    }

    #[test]
    fn rejects_short_buffer() {
        let mut packet = Packet::new(ts(), Bytes::from_static(&[0u8; 4]));
        assert!(matches!(ArpHandlers.parse(&mut packet, 0), Err(HandlerVerdict::Invalid)));
    }
}
