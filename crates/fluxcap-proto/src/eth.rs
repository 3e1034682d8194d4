//! Ethernet II framing: the link-layer entry point every capture starts
//! from. No conntrack wiring of its own — it only picks the next
//! protocol by ethertype.

use fluxcap_core::field::{FieldKind, FieldSchemaEntry, FieldValue, LayerFields};
use fluxcap_core::packet::Packet;
use fluxcap_core::registry::{ParseOutcome, ProtocolHandlers};
use fluxcap_core::verdict::HandlerVerdict;

const HEADER_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;

pub struct EthHandlers;

pub fn field_schema() -> Vec<FieldSchemaEntry> {
    vec![
        FieldSchemaEntry { name: "dst_mac", kind: FieldKind::Bytes, description: "destination MAC address" },
        FieldSchemaEntry { name: "src_mac", kind: FieldKind::Bytes, description: "source MAC address" },
        FieldSchemaEntry { name: "ethertype", kind: FieldKind::Uint16, description: "EtherType" },
    ]
}

impl ProtocolHandlers for EthHandlers {
    fn parse(&self, packet: &mut Packet, frame_index: usize) -> Result<ParseOutcome, HandlerVerdict> {
        let range = packet
            .layers
            .get(frame_index)
            .map(|l| l.payload.clone())
            .unwrap_or(0..packet.len());
        let buf = &packet.bytes[range];
        if buf.len() < HEADER_LEN {
            return Err(HandlerVerdict::Invalid);
        }

        let ethertype = u16::from_be_bytes([buf[12], buf[13]]);
        let mut fields = LayerFields::new();
        fields.set("dst_mac", FieldValue::Bytes(buf[0..6].into()));
        fields.set("src_mac", FieldValue::Bytes(buf[6..12].into()));
        fields.set("ethertype", FieldValue::Uint16(ethertype));

        let next_proto = match ethertype {
            ETHERTYPE_IPV4 => Some("ipv4"),
            ETHERTYPE_ARP => Some("arp"),
            _ => None,
        };

        Ok(ParseOutcome::new(HEADER_LEN, next_proto, fields))
    }
}
