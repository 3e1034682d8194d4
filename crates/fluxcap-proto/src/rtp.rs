//! Minimal RTP header parsing. Reached only by a UDP flow the [`crate::
//! routing::PortRouter`] has bound, following a SIP/SDP negotiation — see
//! `sip.rs`. No conntrack state of its own; this engine doesn't model
//! jitter buffers or payload decoding.

use fluxcap_core::field::{FieldKind, FieldSchemaEntry, FieldValue, LayerFields};
use fluxcap_core::packet::Packet;
use fluxcap_core::registry::{ParseOutcome, ProtocolHandlers};
use fluxcap_core::verdict::HandlerVerdict;

const HEADER_LEN: usize = 12;

pub struct RtpHandlers;

pub fn field_schema() -> Vec<FieldSchemaEntry> {
    vec![
        FieldSchemaEntry { name: "version", kind: FieldKind::Uint8, description: "RTP version" },
        FieldSchemaEntry { name: "payload_type", kind: FieldKind::Uint8, description: "RTP payload type" },
        FieldSchemaEntry { name: "sequence", kind: FieldKind::Uint16, description: "sequence number" },
        FieldSchemaEntry { name: "timestamp", kind: FieldKind::Uint32, description: "RTP timestamp" },
        FieldSchemaEntry { name: "ssrc", kind: FieldKind::Uint32, description: "synchronization source id" },
    ]
}

impl ProtocolHandlers for RtpHandlers {
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

        let version = buf[0] >> 6;
        let payload_type = buf[1] & 0x7f;
        let sequence = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        if version != 2 {
            return Err(HandlerVerdict::Invalid);
        }

        let mut fields = LayerFields::new();
        fields.set("version", FieldValue::Uint8(version));
        fields.set("payload_type", FieldValue::Uint8(payload_type));
        fields.set("sequence", FieldValue::Uint16(sequence));
        fields.set("timestamp", FieldValue::Uint32(timestamp));
        fields.set("ssrc", FieldValue::Uint32(ssrc));

        Ok(ParseOutcome::new(HEADER_LEN, None, fields))
    }
}
