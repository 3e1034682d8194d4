//! UDP transport: a flat 8-byte header, then routing to whichever
//! application protocol owns this flow — by well-known port (SIP) or by
//! a binding an application protocol registered ahead of time from a
//! negotiation it observed (RTP, spec §4.5 / scenario S4).

use std::sync::Arc;

use fluxcap_core::field::{FieldKind, FieldSchemaEntry, FieldValue, LayerFields};
use fluxcap_core::packet::Packet;
use fluxcap_core::registry::{ConntrackInfo, ParseOutcome, ProcessContext, ProtocolHandlers};
use fluxcap_core::verdict::HandlerVerdict;

use crate::fields::u16_field;
use crate::routing::{self, PortRouter};

const HEADER_LEN: usize = 8;
const SIP_PORT: u16 = 5060;

pub struct UdpHandlers {
    port_router: Arc<PortRouter>,
}

impl UdpHandlers {
    pub fn new(port_router: Arc<PortRouter>) -> Self {
        UdpHandlers { port_router }
    }
}

pub fn field_schema() -> Vec<FieldSchemaEntry> {
    vec![
        FieldSchemaEntry { name: "src_port", kind: FieldKind::Uint16, description: "source port" },
        FieldSchemaEntry { name: "dst_port", kind: FieldKind::Uint16, description: "destination port" },
        FieldSchemaEntry { name: "length", kind: FieldKind::Uint16, description: "UDP length, header + data" },
    ]
}

pub fn conntrack_info() -> ConntrackInfo {
    ConntrackInfo {
        default_table_size: 8192,
        fwd_field: "src_port",
        rev_field: "dst_port",
    }
}

impl ProtocolHandlers for UdpHandlers {
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

        let src_port = u16::from_be_bytes([buf[0], buf[1]]);
        let dst_port = u16::from_be_bytes([buf[2], buf[3]]);
        let length = u16::from_be_bytes([buf[4], buf[5]]);

        let mut fields = LayerFields::new();
        fields.set("src_port", FieldValue::Uint16(src_port));
        fields.set("dst_port", FieldValue::Uint16(dst_port));
        fields.set("length", FieldValue::Uint16(length));

        let mut next_proto = if src_port == SIP_PORT || dst_port == SIP_PORT {
            Some("sip")
        } else {
            None
        };

        if next_proto.is_none() && frame_index > 0 {
            if let Some(ip_layer) = packet.layers.get(frame_index - 1) {
                let src_ip = ip_layer.fields.get("src_addr").and_then(|v| match v {
                    FieldValue::Ipv4(ip) => Some(*ip),
                    _ => None,
                });
                let dst_ip = ip_layer.fields.get("dst_addr").and_then(|v| match v {
                    FieldValue::Ipv4(ip) => Some(*ip),
                    _ => None,
                });
                if let (Some(src_ip), Some(dst_ip)) = (src_ip, dst_ip) {
                    if self.port_router.lookup(src_ip, src_port).is_some()
                        || self.port_router.lookup(dst_ip, dst_port).is_some()
                    {
                        next_proto = Some("rtp");
                    }
                }
            }
        }

        Ok(ParseOutcome::new(HEADER_LEN, next_proto, fields))
    }

    fn process(&self, ctx: &mut ProcessContext) -> HandlerVerdict {
        let (fwd, rev) = match routing::udp_keys_from_packet(ctx.packet, ctx.frame_index) {
            Some(keys) => keys,
            None => {
                // No IP layer beneath (e.g. a direct unit test feeding raw
                // UDP bytes): fall back to the UDP header alone.
                let fields = &ctx.packet.layers[ctx.frame_index].fields;
                let src_port = match u16_field(fields, "udp", "src_port") {
                    Ok(v) => v,
                    Err(v) => return v,
                };
                let dst_port = match u16_field(fields, "udp", "dst_port") {
                    Ok(v) => v,
                    Err(v) => return v,
                };
                (src_port.to_be_bytes().to_vec(), dst_port.to_be_bytes().to_vec())
            }
        };

        match ctx.conntrack.get_or_create("udp", &fwd, &rev, ctx.parent_ce) {
            Ok((ce, _direction, _created)) => {
                ctx.ce = Some(ce);
                HandlerVerdict::Ok
            }
            Err(e) => HandlerVerdict::Err(e),
        }
    }
}
