//! SIP (spec §4.4's line-mode protocol): drives the generic
//! [`fluxcap_reassembly::stream`] state machine per direction, and on an
//! SDP body offering a media address, binds the negotiated `(ip, port)`
//! to `rtp` both in the [`crate::routing::PortRouter`] (so the next
//! packet on that flow parses correctly) and as a conntrack
//! [`fluxcap_core::registry::ConntrackAccess::register_expectation`]
//! (so the dialog hears about the CE once, per spec §4.5).

use std::any::Any;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use fluxcap_core::field::{FieldKind, FieldSchemaEntry, FieldValue, LayerFields};
use fluxcap_core::output::Event;
use fluxcap_core::packet::Packet;
use fluxcap_core::registry::{CeId, ConntrackInfo, Direction, ParseOutcome, ProcessContext, ProtocolHandlers};
use fluxcap_core::verdict::HandlerVerdict;
use fluxcap_reassembly::stream::{StreamParser, TextState};
use tracing::debug;

use crate::routing::{self, matches_known_endpoint, PortRouter};

const MAX_HEADER_LINE: usize = 4096;
const SIP_EXPECTATION_TTL: Duration = Duration::from_secs(32);
const METHODS: [&str; 8] = ["INVITE", "ACK", "BYE", "CANCEL", "OPTIONS", "REGISTER", "PRACK", "UPDATE"];

pub struct SipHandlers {
    port_router: Arc<PortRouter>,
}

impl SipHandlers {
    pub fn new(port_router: Arc<PortRouter>) -> Self {
        SipHandlers { port_router }
    }
}

pub fn field_schema() -> Vec<FieldSchemaEntry> {
    vec![FieldSchemaEntry {
        name: "first_line",
        kind: FieldKind::String,
        description: "the request or status line",
    }]
}

pub fn conntrack_info() -> ConntrackInfo {
    ConntrackInfo {
        default_table_size: 4096,
        fwd_field: "src_port",
        rev_field: "dst_port",
    }
}

fn looks_like_sip(buf: &[u8]) -> bool {
    let end = buf.iter().position(|&b| b == b'\n').unwrap_or(buf.len());
    let line = String::from_utf8_lossy(&buf[..end]);
    let line = line.trim_end_matches('\r');
    if line.starts_with("SIP/2.0") {
        return true;
    }
    line.split_whitespace()
        .next()
        .map(|tok| METHODS.contains(&tok))
        .unwrap_or(false)
}

struct SipDirState {
    parser: StreamParser,
    state: TextState,
    first_line: Option<String>,
    headers: Vec<(String, String)>,
}

impl Default for SipDirState {
    fn default() -> Self {
        SipDirState {
            parser: StreamParser::new(MAX_HEADER_LINE),
            state: TextState::default(),
            first_line: None,
            headers: Vec::new(),
        }
    }
}

#[derive(Default)]
struct SipPrivate {
    dirs: [SipDirState; 2],
}

impl SipPrivate {
    fn boxed() -> Box<dyn fluxcap_core::registry::PrivateState> {
        Box::new(SipPrivate::default())
    }
}

fn content_length(headers: &[(String, String)]) -> usize {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0)
}

/// Scans an SDP body for the `c=` connection address and the first `m=`
/// media port (spec §4.5 / scenario S4's "the SDP body", simplified to
/// the two lines that matter for binding).
fn parse_sdp_media(body: &[u8]) -> Option<(Ipv4Addr, u16)> {
    let text = String::from_utf8_lossy(body);
    let mut ip = None;
    let mut port = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
            ip = rest.trim().parse::<Ipv4Addr>().ok();
        } else if let Some(rest) = line.strip_prefix("m=") {
            if let Some(port_str) = rest.split_whitespace().nth(1) {
                port = port_str.parse::<u16>().ok();
            }
        }
    }
    ip.zip(port)
}

impl ProtocolHandlers for SipHandlers {
    fn parse(&self, packet: &mut Packet, frame_index: usize) -> Result<ParseOutcome, HandlerVerdict> {
        let range = packet
            .layers
            .get(frame_index)
            .map(|l| l.payload.clone())
            .unwrap_or(0..packet.len());
        let buf = &packet.bytes[range];
        if buf.is_empty() || !looks_like_sip(buf) {
            return Err(HandlerVerdict::Invalid);
        }

        let mut fields = LayerFields::new();
        let end = buf.iter().position(|&b| b == b'\n').unwrap_or(buf.len());
        let first_line = String::from_utf8_lossy(&buf[..end]).trim_end_matches('\r').to_string();
        fields.set("first_line", FieldValue::String(first_line.into()));

        // Header length 0: the whole message stays in this frame's
        // payload for `process` to walk with the stream parser, rather
        // than being consumed up front the way a fixed-size header is.
        Ok(ParseOutcome::new(0, None, fields))
    }

    fn process(&self, ctx: &mut ProcessContext) -> HandlerVerdict {
        if ctx.frame_index == 0 {
            return HandlerVerdict::Err(fluxcap_core::error::FluxcapError::state_corrupted(
                None,
                "sip: no transport layer beneath",
            ));
        }

        let (fwd, rev) = match routing::udp_keys_from_packet(ctx.packet, ctx.frame_index - 1) {
            Some(keys) => keys,
            None => {
                return HandlerVerdict::Err(fluxcap_core::error::FluxcapError::state_corrupted(
                    None,
                    "sip: could not derive transport key from surrounding layers",
                ))
            }
        };

        let (ce, direction, _created) = match ctx.conntrack.get_or_create("sip", &fwd, &rev, ctx.parent_ce) {
            Ok(v) => v,
            Err(e) => return HandlerVerdict::Err(e),
        };
        ctx.ce = Some(ce);

        let payload_range = ctx.packet.layers[ctx.frame_index].payload.clone();
        let bytes = ctx.packet.bytes.slice(payload_range);
        let dir_idx = match direction {
            Direction::Fwd => 0,
            Direction::Rev => 1,
        };

        let mut sdp_media: Option<(Ipv4Addr, u16)> = None;
        let mut invalid = false;

        let result = ctx.conntrack.with_private_state(ce, "sip", &mut SipPrivate::boxed, &mut |state: &mut dyn Any| {
            let private = state
                .downcast_mut::<SipPrivate>()
                .expect("state_key 'sip' is scoped to SipPrivate");
            let dir = &mut private.dirs[dir_idx];
            dir.parser.feed(&bytes);

            loop {
                match dir.state {
                    TextState::FirstLine => match dir.parser.next_line() {
                        Ok(Some(line)) => {
                            dir.first_line = Some(String::from_utf8_lossy(&line).into_owned());
                            dir.state = TextState::Headers;
                        }
                        Ok(None) => break,
                        Err(_) => {
                            invalid = true;
                            break;
                        }
                    },
                    TextState::Headers => match dir.parser.next_line() {
                        Ok(Some(line)) if line.is_empty() => {
                            let remaining = content_length(&dir.headers);
                            dir.state = TextState::Body { remaining };
                        }
                        Ok(Some(line)) => {
                            if let Some(pos) = line.iter().position(|&b| b == b':') {
                                let name = String::from_utf8_lossy(&line[..pos]).trim().to_string();
                                let value = String::from_utf8_lossy(&line[pos + 1..]).trim().to_string();
                                dir.headers.push((name, value));
                            }
                        }
                        Ok(None) => break,
                        Err(_) => {
                            invalid = true;
                            break;
                        }
                    },
                    TextState::Body { remaining } => match dir.parser.next_exact(remaining) {
                        Some(body) => {
                            sdp_media = parse_sdp_media(&body);
                            dir.headers.clear();
                            dir.first_line = None;
                            dir.state = TextState::FirstLine;
                        }
                        None => break,
                    },
                }
            }
        });

        if result.is_err() {
            return HandlerVerdict::Err(fluxcap_core::error::FluxcapError::state_corrupted(
                Some(ce),
                "sip: conntrack entry vanished mid-dialog",
            ));
        }
        if invalid {
            return HandlerVerdict::Invalid;
        }

        if let Some((ip, port)) = sdp_media {
            self.port_router.bind(ip, port, "rtp");
            let dialog_ce = ce;
            ctx.conntrack.register_expectation(
                "udp",
                Box::new(matches_known_endpoint(ip, port)),
                SIP_EXPECTATION_TTL,
                dialog_ce,
                Box::new(move |new_ce: CeId, owner_cookie: u64| {
                    debug!(dialog = owner_cookie, media_ce = new_ce, "SDP-negotiated media flow bound");
                }),
            );

            let mut fields = LayerFields::new();
            fields.set("media_ip", FieldValue::Ipv4(ip));
            fields.set("media_port", FieldValue::Uint16(port));
            (ctx.events)(Event { kind: "sip_sdp_bound", fields, payload: None });
        }

        HandlerVerdict::Stop
    }
}
