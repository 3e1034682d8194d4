//! `tracing`-backed [`EventSink`] (spec §6, §10's `output_log` analogue):
//! one log line per event, fields rendered in declaration order, the same
//! structure `output_log_txt` gives a subscribed event kind.

use fluxcap_core::output::{Event, EventSink};
use tracing::info;

/// Emits every subscribed event as a single structured `tracing` line.
/// Unlike `output_log`'s txt/xml split, there's one renderer here — format
/// is a concern for whatever `tracing` subscriber the binary installs, not
/// this sink.
pub struct TracingEventSink {
    kinds: Vec<&'static str>,
}

impl TracingEventSink {
    pub fn new(kinds: Vec<&'static str>) -> Self {
        TracingEventSink { kinds }
    }

    fn render_fields(event: &Event) -> String {
        let mut out = String::new();
        for (name, value) in event.fields.iter() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(name);
            out.push('=');
            out.push_str(&value.print());
        }
        out
    }
}

impl EventSink for TracingEventSink {
    fn subscribed_kinds(&self) -> &[&'static str] {
        &self.kinds
    }

    fn emit(&self, event: &Event) {
        let fields = Self::render_fields(event);
        let payload_len = event.payload.as_ref().map(|p| p.len()).unwrap_or(0);
        info!(kind = event.kind, payload_len, "{fields}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxcap_core::field::{FieldValue, LayerFields};

    #[test]
    fn renders_fields_in_declaration_order() {
        let mut fields = LayerFields::new();
        fields.set("src_port", FieldValue::Uint16(5060));
        fields.set("dst_port", FieldValue::Uint16(5060));
        let event = Event {
            kind: "sip_invite",
            fields,
            payload: None,
        };
        let rendered = TracingEventSink::render_fields(&event);
        assert_eq!(rendered, "src_port=5060 dst_port=5060");
    }

    #[test]
    fn reports_subscribed_kinds() {
        let sink = TracingEventSink::new(vec!["sip_invite", "rtp_flow"]);
        assert_eq!(sink.subscribed_kinds(), &["sip_invite", "rtp_flow"]);
    }
}
