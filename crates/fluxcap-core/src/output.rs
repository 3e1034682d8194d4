//! Output / event plugin interface (spec §6): subscribers receive
//! `{event_kind, parsed_fields, payload_stream}` from a protocol's
//! post-process hook.

use crate::field::LayerFields;

/// One emitted event. `payload` is the raw bytes the event pertains to
/// (e.g. a reassembled SIP message body), if any.
pub struct Event {
    pub kind: &'static str,
    pub fields: LayerFields,
    pub payload: Option<Vec<u8>>,
}

/// An output collaborator subscribed to named event kinds.
pub trait EventSink: Send + Sync {
    fn subscribed_kinds(&self) -> &[&'static str];
    fn emit(&self, event: &Event);
}
