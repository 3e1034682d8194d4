//! Protocol stack (C3): the per-packet array of layer frames threaded
//! through handlers as the dispatcher walks down and back up.

use std::ops::Range;
use std::sync::Arc;

use crate::registry::{CeId, ProtocolDescriptor};

/// One layer's frame in the per-packet processing stack.
pub struct StackFrame {
    pub protocol: Arc<ProtocolDescriptor>,
    pub payload: Range<usize>,
    pub ce: Option<CeId>,
    pub fwd_field: Option<&'static str>,
    pub rev_field: Option<&'static str>,
}

impl StackFrame {
    pub fn new(protocol: Arc<ProtocolDescriptor>, payload: Range<usize>) -> Self {
        let (fwd_field, rev_field) = match &protocol.conntrack_info {
            Some(info) => (Some(info.fwd_field), Some(info.rev_field)),
            None => (None, None),
        };
        StackFrame {
            protocol,
            payload,
            ce: None,
            fwd_field,
            rev_field,
        }
    }
}

/// Bound on recursion depth. `PipelineDispatcher::process_at` recurses
/// once per layer; this constant is the depth check at its top that turns
/// unbounded native recursion into a `StateCorrupted` error instead of a
/// stack overflow (spec §9's concern about unbounded recursion applies
/// here the same way it applies to the conntrack list, just via a depth
/// check rather than an arena).
pub const MAX_STACK_DEPTH: usize = 64;
