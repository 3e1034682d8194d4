//! Pipeline dispatcher (C8): `parse -> process -> recurse -> post_process`
//! (spec §4.1). Parse is strictly top-down, post-process strictly
//! bottom-up, within a single packet.

use crate::error::FluxcapError;
use crate::output::Event;
use crate::packet::Packet;
use crate::registry::{ConntrackAccess, ProcessContext, Registry};
use crate::stack::{StackFrame, MAX_STACK_DEPTH};
use crate::verdict::HandlerVerdict;

fn no_event_sink(_event: Event) {}

/// What happened to a packet after a full pipeline walk.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Reached the innermost layer (or a `Stop`) and all post-process
    /// hooks ran cleanly.
    Delivered,
    /// Dropped due to `Invalid` at some frame; the protocol's invalid
    /// counter was incremented.
    Invalid { protocol: &'static str },
    /// Dropped due to `Err`; fatal for this packet only.
    Error(FluxcapError),
}

pub struct PipelineDispatcher<'a> {
    registry: &'a Registry,
    conntrack: &'a dyn ConntrackAccess,
    events: &'a dyn Fn(Event),
}

impl<'a> PipelineDispatcher<'a> {
    pub fn new(registry: &'a Registry, conntrack: &'a dyn ConntrackAccess) -> Self {
        PipelineDispatcher { registry, conntrack, events: &no_event_sink }
    }

    /// Same as [`Self::new`], but `events` receives every event a protocol
    /// handler emits during this walk (spec §6), e.g. for delivery to the
    /// engine's registered output sinks.
    pub fn with_events(registry: &'a Registry, conntrack: &'a dyn ConntrackAccess, events: &'a dyn Fn(Event)) -> Self {
        PipelineDispatcher { registry, conntrack, events }
    }

    /// Entry point: `process(packet, link_protocol)` from spec §4.1.
    ///
    /// Every conntrack entry touched while walking `frames` is released
    /// exactly once before returning, regardless of outcome — `process_at`
    /// may return early (`Invalid`/`Err`) with some frames' CEs still held,
    /// and nothing else in the pipeline ever hands those locks back.
    pub fn process(&self, packet: &mut Packet, link_protocol: &'static str) -> DispatchOutcome {
        let mut frames: Vec<StackFrame> = Vec::new();
        let outcome = self.process_at(packet, link_protocol, &mut frames);
        self.release_all(&frames);
        outcome
    }

    /// Releases every distinct CE referenced across `frames`, in whatever
    /// order they were created. A frame's `ce` is set right after its
    /// `process` call, before the verdict is matched, so this covers every
    /// early-return path (`Invalid`, `Err`, `Stop`) as well as the normal
    /// unwind.
    fn release_all(&self, frames: &[StackFrame]) {
        let mut released: Vec<crate::registry::CeId> = Vec::new();
        for frame in frames {
            if let Some(ce) = frame.ce {
                if !released.contains(&ce) {
                    self.conntrack.release(ce);
                    released.push(ce);
                }
            }
        }
    }

    /// Re-entry point used by the fragment reassembler and multipart
    /// delivery (spec §4.3 step 5): runs the pipeline on a reassembled
    /// logical packet starting at a known next-layer protocol, with no
    /// pre-existing frames.
    pub fn process_reassembled(&self, packet: &mut Packet, next_proto: &'static str) -> DispatchOutcome {
        self.process(packet, next_proto)
    }

    fn process_at(
        &self,
        packet: &mut Packet,
        proto_name: &'static str,
        frames: &mut Vec<StackFrame>,
    ) -> DispatchOutcome {
        if frames.len() >= MAX_STACK_DEPTH {
            return DispatchOutcome::Error(FluxcapError::state_corrupted(
                None,
                format!("stack depth exceeded {MAX_STACK_DEPTH}"),
            ));
        }

        let descriptor = match self.registry.get(proto_name) {
            Some(d) => d,
            None => {
                return DispatchOutcome::Error(FluxcapError::invalid(
                    proto_name,
                    "no protocol registered under this name",
                ))
            }
        };

        let payload = packet
            .layers
            .last()
            .map(|l| l.payload.clone())
            .unwrap_or(0..packet.len());

        let k = frames.len();
        frames.push(StackFrame::new(descriptor.clone(), payload));

        // parse
        let parse_result = {
            let d = &descriptor;
            d.handlers.parse(packet, k)
        };

        let (header_len, next_proto, fields) = match parse_result {
            Ok(outcome) => (outcome.header_len, outcome.next_proto, outcome.fields),
            Err(HandlerVerdict::Invalid) => {
                descriptor
                    .counters
                    .invalid
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return DispatchOutcome::Invalid {
                    protocol: descriptor.name,
                };
            }
            Err(HandlerVerdict::Err(e)) => return DispatchOutcome::Error(e),
            Err(_) => unreachable!("parse only returns Invalid or Err as failures"),
        };

        let frame_payload = frames[k].payload.clone();
        let new_start = frame_payload.start + header_len;
        let new_payload = new_start.min(frame_payload.end)..frame_payload.end;

        if packet.layers.len() <= k {
            packet.push_layer(descriptor.name, fields, new_payload.clone());
        } else {
            packet.layers[k].payload = new_payload.clone();
            packet.layers[k].fields = fields;
        }
        frames[k].payload = new_payload;

        descriptor
            .counters
            .processed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // process
        let parent_ce = if k > 0 { frames[k - 1].ce } else { None };
        let mut ctx = ProcessContext {
            packet,
            frame_index: k,
            conntrack: self.conntrack,
            ce: frames[k].ce,
            parent_ce,
            events: self.events,
        };
        let verdict = descriptor.handlers.process(&mut ctx);
        frames[k].ce = ctx.ce;

        match verdict {
            HandlerVerdict::Err(e) => return DispatchOutcome::Error(e),
            HandlerVerdict::Invalid => {
                descriptor
                    .counters
                    .invalid
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return DispatchOutcome::Invalid {
                    protocol: descriptor.name,
                };
            }
            HandlerVerdict::Stop => {
                return self.unwind(packet, frames, k);
            }
            HandlerVerdict::Ok => {}
        }

        match next_proto {
            // One native call per layer, bounded by the `MAX_STACK_DEPTH`
            // check at the top of this function.
            Some(next) => self.process_at(packet, next, frames),
            None => self.unwind(packet, frames, k),
        }
    }

    /// Run post-process in reverse frame order for frames `0..=up_to`.
    fn unwind(
        &self,
        packet: &mut Packet,
        frames: &mut Vec<StackFrame>,
        up_to: usize,
    ) -> DispatchOutcome {
        for k in (0..=up_to).rev() {
            let descriptor = frames[k].protocol.clone();
            let parent_ce = if k > 0 { frames[k - 1].ce } else { None };
            let mut ctx = ProcessContext {
                packet,
                frame_index: k,
                conntrack: self.conntrack,
                ce: frames[k].ce,
                parent_ce,
                events: self.events,
            };
            match descriptor.handlers.post_process(&mut ctx) {
                HandlerVerdict::Err(e) => return DispatchOutcome::Error(e),
                HandlerVerdict::Invalid => {
                    descriptor
                        .counters
                        .invalid
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return DispatchOutcome::Invalid {
                        protocol: descriptor.name,
                    };
                }
                HandlerVerdict::Ok | HandlerVerdict::Stop => {}
            }
        }
        DispatchOutcome::Delivered
    }
}
