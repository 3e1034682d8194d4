//! Fragment reassembler (C5, spec §4.3): offset-keyed, gap-tracked
//! reconstruction of network-layer fragments (e.g. IPv4), bound to the
//! parent conntrack entry's private state and keyed by datagram id.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use fluxcap_conntrack::timer::{TimerHandle, TimerWheel};
use fluxcap_core::registry::{CeId, ConntrackAccess, PrivateState};
use tracing::debug;

use crate::multipart::Multipart;

/// A single in-flight fragment reassembly, keyed by datagram id within a
/// [`FragTable`]. Lives on the parent CE's private list; destroyed when
/// processed or timed out (spec §3 "Fragment entry").
struct FragEntry {
    multipart: Option<Multipart>,
    processed: bool,
    timer: TimerHandle,
}

/// Per-protocol private state: every fragmenting protocol (there is
/// usually just one, e.g. IPv4) owns one of these under its own state
/// key, so two protocols never collide on datagram ids.
#[derive(Default)]
pub struct FragTable {
    entries: HashMap<u64, FragEntry>,
}

impl FragTable {
    fn boxed() -> Box<dyn PrivateState> {
        Box::new(FragTable::default())
    }
}

/// Outcome of handing one fragment to the reassembler. The fragment
/// itself is never forwarded as-is (spec §4.3 step 6) — both variants
/// mean "stop", `Invalid` additionally means "count it".
pub enum FragmentOutcome {
    Stopped,
    Invalid,
}

/// Bound on a single IPv4-style fragment offset/size, per spec §4.3 step 1
/// and §8 invariant 8.
const MAX_DATAGRAM_LEN: usize = 65535;

pub struct FragmentReassembler {
    conntrack: Arc<dyn ConntrackAccess>,
    timers: Arc<TimerWheel>,
    frag_timeout_secs: f64,
}

impl FragmentReassembler {
    pub fn new(
        conntrack: Arc<dyn ConntrackAccess>,
        timers: Arc<TimerWheel>,
        frag_timeout_secs: f64,
    ) -> Self {
        FragmentReassembler {
            conntrack,
            timers,
            frag_timeout_secs,
        }
    }

    /// Handles one fragment with `(offset, size, more_fragments)` (spec
    /// §4.3). `payload` is the fragment's own payload bytes (already a
    /// zero-copy slice of its source packet); `next_proto` is the
    /// next-layer protocol resolved from the first fragment's header
    /// fields, if known. On becoming deliverable, `on_deliver` is called
    /// with the reassembled bytes and the next-layer protocol name — the
    /// caller (a protocol module, which already holds a dispatcher and
    /// registry reference) re-enters the pipeline with them.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_fragment(
        &self,
        ce: CeId,
        state_key: &'static str,
        datagram_id: u64,
        offset: usize,
        payload: Bytes,
        more_fragments: bool,
        next_proto: Option<&'static str>,
        on_deliver: &mut dyn FnMut(Bytes, &'static str),
    ) -> FragmentOutcome {
        let size = payload.len();
        if offset + size > MAX_DATAGRAM_LEN {
            return FragmentOutcome::Invalid;
        }

        let timers = self.timers.clone();
        let conntrack_for_timeout = self.conntrack.clone();
        let frag_timeout_secs = self.frag_timeout_secs;
        let mut deliverable: Option<(Bytes, &'static str)> = None;

        let outcome = self.conntrack.with_private_state(
            ce,
            state_key,
            &mut FragTable::boxed,
            &mut |state: &mut dyn Any| {
                let table = state
                    .downcast_mut::<FragTable>()
                    .expect("state_key is scoped to a FragTable for this protocol");

                if !table.entries.contains_key(&datagram_id) {
                    let Some(next) = next_proto else {
                        // Next-layer protocol could not be resolved: mark
                        // processed and stop, without delivery (spec §4.3
                        // step 2).
                        table.entries.insert(
                            datagram_id,
                            FragEntry {
                                multipart: None,
                                processed: true,
                                timer: timers.alloc(|| {}),
                            },
                        );
                        return;
                    };

                    let timeout_conntrack = conntrack_for_timeout.clone();
                    let timer = timers.alloc(move || {
                        on_fragment_timeout(timeout_conntrack.as_ref(), ce, state_key, datagram_id);
                    });
                    table.entries.insert(
                        datagram_id,
                        FragEntry {
                            multipart: Some(Multipart::new(next)),
                            processed: false,
                            timer,
                        },
                    );
                }

                let entry = table.entries.get_mut(&datagram_id).unwrap();
                if entry.processed {
                    return;
                }
                let Some(mp) = entry.multipart.as_mut() else {
                    return;
                };

                mp.insert(offset, payload.clone());
                if !more_fragments {
                    mp.mark_got_last(offset + size);
                }
                timers.queue(entry.timer, frag_timeout_secs);

                if mp.is_deliverable() {
                    entry.processed = true;
                    let assembled = mp.assemble();
                    let proto = mp.next_proto;
                    timers.cleanup(entry.timer);
                    table.entries.remove(&datagram_id);
                    deliverable = Some((assembled, proto));
                }
            },
        );

        if outcome.is_err() {
            return FragmentOutcome::Invalid;
        }

        if let Some((bytes, proto)) = deliverable {
            on_deliver(bytes, proto);
        }

        FragmentOutcome::Stopped
    }
}

/// Timeout handler (spec §4.3 final paragraph, §9 open question): runs
/// under the CE's private-state lock (via `with_private_state`) and
/// re-checks `processed` before touching the multipart, closing the race
/// the original engine had between the timer thread and
/// `packet_multipart_process`.
fn on_fragment_timeout(
    conntrack: &dyn ConntrackAccess,
    ce: CeId,
    state_key: &'static str,
    datagram_id: u64,
) {
    let _ = conntrack.with_private_state(ce, state_key, &mut FragTable::boxed, &mut |state: &mut dyn Any| {
        let Some(table) = state.downcast_mut::<FragTable>() else {
            return;
        };
        if let Some(entry) = table.entries.remove(&datagram_id) {
            if !entry.processed {
                debug!(datagram_id, "cleaning up unprocessed fragment");
            }
            // `entry.multipart`, if any, drops here along with its chunks.
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxcap_conntrack::ConntrackTable;
    use std::time::Duration;

    fn new_ce(conntrack: &Arc<dyn ConntrackAccess>) -> CeId {
        let (id, _, _) = conntrack
            .get_or_create("ipv4", b"frag-a", b"frag-b", None)
            .unwrap();
        id
    }

    #[test]
    fn in_order_fragments_reassemble_and_deliver_once() {
        let conntrack: Arc<dyn ConntrackAccess> = Arc::new(ConntrackTable::new(4, Duration::from_secs(30)));
        let timers = TimerWheel::new();
        let reassembler = FragmentReassembler::new(conntrack.clone(), timers, 30.0);
        let ce = new_ce(&conntrack);

        let mut delivered = None;
        reassembler.handle_fragment(
            ce,
            "ipv4_frag",
            1,
            0,
            Bytes::from_static(b"hello "),
            true,
            Some("udp"),
            &mut |_, _| panic!("must not deliver before the final fragment"),
        );
        reassembler.handle_fragment(
            ce,
            "ipv4_frag",
            1,
            6,
            Bytes::from_static(b"world"),
            false,
            Some("udp"),
            &mut |bytes, proto| delivered = Some((bytes, proto)),
        );

        let (bytes, proto) = delivered.expect("reassembly completes on the final fragment");
        assert_eq!(&bytes[..], b"hello world");
        assert_eq!(proto, "udp");
    }

    #[test]
    fn out_of_order_fragments_reassemble_once_the_gap_closes() {
        let conntrack: Arc<dyn ConntrackAccess> = Arc::new(ConntrackTable::new(4, Duration::from_secs(30)));
        let timers = TimerWheel::new();
        let reassembler = FragmentReassembler::new(conntrack.clone(), timers, 30.0);
        let ce = new_ce(&conntrack);

        let mut delivered = None;
        reassembler.handle_fragment(
            ce,
            "ipv4_frag",
            2,
            6,
            Bytes::from_static(b"world"),
            false,
            Some("udp"),
            &mut |_, _| panic!("must not deliver with a gap at the front"),
        );
        reassembler.handle_fragment(
            ce,
            "ipv4_frag",
            2,
            0,
            Bytes::from_static(b"hello "),
            true,
            Some("udp"),
            &mut |bytes, proto| delivered = Some((bytes, proto)),
        );

        let (bytes, proto) = delivered.expect("reassembly completes once the gap is filled");
        assert_eq!(&bytes[..], b"hello world");
        assert_eq!(proto, "udp");
    }

    #[test]
    fn fragment_exceeding_the_datagram_ceiling_is_invalid() {
        let conntrack: Arc<dyn ConntrackAccess> = Arc::new(ConntrackTable::new(4, Duration::from_secs(30)));
        let timers = TimerWheel::new();
        let reassembler = FragmentReassembler::new(conntrack.clone(), timers, 30.0);
        let ce = new_ce(&conntrack);

        let outcome = reassembler.handle_fragment(
            ce,
            "ipv4_frag",
            3,
            MAX_DATAGRAM_LEN - 2,
            Bytes::from_static(b"abcd"),
            true,
            Some("udp"),
            &mut |_, _| panic!("oversized datagram must not deliver"),
        );

        assert!(matches!(outcome, FragmentOutcome::Invalid));
    }

    #[test]
    fn unresolvable_next_protocol_marks_processed_without_delivery() {
        let conntrack: Arc<dyn ConntrackAccess> = Arc::new(ConntrackTable::new(4, Duration::from_secs(30)));
        let timers = TimerWheel::new();
        let reassembler = FragmentReassembler::new(conntrack.clone(), timers, 30.0);
        let ce = new_ce(&conntrack);

        reassembler.handle_fragment(
            ce,
            "ipv4_frag",
            4,
            0,
            Bytes::from_static(b"first"),
            true,
            None,
            &mut |_, _| panic!("no next_proto means no delivery"),
        );

        // A later fragment for the same datagram id is a no-op: the entry
        // was already marked processed.
        reassembler.handle_fragment(
            ce,
            "ipv4_frag",
            4,
            5,
            Bytes::from_static(b"second"),
            false,
            Some("udp"),
            &mut |_, _| panic!("processed datagrams never deliver"),
        );
    }
}
