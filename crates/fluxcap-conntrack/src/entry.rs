//! Conntrack entry (CE, spec §3): forward/reverse keys, parent linkage,
//! per-entry lock, private state slot and last-seen timestamp.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use fluxcap_core::registry::{CeId, PrivateState};
use parking_lot::{Condvar, Mutex};

/// A single bidirectional flow at one protocol layer. Reachable only
/// through [`crate::table::ConntrackTable`] — there is no raw pointer
/// cycle here, matching the re-architecture note in spec §9: CEs live in
/// a flat arena and reference each other only by [`CeId`].
pub struct ConntrackEntry {
    pub id: CeId,
    pub protocol: &'static str,
    pub created_fwd_key: Vec<u8>,
    pub created_rev_key: Vec<u8>,
    pub parent: Option<CeId>,
    pub ttl: Duration,
    children: Mutex<Vec<CeId>>,
    last_seen: Mutex<Instant>,
    private: Mutex<HashMap<&'static str, Box<dyn PrivateState>>>,
    /// The per-entry lock `ConntrackTable::get_or_create`/`release` hand
    /// out to callers (spec §4.2). A plain bool behind a condvar rather
    /// than a second `Mutex` guard type, since the lock is taken in one
    /// call (`get_or_create`) and released from a different one
    /// (`release`) — no guard value can outlive either call.
    held: Mutex<bool>,
    held_cv: Condvar,
    /// Per-CE processed count (spec §8 invariant 2). Incremented once per
    /// `release`, under the same per-entry lock that already serializes
    /// concurrent packets on this CE, so increments are strictly ordered.
    processed: AtomicU64,
}

impl ConntrackEntry {
    pub fn new(
        id: CeId,
        protocol: &'static str,
        created_fwd_key: Vec<u8>,
        created_rev_key: Vec<u8>,
        parent: Option<CeId>,
        ttl: Duration,
    ) -> Self {
        ConntrackEntry {
            id,
            protocol,
            created_fwd_key,
            created_rev_key,
            parent,
            ttl,
            children: Mutex::new(Vec::new()),
            last_seen: Mutex::new(Instant::now()),
            private: Mutex::new(HashMap::new()),
            held: Mutex::new(false),
            held_cv: Condvar::new(),
            processed: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Blocks until the per-entry lock is free, then takes it.
    pub fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.held_cv.wait(&mut held);
        }
        *held = true;
    }

    /// Releases the per-entry lock taken by `acquire`, touches
    /// `last_seen` (the "TTL reposition" spec §4.2 bundles into
    /// `release`), and bumps the processed count.
    pub fn release(&self) {
        self.touch();
        self.processed.fetch_add(1, Ordering::SeqCst);
        *self.held.lock() = false;
        self.held_cv.notify_one();
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen()) >= self.ttl
    }

    pub fn add_child(&self, child: CeId) {
        self.children.lock().push(child);
    }

    pub fn children(&self) -> Vec<CeId> {
        self.children.lock().clone()
    }

    /// Run `f` against this protocol's private state, lazily constructing
    /// it with `init` on first access. Released (dropped) only when the
    /// entry itself is torn down, never partially.
    pub fn with_private_state(
        &self,
        protocol: &'static str,
        init: &mut dyn FnMut() -> Box<dyn PrivateState>,
        f: &mut dyn FnMut(&mut dyn Any),
    ) {
        let mut guard = self.private.lock();
        let state = guard.entry(protocol).or_insert_with(|| init());
        f(state.as_any_mut());
    }

    /// Runs every protocol's `cleanup` hook over whatever private state is
    /// present, then drops the slots. Called exactly once, under the
    /// table's removal path, never concurrently with `with_private_state`.
    pub fn release_private_state(&self, mut cleanup: impl FnMut(&'static str, &mut dyn Any)) {
        let mut guard = self.private.lock();
        for (protocol, mut state) in guard.drain() {
            cleanup(protocol, state.as_any_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32);

    #[test]
    fn is_expired_once_ttl_elapses() {
        let entry = ConntrackEntry::new(1, "ipv4", vec![1], vec![2], None, Duration::from_millis(10));
        assert!(!entry.is_expired(Instant::now()));
        assert!(entry.is_expired(Instant::now() + Duration::from_millis(20)));
    }

    #[test]
    fn touch_resets_the_expiry_clock() {
        let entry = ConntrackEntry::new(1, "ipv4", vec![1], vec![2], None, Duration::from_millis(50));
        let later = Instant::now() + Duration::from_millis(40);
        assert!(!entry.is_expired(later));
        entry.touch();
        assert!(!entry.is_expired(later));
    }

    #[test]
    fn private_state_is_lazily_initialized_once() {
        let entry = ConntrackEntry::new(1, "sip", vec![1], vec![2], None, Duration::from_secs(1));
        let mut init_calls = 0;

        for _ in 0..3 {
            entry.with_private_state(
                "sip",
                &mut || {
                    init_calls += 1;
                    Box::new(Counter(0))
                },
                &mut |state| {
                    state.downcast_mut::<Counter>().unwrap().0 += 1;
                },
            );
        }

        assert_eq!(init_calls, 1);
        entry.with_private_state("sip", &mut || Box::new(Counter(0)), &mut |state| {
            assert_eq!(state.downcast_mut::<Counter>().unwrap().0, 3);
        });
    }

    #[test]
    fn release_private_state_drains_every_protocol_exactly_once() {
        let entry = ConntrackEntry::new(1, "ipv4", vec![1], vec![2], None, Duration::from_secs(1));
        entry.with_private_state("sip", &mut || Box::new(Counter(1)), &mut |_| {});
        entry.with_private_state("rtp", &mut || Box::new(Counter(2)), &mut |_| {});

        let mut released = Vec::new();
        entry.release_private_state(|protocol, _state| released.push(protocol));
        released.sort_unstable();
        assert_eq!(released, vec!["rtp", "sip"]);

        let mut released_again = Vec::new();
        entry.release_private_state(|protocol, _state| released_again.push(protocol));
        assert!(released_again.is_empty());
    }

    #[test]
    fn children_are_recorded_in_insertion_order() {
        let entry = ConntrackEntry::new(1, "ipv4", vec![1], vec![2], None, Duration::from_secs(1));
        entry.add_child(2);
        entry.add_child(3);
        assert_eq!(entry.children(), vec![2, 3]);
    }

    #[test]
    fn release_bumps_processed_count_and_frees_the_lock_for_the_next_acquire() {
        let entry = ConntrackEntry::new(1, "ipv4", vec![1], vec![2], None, Duration::from_secs(1));
        assert_eq!(entry.processed_count(), 0);

        entry.acquire();
        entry.release();
        assert_eq!(entry.processed_count(), 1);

        entry.acquire();
        entry.release();
        assert_eq!(entry.processed_count(), 2);
    }

    #[test]
    fn acquire_blocks_a_second_thread_until_release() {
        use std::sync::Arc;
        let entry = Arc::new(ConntrackEntry::new(1, "ipv4", vec![1], vec![2], None, Duration::from_secs(1)));
        entry.acquire();

        let other = entry.clone();
        let handle = std::thread::spawn(move || {
            other.acquire();
            other.release();
        });

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(entry.processed_count(), 0, "second acquire must still be blocked");
        entry.release();

        handle.join().unwrap();
        assert_eq!(entry.processed_count(), 2);
    }
}
