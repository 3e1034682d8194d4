//! Sharded conntrack table (C4, spec §4.2). Shard index is
//! `hash(fwd_key) XOR hash(rev_key)` so both directions of a flow always
//! land in the same shard, which is what lets `get_or_create` resolve a
//! simultaneous-open race (scenario S3) without a global lock.

use std::any::Any;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fluxcap_core::error::FluxcapError;
use fluxcap_core::registry::{CeId, ConntrackAccess, Direction, PrivateState};
use parking_lot::RwLock;

use crate::entry::ConntrackEntry;
use crate::expectation::{Expectation, ExpectationTable, MatchTemplate};

type CanonicalKey = (Vec<u8>, Vec<u8>);

struct Shard {
    index: RwLock<HashMap<CanonicalKey, CeId>>,
}

/// Bound on live entries, enforced so an out-of-memory scenario is
/// observable as [`FluxcapError::ResourceExhausted`] rather than an
/// allocator abort (spec §4.2 failure mode).
pub const DEFAULT_MAX_ENTRIES: usize = 1_000_000;

pub struct ConntrackTable {
    shards: Vec<Shard>,
    arena: DashMap<CeId, Arc<ConntrackEntry>>,
    next_id: AtomicU64,
    max_entries: usize,
    default_ttl: Duration,
    pub expectations: ExpectationTable,
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

fn canonical(fwd_key: &[u8], rev_key: &[u8]) -> CanonicalKey {
    if fwd_key <= rev_key {
        (fwd_key.to_vec(), rev_key.to_vec())
    } else {
        (rev_key.to_vec(), fwd_key.to_vec())
    }
}

impl ConntrackTable {
    pub fn new(num_shards: usize, default_ttl: Duration) -> Self {
        Self::with_capacity(num_shards, default_ttl, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(num_shards: usize, default_ttl: Duration, max_entries: usize) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|_| Shard {
                index: RwLock::new(HashMap::new()),
            })
            .collect();
        ConntrackTable {
            shards,
            arena: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_entries,
            default_ttl,
            expectations: ExpectationTable::new(),
        }
    }

    fn shard_for(&self, fwd_key: &[u8], rev_key: &[u8]) -> &Shard {
        let idx = (hash_bytes(fwd_key) ^ hash_bytes(rev_key)) as usize % self.shards.len();
        &self.shards[idx]
    }

    pub fn entry(&self, id: CeId) -> Option<Arc<ConntrackEntry>> {
        self.arena.get(&id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Pops every entry whose `last_seen + ttl <= now`, runs `cleanup` for
    /// each (the caller supplies a closure that dispatches to the owning
    /// protocol's registered cleanup handler — this crate has no
    /// dependency on the registry), then unlinks and frees it.
    pub fn expire_scan(&self, now: Instant, mut cleanup: impl FnMut(&ConntrackEntry)) {
        for shard in &self.shards {
            let expired: Vec<(CanonicalKey, CeId)> = {
                let index = shard.index.read();
                index
                    .iter()
                    .filter_map(|(key, id)| {
                        self.arena
                            .get(id)
                            .filter(|e| e.is_expired(now))
                            .map(|_| (key.clone(), *id))
                    })
                    .collect()
            };
            if expired.is_empty() {
                continue;
            }
            let mut index = shard.index.write();
            for (key, id) in expired {
                if let Some((_, entry)) = self.arena.remove(&id) {
                    cleanup(&entry);
                    index.remove(&key);
                }
            }
        }
    }
}

impl ConntrackAccess for ConntrackTable {
    fn get_or_create(
        &self,
        protocol: &'static str,
        fwd_key: &[u8],
        rev_key: &[u8],
        parent: Option<CeId>,
    ) -> Result<(CeId, Direction, bool), FluxcapError> {
        let shard = self.shard_for(fwd_key, rev_key);
        let canon = canonical(fwd_key, rev_key);

        // Fast path: read lock, probe both directions.
        {
            let index = shard.index.read();
            if let Some(&id) = index.get(&canon) {
                if let Some(entry) = self.arena.get(&id) {
                    entry.touch();
                    let direction = if entry.created_fwd_key == fwd_key {
                        Direction::Fwd
                    } else {
                        Direction::Rev
                    };
                    let entry = entry.clone();
                    drop(index);
                    // Acquired outside the shard lock: the shard lock only
                    // ever protects the index map, never the per-entry
                    // lock a caller holds for the rest of its processing.
                    entry.acquire();
                    return Ok((id, direction, false));
                }
            }
        }

        // Slow path: write lock, re-check (another thread may have raced
        // us between the read probe above and here), then insert.
        let mut index = shard.index.write();
        if let Some(&id) = index.get(&canon) {
            if let Some(entry) = self.arena.get(&id) {
                entry.touch();
                let direction = if entry.created_fwd_key == fwd_key {
                    Direction::Fwd
                } else {
                    Direction::Rev
                };
                let entry = entry.clone();
                drop(index);
                entry.acquire();
                return Ok((id, direction, false));
            }
        }

        if self.arena.len() >= self.max_entries {
            return Err(FluxcapError::resource_exhausted(
                "conntrack_table",
                format!("table full at {} entries", self.max_entries),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let new_entry = Arc::new(ConntrackEntry::new(
            id,
            protocol,
            fwd_key.to_vec(),
            rev_key.to_vec(),
            parent,
            self.default_ttl,
        ));

        // Expectations are consumed before the CE becomes visible to other
        // lookups (spec §4.5), i.e. while we still hold the shard write
        // lock and before inserting into `arena`/`index`.
        self.expectations.try_match_and_consume(protocol, fwd_key, rev_key, id);

        if let Some(parent_id) = parent {
            if let Some(parent_entry) = self.arena.get(&parent_id) {
                parent_entry.add_child(id);
            }
        }

        new_entry.acquire();
        self.arena.insert(id, new_entry);
        index.insert(canon, id);

        Ok((id, Direction::Fwd, true))
    }

    fn release(&self, id: CeId) {
        if let Some(entry) = self.arena.get(&id) {
            entry.release();
        }
    }

    fn touch(&self, id: CeId) {
        if let Some(entry) = self.arena.get(&id) {
            entry.touch();
        }
    }

    fn register_expectation(
        &self,
        protocol: &'static str,
        matches: Box<dyn Fn(&[u8], &[u8]) -> bool + Send>,
        ttl: Duration,
        owner_cookie: u64,
        callback: Box<dyn FnOnce(CeId, u64) + Send>,
    ) {
        let template = MatchTemplate::new(protocol, move |fwd, rev| matches(fwd, rev));
        self.expectations
            .register(Expectation::new(template, owner_cookie, ttl, move |ce, cookie| {
                callback(ce, cookie)
            }));
    }

    fn with_private_state(
        &self,
        id: CeId,
        protocol: &'static str,
        init: &mut dyn FnMut() -> Box<dyn PrivateState>,
        f: &mut dyn FnMut(&mut dyn Any),
    ) -> Result<(), FluxcapError> {
        let entry = self
            .arena
            .get(&id)
            .ok_or_else(|| FluxcapError::state_corrupted(Some(id), "conntrack entry not found"))?;
        entry.with_private_state(protocol, init, f);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn forward_and_reverse_keys_resolve_to_the_same_entry() {
        let table = ConntrackTable::new(4, Duration::from_secs(30));
        let (id_fwd, dir_fwd, created) = table.get_or_create("tcp", b"a->b", b"b->a", None).unwrap();
        assert!(created);
        assert_eq!(dir_fwd, Direction::Fwd);
        table.release(id_fwd);

        let (id_rev, dir_rev, created_again) = table.get_or_create("tcp", b"b->a", b"a->b", None).unwrap();
        assert_eq!(id_fwd, id_rev);
        assert_eq!(dir_rev, Direction::Rev);
        assert!(!created_again);
        assert_eq!(table.len(), 1);
        table.release(id_rev);
    }

    /// Scenario S3: two threads race to create the same bidirectional flow
    /// from opposite directions (simultaneous SYNs). Exactly one of them
    /// observes `created == true`; both resolve to the same CE id.
    #[test]
    fn s3_simultaneous_open_race_resolves_to_one_entry() {
        let table = Arc::new(ConntrackTable::new(8, Duration::from_secs(30)));
        let barrier = Arc::new(Barrier::new(2));

        let table_a = table.clone();
        let barrier_a = barrier.clone();
        let thread_a = std::thread::spawn(move || {
            barrier_a.wait();
            let result = table_a.get_or_create("tcp", b"a->b", b"b->a", None).unwrap();
            table_a.release(result.0);
            result
        });

        let table_b = table.clone();
        let barrier_b = barrier.clone();
        let thread_b = std::thread::spawn(move || {
            barrier_b.wait();
            let result = table_b.get_or_create("tcp", b"b->a", b"a->b", None).unwrap();
            table_b.release(result.0);
            result
        });

        let (id_a, _, created_a) = thread_a.join().unwrap();
        let (id_b, _, created_b) = thread_b.join().unwrap();

        assert_eq!(id_a, id_b);
        assert_eq!(table.len(), 1);
        assert_eq!(created_a ^ created_b, true, "exactly one side creates the entry");
    }

    #[test]
    fn child_entries_are_linked_to_their_parent() {
        let table = ConntrackTable::new(4, Duration::from_secs(30));
        let (parent_id, _, _) = table.get_or_create("ipv4", b"ip-a", b"ip-b", None).unwrap();
        let (child_id, _, _) = table.get_or_create("udp", b"udp-a", b"udp-b", Some(parent_id)).unwrap();

        let parent = table.entry(parent_id).unwrap();
        assert_eq!(parent.children(), vec![child_id]);
        table.release(child_id);
        table.release(parent_id);
    }

    #[test]
    fn release_increments_the_entrys_processed_count_and_frees_it_for_reuse() {
        let table = ConntrackTable::new(4, Duration::from_secs(30));
        let (id, _, _) = table.get_or_create("ipv4", b"ip-a", b"ip-b", None).unwrap();
        let entry = table.entry(id).unwrap();
        assert_eq!(entry.processed_count(), 0);

        table.release(id);
        assert_eq!(entry.processed_count(), 1);

        // A second `get_or_create` on the same flow must not block now
        // that the first caller released it.
        let (id_again, _, created_again) = table.get_or_create("ipv4", b"ip-a", b"ip-b", None).unwrap();
        assert_eq!(id_again, id);
        assert!(!created_again);
        table.release(id_again);
        assert_eq!(entry.processed_count(), 2);
    }

    #[test]
    fn expire_scan_removes_stale_entries_and_runs_cleanup() {
        let table = ConntrackTable::new(4, Duration::from_millis(1));
        let (id, _, _) = table.get_or_create("ipv4", b"ip-a", b"ip-b", None).unwrap();
        assert_eq!(table.len(), 1);

        std::thread::sleep(Duration::from_millis(20));

        let mut cleaned = Vec::new();
        table.expire_scan(Instant::now(), |entry| cleaned.push(entry.id));

        assert_eq!(cleaned, vec![id]);
        assert!(table.is_empty());
    }

    #[test]
    fn touch_prevents_a_live_entry_from_expiring() {
        let table = ConntrackTable::new(4, Duration::from_millis(50));
        let (id, _, _) = table.get_or_create("ipv4", b"ip-a", b"ip-b", None).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        table.touch(id);
        std::thread::sleep(Duration::from_millis(30));

        let mut cleaned = Vec::new();
        table.expire_scan(Instant::now(), |entry| cleaned.push(entry.id));
        assert!(cleaned.is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn table_at_capacity_rejects_new_entries_with_resource_exhausted() {
        let table = ConntrackTable::with_capacity(2, Duration::from_secs(30), 1);
        table.get_or_create("ipv4", b"ip-a", b"ip-b", None).unwrap();

        let result = table.get_or_create("ipv4", b"ip-c", b"ip-d", None);
        assert!(matches!(result, Err(FluxcapError::ResourceExhausted { .. })));
    }

    #[test]
    fn expectation_registered_through_the_table_fires_on_matching_flow() {
        let table = ConntrackTable::new(4, Duration::from_secs(30));
        let seen = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let seen_cb = seen.clone();

        ConntrackAccess::register_expectation(
            &table,
            "rtp",
            Box::new(|fwd, rev| fwd == b"rtp-a" && rev == b"rtp-b"),
            Duration::from_secs(30),
            99,
            Box::new(move |ce, cookie| {
                seen_cb.store(ce * 1000 + cookie, Ordering::SeqCst);
            }),
        );

        let (id, _, created) = table.get_or_create("rtp", b"rtp-a", b"rtp-b", None).unwrap();
        assert!(created);
        assert_eq!(seen.load(Ordering::SeqCst), id * 1000 + 99);
    }
}
