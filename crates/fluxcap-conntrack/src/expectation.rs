//! Expectations (C11, spec §4.5): pending flow rules created by a
//! control protocol (e.g. SIP) to bind a future data flow to a dialog.

use std::time::{Duration, Instant};

use fluxcap_core::registry::CeId;
use parking_lot::Mutex;

/// A partial-key match rule. Any component may be absent (wildcard);
/// matching is expressed as a predicate rather than a literal wildcarded
/// tuple so it can compare against the same key bytes the conntrack table
/// itself uses, regardless of how many components a protocol's key
/// encodes.
pub struct MatchTemplate {
    pub protocol: &'static str,
    matches: Box<dyn Fn(&[u8], &[u8]) -> bool + Send>,
}

impl MatchTemplate {
    pub fn new(
        protocol: &'static str,
        matches: impl Fn(&[u8], &[u8]) -> bool + Send + 'static,
    ) -> Self {
        MatchTemplate {
            protocol,
            matches: Box::new(matches),
        }
    }

    /// A template that matches any forward/reverse key for the given
    /// protocol — used when the whole 5-tuple is known up front (e.g. the
    /// SIP/SDP case in scenario S4).
    pub fn exact(protocol: &'static str, fwd_key: Vec<u8>, rev_key: Vec<u8>) -> Self {
        MatchTemplate::new(protocol, move |fwd, rev| {
            (fwd == fwd_key.as_slice() && rev == rev_key.as_slice())
                || (fwd == rev_key.as_slice() && rev == fwd_key.as_slice())
        })
    }

    fn matches(&self, protocol: &str, fwd_key: &[u8], rev_key: &[u8]) -> bool {
        self.protocol == protocol && (self.matches)(fwd_key, rev_key)
    }
}

/// A pending match rule plus the single-shot callback it fires once,
/// and an owner cookie threaded through untouched.
pub struct Expectation {
    pub template: MatchTemplate,
    pub owner_cookie: u64,
    callback: Option<Box<dyn FnOnce(CeId, u64) + Send>>,
    created_at: Instant,
    ttl: Duration,
}

impl Expectation {
    pub fn new(
        template: MatchTemplate,
        owner_cookie: u64,
        ttl: Duration,
        callback: impl FnOnce(CeId, u64) + Send + 'static,
    ) -> Self {
        Expectation {
            template,
            owner_cookie,
            callback: Some(Box::new(callback)),
            created_at: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// All pending expectations. Matching happens exactly once per
/// expectation, under the same lock that guards insertion, so two
/// concurrent CE creations can never both consume the same expectation.
#[derive(Default)]
pub struct ExpectationTable {
    pending: Mutex<Vec<Expectation>>,
}

impl ExpectationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, expectation: Expectation) {
        self.pending.lock().push(expectation);
    }

    /// Called from [`crate::table::ConntrackTable::get_or_create`] while
    /// the shard write lock is held, before the new CE is visible to other
    /// lookups. Fires the first matching expectation's callback and
    /// removes it; expired entries encountered along the way are dropped
    /// without firing.
    pub fn try_match_and_consume(
        &self,
        protocol: &'static str,
        fwd_key: &[u8],
        rev_key: &[u8],
        new_ce: CeId,
    ) {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        pending.retain(|exp| !exp.is_expired(now));

        let pos = pending
            .iter()
            .position(|exp| exp.template.matches(protocol, fwd_key, rev_key));

        if let Some(pos) = pos {
            let mut exp = pending.remove(pos);
            if let Some(callback) = exp.callback.take() {
                callback(new_ce, exp.owner_cookie);
            }
        }
    }

    pub fn expire(&self, now: Instant) {
        self.pending.lock().retain(|exp| !exp.is_expired(now));
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn matching_expectation_fires_once_and_is_removed() {
        let table = ExpectationTable::new();
        let fired = Arc::new(AtomicU64::new(0));
        let fired_cb = fired.clone();
        let template = MatchTemplate::exact("rtp", vec![1, 2, 3], vec![4, 5, 6]);
        table.register(Expectation::new(template, 42, Duration::from_secs(30), move |ce, cookie| {
            fired_cb.store(ce * 1000 + cookie, Ordering::SeqCst);
        }));

        assert_eq!(table.len(), 1);
        table.try_match_and_consume("rtp", &[1, 2, 3], &[4, 5, 6], 7);
        assert_eq!(fired.load(Ordering::SeqCst), 7042);
        assert!(table.is_empty());

        // A second, identical flow does not re-fire the already-consumed
        // expectation.
        table.try_match_and_consume("rtp", &[1, 2, 3], &[4, 5, 6], 9);
        assert_eq!(fired.load(Ordering::SeqCst), 7042);
    }

    #[test]
    fn non_matching_protocol_does_not_consume() {
        let table = ExpectationTable::new();
        let template = MatchTemplate::exact("rtp", vec![1], vec![2]);
        table.register(Expectation::new(template, 0, Duration::from_secs(30), |_, _| {}));

        table.try_match_and_consume("udp", &[1], &[2], 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn expired_expectations_are_dropped_without_firing() {
        let table = ExpectationTable::new();
        let fired = Arc::new(AtomicU64::new(0));
        let fired_cb = fired.clone();
        let template = MatchTemplate::exact("rtp", vec![1], vec![2]);
        table.register(Expectation::new(template, 0, Duration::from_millis(1), move |_, _| {
            fired_cb.store(1, Ordering::SeqCst);
        }));

        std::thread::sleep(Duration::from_millis(20));
        table.try_match_and_consume("rtp", &[1], &[2], 5);

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn expire_sweeps_stale_entries_without_consuming() {
        let table = ExpectationTable::new();
        let template = MatchTemplate::exact("rtp", vec![1], vec![2]);
        table.register(Expectation::new(template, 0, Duration::from_millis(1), |_, _| {}));

        std::thread::sleep(Duration::from_millis(20));
        table.expire(Instant::now());
        assert!(table.is_empty());
    }
}
