//! Protocol registry (C2): name → handler table, plus field schema and
//! conntrack wiring, installed by protocol modules (spec §3, §6).

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::field::FieldSchemaEntry;
use crate::output::Event;
use crate::packet::Packet;
use crate::verdict::HandlerVerdict;

/// Opaque handle to a live conntrack entry. The dispatcher and protocol
/// handlers never see more of a CE than this id plus the
/// [`ConntrackAccess`] trait object used to reach its private state —
/// `fluxcap-core` has no notion of shards or TTL queues.
pub type CeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Fwd,
    Rev,
}

/// Per-protocol typed state attached to one conntrack entry. Implemented
/// automatically for any `'static + Send` type; the registry never
/// constructs one, it only stores and drops the `Box` the protocol handed
/// it (spec §9: "a small map keyed by protocol-id holding an owned handle
/// that implements a common release capability" — `Drop` is that
/// capability here).
pub trait PrivateState: Any + Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send> PrivateState for T {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The contract a conntrack table implementation (`fluxcap-conntrack`)
/// exposes to handlers running inside the dispatcher. Kept as a trait so
/// `fluxcap-core` has no dependency on the sharded table's internals.
pub trait ConntrackAccess: Send + Sync {
    /// §4.2 `get_or_create`. Blocks until the returned entry's per-entry
    /// processing lock is free, then takes it — the caller owns that lock
    /// for as long as it holds the returned `CeId` and must hand it back
    /// through [`Self::release`] exactly once, even on an error path.
    fn get_or_create(
        &self,
        protocol: &'static str,
        fwd_key: &[u8],
        rev_key: &[u8],
        parent: Option<CeId>,
    ) -> Result<(CeId, Direction, bool), crate::error::FluxcapError>;

    /// §4.2 `release`: releases the per-entry lock taken by
    /// `get_or_create`, and reschedules the entry's TTL reposition (a
    /// `touch`) as part of the same call. A no-op if `id` no longer
    /// exists (already expired out from under the caller).
    fn release(&self, id: CeId);

    /// Refresh `last_seen` without taking the entry out of circulation.
    fn touch(&self, id: CeId);

    /// Run `f` with exclusive access to this protocol's private state slot
    /// on entry `id`, lazily constructing it via `init` on first use. The
    /// implementation is responsible for acquiring the entry lock.
    fn with_private_state(
        &self,
        id: CeId,
        protocol: &'static str,
        init: &mut dyn FnMut() -> Box<dyn PrivateState>,
        f: &mut dyn FnMut(&mut dyn Any),
    ) -> Result<(), crate::error::FluxcapError>;

    /// §4.5: register a pending match rule for `protocol` that fires
    /// `callback` exactly once, the moment a matching CE is created, then
    /// is discarded (matched or expired).
    #[allow(clippy::too_many_arguments)]
    fn register_expectation(
        &self,
        protocol: &'static str,
        matches: Box<dyn Fn(&[u8], &[u8]) -> bool + Send>,
        ttl: std::time::Duration,
        owner_cookie: u64,
        callback: Box<dyn FnOnce(CeId, u64) + Send>,
    );
}

/// The four (really five, counting `init`) handler hooks a protocol
/// module installs (spec §3, §4.1).
pub trait ProtocolHandlers: Send + Sync {
    /// Called once when the module is registered.
    fn init(&self) -> Result<(), crate::error::FluxcapError> {
        Ok(())
    }

    /// Parse frame `k`'s payload, write fields into `packet.layers[k]`
    /// and return the header length consumed plus the next protocol name
    /// (`None` if this is the innermost layer).
    fn parse(
        &self,
        packet: &mut Packet,
        frame_index: usize,
    ) -> Result<ParseOutcome, HandlerVerdict>;

    /// May allocate/look up a conntrack entry, buffer a fragment, or mark
    /// the packet for delivery-as-payload.
    fn process(&self, ctx: &mut ProcessContext) -> HandlerVerdict {
        let _ = ctx;
        HandlerVerdict::Ok
    }

    /// Runs on unwind, deepest frame first.
    fn post_process(&self, ctx: &mut ProcessContext) -> HandlerVerdict {
        let _ = ctx;
        HandlerVerdict::Ok
    }

    /// Releases whatever `process` attached to a conntrack entry's private
    /// state slot. Failures are logged, never propagated (spec §4.2).
    fn cleanup(&self, _state: &mut dyn Any) {}
}

/// What a successful `parse` produced.
#[derive(Debug)]
pub struct ParseOutcome {
    pub header_len: usize,
    pub next_proto: Option<&'static str>,
    pub fields: crate::field::LayerFields,
}

impl ParseOutcome {
    pub fn new(header_len: usize, next_proto: Option<&'static str>, fields: crate::field::LayerFields) -> Self {
        ParseOutcome { header_len, next_proto, fields }
    }
}

/// Everything a `process`/`post_process` call needs: the packet, which
/// frame it's running for, and a handle back into the conntrack table.
pub struct ProcessContext<'a> {
    pub packet: &'a mut Packet,
    pub frame_index: usize,
    pub conntrack: &'a dyn ConntrackAccess,
    pub ce: Option<CeId>,
    /// The enclosing layer's CE, if any (spec §3's "parent CE reference,
    /// for layering"). `None` for the outermost frame or whenever the
    /// enclosing layer never created one. A handler that calls
    /// `get_or_create` should pass this straight through as `parent` so
    /// child CEs stay linked to the flow that carried them.
    pub parent_ce: Option<CeId>,
    /// Emits one event to every subscribed [`crate::output::EventSink`]
    /// (spec §6). Defaults to a no-op when the dispatcher wasn't given a
    /// real emitter (e.g. the fragment reassembler's internal re-entry).
    pub events: &'a dyn Fn(Event),
}

/// Conntrack wiring declared by a protocol descriptor (spec §3).
#[derive(Debug, Clone)]
pub struct ConntrackInfo {
    pub default_table_size: usize,
    pub fwd_field: &'static str,
    pub rev_field: &'static str,
}

/// Per-protocol invalid/processed counters (spec §7 "counters per
/// protocol").
#[derive(Debug, Default)]
pub struct ProtocolCounters {
    pub invalid: AtomicU64,
    pub processed: AtomicU64,
}

impl ProtocolCounters {
    pub fn invalid_count(&self) -> u64 {
        self.invalid.load(Ordering::Relaxed)
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

/// A registered protocol: name, schema, conntrack wiring and handlers.
/// Registered once, indexed by name, refcounted by every live stack frame
/// that references it.
pub struct ProtocolDescriptor {
    pub name: &'static str,
    pub api_version: u32,
    pub field_schema: Vec<FieldSchemaEntry>,
    pub conntrack_info: Option<ConntrackInfo>,
    pub handlers: Arc<dyn ProtocolHandlers>,
    pub counters: ProtocolCounters,
}

impl std::fmt::Debug for ProtocolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolDescriptor")
            .field("name", &self.name)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

/// Name → descriptor table. Read-mostly: writers only during module
/// load/unload, so lookups go through an `ArcSwap` snapshot rather than a
/// reader/writer lock on the hot path.
#[derive(Default)]
pub struct Registry {
    table: ArcSwap<HashMap<&'static str, Arc<ProtocolDescriptor>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProtocolDescriptor>> {
        self.table.load().get(name).cloned()
    }

    /// Installs (or replaces) a descriptor. Registration is rare and not
    /// on any packet's hot path, so a full copy-on-write of the map is an
    /// acceptable cost for the simplicity it buys.
    pub fn register(&self, descriptor: ProtocolDescriptor) -> Result<(), crate::error::FluxcapError> {
        descriptor.handlers.init()?;
        self.table.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(descriptor.name, Arc::new(ProtocolDescriptor {
                name: descriptor.name,
                api_version: descriptor.api_version,
                field_schema: descriptor.field_schema.clone(),
                conntrack_info: descriptor.conntrack_info.clone(),
                handlers: descriptor.handlers.clone(),
                counters: ProtocolCounters::default(),
            }));
            next
        });
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        self.table.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(name);
            next
        });
    }
}

/// A protocol module, loaded statically or (eventually) dynamically.
/// Mirrors the `{api_version, register, unregister}` shape of the plugin
/// interface (spec §6); `fluxcap-runtime::ModuleLoader` is the seam a
/// future `dlopen`-based loader would implement against.
pub trait ProtocolModule {
    fn api_version(&self) -> u32;
    fn register(&self, registry: &Registry) -> Result<(), crate::error::FluxcapError>;
    fn unregister(&self, registry: &Registry);
}
