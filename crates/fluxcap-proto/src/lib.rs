//! Reference protocol modules: `eth`, `arp`, `ipv4` (fragmenting), `udp`,
//! `sip` (line-mode, SDP-aware) and `rtp`. Together they ground the
//! registry/dispatcher/conntrack/reassembly contracts defined in
//! `fluxcap-core`/`fluxcap-conntrack`/`fluxcap-reassembly` in working
//! code, rather than leaving them as traits nothing implements.

pub mod arp;
pub mod eth;
pub mod fields;
pub mod ipv4;
pub mod routing;
pub mod rtp;
pub mod sip;
pub mod udp;

use std::sync::Arc;

use fluxcap_conntrack::timer::TimerWheel;
use fluxcap_core::error::FluxcapError;
use fluxcap_core::registry::{ConntrackAccess, ProtocolDescriptor, ProtocolModule, Registry};

pub use routing::PortRouter;

const BUILTIN_NAMES: &[&str] = &["eth", "arp", "ipv4", "udp", "sip", "rtp"];

/// The reference protocol set (`eth`/`arp`/`ipv4`/`udp`/`sip`/`rtp`) as one
/// [`ProtocolModule`] (spec §6: "built-in modules in fluxcap-proto implement
/// it directly"). `ipv4` needs a handle back to the registry it is part of,
/// to re-enter the pipeline once a fragmented datagram completes, so this
/// is constructed with the same `Arc<Registry>` its `register` call will
/// populate.
pub struct BuiltinModules {
    registry: Arc<Registry>,
    conntrack: Arc<dyn ConntrackAccess>,
    timers: Arc<TimerWheel>,
    frag_timeout_secs: f64,
}

impl BuiltinModules {
    pub fn new(
        registry: Arc<Registry>,
        conntrack: Arc<dyn ConntrackAccess>,
        timers: Arc<TimerWheel>,
        frag_timeout_secs: f64,
    ) -> Self {
        BuiltinModules { registry, conntrack, timers, frag_timeout_secs }
    }
}

impl ProtocolModule for BuiltinModules {
    fn api_version(&self) -> u32 {
        1
    }

    fn register(&self, registry: &Registry) -> Result<(), FluxcapError> {
        let port_router = PortRouter::new();

        registry.register(ProtocolDescriptor {
            name: "eth",
            api_version: 1,
            field_schema: eth::field_schema(),
            conntrack_info: None,
            handlers: Arc::new(eth::EthHandlers),
            counters: Default::default(),
        })?;

        registry.register(ProtocolDescriptor {
            name: "arp",
            api_version: 1,
            field_schema: arp::field_schema(),
            conntrack_info: None,
            handlers: Arc::new(arp::ArpHandlers),
            counters: Default::default(),
        })?;

        registry.register(ProtocolDescriptor {
            name: "ipv4",
            api_version: 1,
            field_schema: ipv4::field_schema(),
            conntrack_info: Some(ipv4::conntrack_info()),
            handlers: Arc::new(ipv4::Ipv4Handlers::new(
                self.registry.clone(),
                self.conntrack.clone(),
                self.timers.clone(),
                self.frag_timeout_secs,
            )),
            counters: Default::default(),
        })?;

        registry.register(ProtocolDescriptor {
            name: "udp",
            api_version: 1,
            field_schema: udp::field_schema(),
            conntrack_info: Some(udp::conntrack_info()),
            handlers: Arc::new(udp::UdpHandlers::new(port_router.clone())),
            counters: Default::default(),
        })?;

        registry.register(ProtocolDescriptor {
            name: "sip",
            api_version: 1,
            field_schema: sip::field_schema(),
            conntrack_info: Some(sip::conntrack_info()),
            handlers: Arc::new(sip::SipHandlers::new(port_router.clone())),
            counters: Default::default(),
        })?;

        registry.register(ProtocolDescriptor {
            name: "rtp",
            api_version: 1,
            field_schema: rtp::field_schema(),
            conntrack_info: None,
            handlers: Arc::new(rtp::RtpHandlers),
            counters: Default::default(),
        })?;

        Ok(())
    }

    fn unregister(&self, registry: &Registry) {
        for name in BUILTIN_NAMES {
            registry.unregister(name);
        }
    }
}

/// Convenience wrapper for callers that just want the built-in set
/// installed against a freshly constructed registry, without holding onto
/// the [`BuiltinModules`] handle themselves.
pub fn install(
    registry: &Arc<Registry>,
    conntrack: Arc<dyn ConntrackAccess>,
    timers: Arc<TimerWheel>,
    frag_timeout_secs: f64,
) -> Result<(), FluxcapError> {
    BuiltinModules::new(registry.clone(), conntrack, timers, frag_timeout_secs).register(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxcap_conntrack::ConntrackTable;
    use std::time::Duration;

    #[test]
    fn register_installs_every_builtin_and_unregister_clears_them() {
        let registry = Arc::new(Registry::new());
        let conntrack: Arc<dyn ConntrackAccess> = Arc::new(ConntrackTable::new(4, Duration::from_secs(30)));
        let timers = TimerWheel::new();
        let module = BuiltinModules::new(registry.clone(), conntrack, timers, 30.0);

        assert_eq!(module.api_version(), 1);
        module.register(&registry).unwrap();
        for name in BUILTIN_NAMES {
            assert!(registry.get(name).is_some(), "{name} should be registered");
        }

        module.unregister(&registry);
        for name in BUILTIN_NAMES {
            assert!(registry.get(name).is_none(), "{name} should be unregistered");
        }
    }
}
