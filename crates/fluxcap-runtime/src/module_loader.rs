//! Seam for a future `dlopen`-based protocol module loader (spec §6, §9:
//! "loader stays a capability, not an assumption"). `fluxcap-proto`'s
//! modules are linked in statically and never go through this trait; it
//! exists so a later dynamic loader has somewhere to implement against
//! without touching the registry or dispatcher.

use std::path::Path;

use fluxcap_core::error::FluxcapError;
use fluxcap_core::registry::ProtocolModule;

/// Loads [`ProtocolModule`]s from outside the binary. No implementation
/// ships in this crate — dynamic loading is explicitly out of scope — but
/// the trait fixes the shape a loader would have to conform to.
pub trait ModuleLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn ProtocolModule>, FluxcapError>;
}

/// A loader that always fails, standing in for "no dynamic loading
/// backend configured". Lets `fluxcap-runtime` depend on `ModuleLoader`
/// unconditionally without every deployment needing a real one.
#[derive(Default)]
pub struct NoDynamicLoader;

impl ModuleLoader for NoDynamicLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn ProtocolModule>, FluxcapError> {
        Err(FluxcapError::ConfigError {
            reason: format!("dynamic module loading is not supported ({})", path.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_dynamic_loader_always_errors() {
        let loader = NoDynamicLoader;
        assert!(loader.load(Path::new("/nonexistent.so")).is_err());
    }
}
