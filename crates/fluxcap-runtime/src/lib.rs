//! `fluxcap-runtime`: the engine that wires the registry, conntrack table,
//! timer wheel and built-in protocol modules together, owns the worker
//! pool, and carries the ambient control-plane, privilege-split and
//! module-loader seams spec §6 expects of a complete engine.

pub mod control;
pub mod engine;
pub mod file_input;
pub mod module_loader;
pub mod output;
pub mod privsep;
pub mod synthetic_input;

pub use engine::Engine;
