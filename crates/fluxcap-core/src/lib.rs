//! `fluxcap-core`: the packet value, the protocol registry and the pipeline
//! dispatcher that walks a packet through a stack of protocol handlers.
//!
//! This crate owns no network I/O and no protocol implementations of its
//! own — it defines the contracts that `fluxcap-proto` implements and that
//! `fluxcap-runtime` drives.

pub mod error;
pub mod field;
pub mod input;
pub mod output;
pub mod packet;
pub mod registry;
pub mod stack;
pub mod verdict;

mod dispatch;

pub use dispatch::{DispatchOutcome, PipelineDispatcher};
pub use error::FluxcapError;
pub use verdict::HandlerVerdict;
