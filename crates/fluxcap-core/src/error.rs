//! Error taxonomy for the engine (see spec §7). These are *kinds*, not a
//! single catch-all — each carries the context a log line or control-plane
//! reply needs to be useful on its own.

use std::fmt;

/// Top-level error domain for the engine. Only [`HandlerVerdict::Err`]
/// (see [`crate::verdict`]) ever carries one of these up to the dispatcher;
/// everything else is represented by the smaller verdict codes.
#[derive(Debug, thiserror::Error)]
pub enum FluxcapError {
    /// On-wire malformation. The dispatcher increments the protocol's
    /// invalid counter and drops the packet; the entry is not touched.
    #[error("invalid packet in {protocol}: {reason}")]
    InvalidPacket { protocol: String, reason: String },

    /// Allocation failure or a bounded table is full.
    #[error("resource exhausted in {resource}: {reason}")]
    ResourceExhausted { resource: String, reason: String },

    /// A runtime invariant was violated. The offending conntrack entry is
    /// torn down; other entries are unaffected.
    #[error("state corrupted for entry {entry:?}: {reason}")]
    StateCorrupted {
        entry: Option<u64>,
        reason: String,
    },

    /// A control-plane parameter change was rejected. No core state
    /// changes as a result.
    #[error("config rejected: {reason}")]
    ConfigError { reason: String },

    /// An input driver lost its source. The driver transitions to
    /// `Stopped`; other inputs are unaffected.
    #[error("input {input} lost its source: {reason}")]
    IoError { input: String, reason: String },

    /// Loss of internal coherence severe enough to warrant a graceful
    /// shutdown of the whole engine.
    #[error("fatal: {reason}")]
    Fatal { reason: String },
}

impl FluxcapError {
    pub fn invalid(protocol: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::InvalidPacket {
            protocol: protocol.into(),
            reason: reason.to_string(),
        }
    }

    pub fn resource_exhausted(resource: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    pub fn state_corrupted(entry: Option<u64>, reason: impl fmt::Display) -> Self {
        Self::StateCorrupted {
            entry,
            reason: reason.to_string(),
        }
    }

    /// Logging severity the taxonomy mandates for this kind (spec §7).
    pub fn level(&self) -> tracing::Level {
        use tracing::Level;
        match self {
            FluxcapError::InvalidPacket { .. } => Level::DEBUG,
            FluxcapError::ResourceExhausted { .. } => Level::WARN,
            FluxcapError::StateCorrupted { .. } => Level::ERROR,
            FluxcapError::ConfigError { .. } => Level::INFO,
            FluxcapError::IoError { .. } => Level::ERROR,
            FluxcapError::Fatal { .. } => Level::ERROR,
        }
    }
}
