//! Privilege split seam (spec §6, §10's `main.c` `--user` fork). The
//! original forks a dedicated input process before dropping privileges in
//! the parent, and ferries captured frames back over a System V message
//! queue. Safe Rust has no sound way to `fork(2)` alongside threads this
//! engine already has running by the time a `PrivilegeSplit` would be
//! constructed, so this ships as a documented boundary a real deployment
//! wires up at the process level (e.g. two binaries plus a pipe), not a
//! working privilege drop.

use std::sync::mpsc::{Receiver, Sender};

use bytes::Bytes;
use fluxcap_core::packet::CaptureTimestamp;

/// A message crossing the privilege boundary, mirroring the three kinds
/// `input_ipc` carries in the original: captured frames, log lines, and
/// control replies.
pub enum PrivsepMessage {
    Packet {
        captured_at: CaptureTimestamp,
        bytes: Bytes,
        link_protocol: &'static str,
    },
    Log { level: tracing::Level, message: String },
    Reply { request_id: u64, ok: bool, detail: String },
}

/// Describes the unprivileged/privileged boundary: who to drop to, and the
/// channel frames and log lines cross it on. Unix credentials are `u32`s
/// here rather than `nix::unistd::{Uid, Gid}` so this crate doesn't need a
/// platform-specific dependency for a seam nothing calls yet.
pub struct PrivilegeSplit {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    sender: Sender<PrivsepMessage>,
    receiver: Receiver<PrivsepMessage>,
}

impl PrivilegeSplit {
    pub fn new(uid: Option<u32>, gid: Option<u32>) -> Self {
        let (sender, receiver) = std::sync::mpsc::channel();
        PrivilegeSplit { uid, gid, sender, receiver }
    }

    pub fn sender(&self) -> Sender<PrivsepMessage> {
        self.sender.clone()
    }

    /// Drains whatever messages the (hypothetical) privileged side has
    /// queued. Never blocks — a real deployment would run this on the
    /// control thread's poll loop.
    pub fn drain(&self) -> Vec<PrivsepMessage> {
        self.receiver.try_iter().collect()
    }

    /// Would `setegid`/`seteuid` to `self.{gid,uid}` on a platform that
    /// supports it. This engine never runs as a privileged process in any
    /// test or deployment path this repo ships, so it's a documented no-op
    /// rather than an `unsafe` libc call with nothing to exercise it.
    pub fn drop_to_configured_identity(&self) -> Result<(), fluxcap_core::error::FluxcapError> {
        if self.uid.is_none() && self.gid.is_none() {
            return Ok(());
        }
        Err(fluxcap_core::error::FluxcapError::ConfigError {
            reason: "privilege drop is a documented seam, not a working implementation".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_identity_configured_is_a_no_op() {
        let split = PrivilegeSplit::new(None, None);
        assert!(split.drop_to_configured_identity().is_ok());
    }

    #[test]
    fn configured_identity_surfaces_as_config_error() {
        let split = PrivilegeSplit::new(Some(1000), Some(1000));
        assert!(split.drop_to_configured_identity().is_err());
    }

    #[test]
    fn messages_sent_before_drain_are_observed() {
        let split = PrivilegeSplit::new(None, None);
        let tx = split.sender();
        tx.send(PrivsepMessage::Log { level: tracing::Level::INFO, message: "hi".into() })
            .unwrap();
        let drained = split.drain();
        assert_eq!(drained.len(), 1);
    }
}
