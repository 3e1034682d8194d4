//! Control plane (spec §6): a tree of `(class, instance, parameter)`
//! triples, each with a typed value and flag bits, served over an
//! in-process async channel — a minimal stand-in for the teacher's RPC
//! surface, grounded in `input.c`'s `registry_param` (named parameters
//! with `REGISTRY_PARAM_FLAG_*` bits and set/get callbacks).

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use fluxcap_core::error::FluxcapError;

/// A tiny macro-free bitflags stand-in, kept local so the control module
/// doesn't need its own crate dependency for three bits.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: Self) -> Self {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like! {
    /// Bits carried per-parameter (spec §6), mirroring `registry_param`'s
    /// `REGISTRY_PARAM_FLAG_*` set.
    pub struct ParamFlags: u8 {
        const IMMUTABLE = 0b001;
        const NOT_LOCKED_WHILE_RUNNING = 0b010;
        const CLEANUP_VAL = 0b100;
    }
}

/// A parameter value. Mirrors the closed `ptype` set the control plane
/// needs to carry, kept serde-able so the request/response channel could
/// later be swapped for a real wire transport without changing callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum ParamValue {
    Bool(bool),
    Uint(u64),
    Int(i64),
    String(String),
}

struct Parameter {
    value: ParamValue,
    flags: ParamFlags,
}

type ClassKey = (String, String, String);

/// The `(class, instance, parameter)` tree itself. Reads and writes both
/// go through a `parking_lot::RwLock` — the control plane is not on any
/// packet's hot path, so lock contention here never touches dispatch.
#[derive(Default)]
struct RegistryTree {
    params: HashMap<ClassKey, Parameter>,
}

impl RegistryTree {
    fn key(class: &str, instance: &str, parameter: &str) -> ClassKey {
        (class.to_string(), instance.to_string(), parameter.to_string())
    }

    fn declare(&mut self, class: &str, instance: &str, parameter: &str, value: ParamValue, flags: ParamFlags) {
        self.params.insert(Self::key(class, instance, parameter), Parameter { value, flags });
    }

    fn get(&self, class: &str, instance: &str, parameter: &str) -> Option<ParamValue> {
        self.params.get(&Self::key(class, instance, parameter)).map(|p| p.value.clone())
    }

    fn set(
        &mut self,
        class: &str,
        instance: &str,
        parameter: &str,
        value: ParamValue,
        running: bool,
    ) -> Result<(), FluxcapError> {
        let key = Self::key(class, instance, parameter);
        let param = self
            .params
            .get_mut(&key)
            .ok_or_else(|| FluxcapError::ConfigError {
                reason: format!("no such parameter {class}.{instance}.{parameter}"),
            })?;

        if param.flags.contains(ParamFlags::IMMUTABLE) {
            return Err(FluxcapError::ConfigError {
                reason: format!("{class}.{instance}.{parameter} is immutable"),
            });
        }
        if running && !param.flags.contains(ParamFlags::NOT_LOCKED_WHILE_RUNNING) {
            return Err(FluxcapError::ConfigError {
                reason: format!("{class}.{instance}.{parameter} cannot change while running"),
            });
        }
        param.value = value;
        Ok(())
    }
}

/// One request the control plane can serve.
pub enum ControlRequest {
    Get { class: String, instance: String, parameter: String },
    Set { class: String, instance: String, parameter: String, value: ParamValue },
}

pub struct ControlResponse(pub Result<Option<ParamValue>, FluxcapError>);

/// Shared handle: declares parameters, and answers requests arriving on
/// `request_rx` until the channel closes. `is_running` is read fresh per
/// request so `NOT_LOCKED_WHILE_RUNNING` reflects the engine's live state.
pub struct ControlRegistry {
    tree: RwLock<RegistryTree>,
    is_running: Box<dyn Fn() -> bool + Send + Sync>,
}

pub type ControlChannel = (
    mpsc::Sender<(ControlRequest, oneshot::Sender<ControlResponse>)>,
    mpsc::Receiver<(ControlRequest, oneshot::Sender<ControlResponse>)>,
);

impl ControlRegistry {
    pub fn new(is_running: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        ControlRegistry {
            tree: RwLock::new(RegistryTree::default()),
            is_running: Box::new(is_running),
        }
    }

    pub fn declare(&self, class: &str, instance: &str, parameter: &str, value: ParamValue, flags: ParamFlags) {
        self.tree.write().declare(class, instance, parameter, value, flags);
    }

    pub fn get(&self, class: &str, instance: &str, parameter: &str) -> Option<ParamValue> {
        self.tree.read().get(class, instance, parameter)
    }

    pub fn set(&self, class: &str, instance: &str, parameter: &str, value: ParamValue) -> Result<(), FluxcapError> {
        let running = (self.is_running)();
        self.tree.write().set(class, instance, parameter, value, running)
    }

    /// Handles one request synchronously, producing the response the
    /// caller should send back over its `oneshot`.
    pub fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Get { class, instance, parameter } => {
                ControlResponse(Ok(self.get(&class, &instance, &parameter)))
            }
            ControlRequest::Set { class, instance, parameter, value } => {
                match self.set(&class, &instance, &parameter, value) {
                    Ok(()) => ControlResponse(Ok(None)),
                    Err(e) => ControlResponse(Err(e)),
                }
            }
        }
    }

    /// Drains `request_rx` until it closes, answering each request inline.
    /// Intended to run on the small current-thread `tokio` runtime
    /// `fluxcap-runtime` owns for async edges (spec §5), never on the
    /// dispatch hot path.
    pub async fn serve(
        &self,
        mut request_rx: mpsc::Receiver<(ControlRequest, oneshot::Sender<ControlResponse>)>,
    ) {
        while let Some((request, reply)) = request_rx.recv().await {
            let response = self.handle(request);
            let _ = reply.send(response);
        }
    }
}
