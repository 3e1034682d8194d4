//! Small helpers for pulling typed values back out of a layer's
//! [`LayerFields`] inside `process`/`post_process`, where a handler only
//! has the packet and frame index, not the raw header bytes it parsed
//! earlier in this same dispatch pass.

use std::net::Ipv4Addr;

use fluxcap_core::error::FluxcapError;
use fluxcap_core::field::{FieldValue, LayerFields};
use fluxcap_core::verdict::HandlerVerdict;

fn missing(protocol: &str, name: &str) -> HandlerVerdict {
    HandlerVerdict::Err(FluxcapError::state_corrupted(
        None,
        format!("{protocol}: field '{name}' missing or wrong kind"),
    ))
}

pub fn u8_field(fields: &LayerFields, protocol: &str, name: &str) -> Result<u8, HandlerVerdict> {
    match fields.get(name) {
        Some(FieldValue::Uint8(v)) => Ok(*v),
        _ => Err(missing(protocol, name)),
    }
}

pub fn u16_field(fields: &LayerFields, protocol: &str, name: &str) -> Result<u16, HandlerVerdict> {
    match fields.get(name) {
        Some(FieldValue::Uint16(v)) => Ok(*v),
        _ => Err(missing(protocol, name)),
    }
}

pub fn bool_field(fields: &LayerFields, protocol: &str, name: &str) -> Result<bool, HandlerVerdict> {
    match fields.get(name) {
        Some(FieldValue::Bool(v)) => Ok(*v),
        _ => Err(missing(protocol, name)),
    }
}

pub fn ipv4_field(fields: &LayerFields, protocol: &str, name: &str) -> Result<Ipv4Addr, HandlerVerdict> {
    match fields.get(name) {
        Some(FieldValue::Ipv4(v)) => Ok(*v),
        _ => Err(missing(protocol, name)),
    }
}
