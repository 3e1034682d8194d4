use crate::error::FluxcapError;

/// Return code shared by parse/process/post-process handlers (spec §4.1).
///
/// Only `Err` ever surfaces a [`FluxcapError`] to the dispatcher; `Invalid`
/// is a counted, expected outcome and carries no payload.
#[derive(Debug)]
pub enum HandlerVerdict {
    /// Continue: recurse into `next_proto` if one was set.
    Ok,
    /// The packet is consumed by this layer. Do not recurse, but still run
    /// post-process for frames already parsed.
    Stop,
    /// On-wire malformation. Increment the per-protocol counter and drop.
    Invalid,
    /// Fatal for this packet.
    Err(FluxcapError),
}

impl HandlerVerdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, HandlerVerdict::Ok)
    }
}

impl From<FluxcapError> for HandlerVerdict {
    fn from(err: FluxcapError) -> Self {
        HandlerVerdict::Err(err)
    }
}
