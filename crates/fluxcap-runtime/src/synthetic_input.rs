//! Live, synthetic input (spec §6): a generator standing in for a real
//! capture driver, since kernel-level packet capture is an explicit
//! non-goal. Useful for exercising the live/non-live exclusivity rule
//! (scenario S5) and the engine's worker pool without a real NIC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fluxcap_core::error::FluxcapError;
use fluxcap_core::input::{InputDriver, RawFrame};

/// Produces frames from a closure at a fixed interval until interrupted.
/// `is_live` is always `true` — this drives the exclusivity rule exactly
/// as a real interface capture driver would.
pub struct SyntheticInput {
    link_protocol: &'static str,
    generator: Box<dyn FnMut(u64) -> Option<Vec<u8>> + Send>,
    tick: u64,
    interval: Duration,
    interrupted: Arc<AtomicBool>,
}

impl SyntheticInput {
    pub fn new(
        link_protocol: &'static str,
        interval: Duration,
        generator: impl FnMut(u64) -> Option<Vec<u8>> + Send + 'static,
    ) -> Self {
        SyntheticInput {
            link_protocol,
            generator: Box::new(generator),
            tick: 0,
            interval,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }
}

impl InputDriver for SyntheticInput {
    fn is_live(&self) -> bool {
        true
    }

    fn open(&mut self) -> Result<(), FluxcapError> {
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawFrame>, FluxcapError> {
        if self.interrupted.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
        let tick = self.tick;
        self.tick += 1;
        match (self.generator)(tick) {
            Some(bytes) => Ok(Some(RawFrame::now(bytes, self.link_protocol, self.interval * tick as u32))),
            None => Ok(None),
        }
    }

    fn interrupt(&mut self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn close(&mut self) -> Result<(), FluxcapError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_live() {
        let input = SyntheticInput::new("eth", Duration::ZERO, |_| None);
        assert!(input.is_live());
    }

    #[test]
    fn generates_frames_until_generator_returns_none() {
        let mut input = SyntheticInput::new("eth", Duration::ZERO, |tick| {
            if tick < 2 {
                Some(vec![tick as u8])
            } else {
                None
            }
        });
        assert!(input.read().unwrap().is_some());
        assert!(input.read().unwrap().is_some());
        assert!(input.read().unwrap().is_none());
    }

    #[test]
    fn interrupt_stops_generation() {
        let mut input = SyntheticInput::new("eth", Duration::ZERO, |_| Some(vec![0]));
        input.interrupt();
        assert!(input.read().unwrap().is_none());
    }
}
