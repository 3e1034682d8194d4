//! Non-live, pausable file input (spec §4.7): reads length-prefixed
//! frames from an in-memory buffer (standing in for a file handle, since
//! this engine reads a frame stream rather than owning a specific capture
//! file format). Deterministic and replayable, unlike a live capture.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fluxcap_core::error::FluxcapError;
use fluxcap_core::input::{InputDriver, RawFrame};

/// One frame as it appears in the backing buffer: a `u32` big-endian
/// length prefix followed by that many bytes.
fn read_frame(cursor: &mut Cursor<Vec<u8>>) -> Option<Vec<u8>> {
    use std::io::Read;
    let mut len_buf = [0u8; 4];
    if cursor.read_exact(&mut len_buf).is_err() {
        return None;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut frame = vec![0u8; len];
    if cursor.read_exact(&mut frame).is_err() {
        return None;
    }
    Some(frame)
}

/// A non-live input reading pre-recorded, length-prefixed frames. `pause`/
/// `resume` are implemented via the `interrupt` latch: a paused read blocks
/// until `interrupt` is called, then re-checks the latch instead of
/// proceeding, so the driver can be resumed without losing its place.
pub struct FileInput {
    link_protocol: &'static str,
    cursor: Cursor<Vec<u8>>,
    interrupted: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    monotonic_base: Duration,
}

impl FileInput {
    pub fn new(frames: Vec<u8>, link_protocol: &'static str) -> Self {
        FileInput {
            link_protocol,
            cursor: Cursor::new(frames),
            interrupted: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            monotonic_base: Duration::ZERO,
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// A thread-safe handle the owner can use to interrupt this driver
    /// from outside the worker thread that owns it (the `InputDriver::
    /// interrupt` method itself takes `&mut self`, which only the worker
    /// thread has).
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }
}

impl InputDriver for FileInput {
    fn is_live(&self) -> bool {
        false
    }

    fn open(&mut self) -> Result<(), FluxcapError> {
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawFrame>, FluxcapError> {
        loop {
            if self.interrupted.swap(false, Ordering::SeqCst) {
                return Ok(None);
            }
            if self.paused.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            return match read_frame(&mut self.cursor) {
                Some(bytes) => {
                    self.monotonic_base += Duration::from_micros(1);
                    Ok(Some(RawFrame::now(bytes, self.link_protocol, self.monotonic_base)))
                }
                None => Ok(None),
            };
        }
    }

    fn interrupt(&mut self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn close(&mut self) -> Result<(), FluxcapError> {
        Ok(())
    }
}
