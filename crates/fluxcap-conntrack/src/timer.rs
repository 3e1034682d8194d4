//! Timer wheel (C10, spec §4.6): `alloc`/`queue`/`dequeue`/`cleanup` on a
//! single hierarchical timer collection per process, fired on a dedicated
//! timer thread. Callbacks must be reentrant w.r.t. their owning conntrack
//! entry — they acquire the CE lock themselves.

use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct TimerSlot {
    callback: Box<dyn FnMut() + Send>,
    /// `None` while dequeued (allocated but not pending). Re-queuing an
    /// already-queued timer just overwrites this, which is what makes
    /// `queue` idempotent w.r.t. firing exactly once (spec §8 invariant 7).
    deadline: Option<Instant>,
}

struct TimerState {
    slots: HashMap<u64, TimerSlot>,
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
}

/// A single process-wide timer collection. `alloc` never fires on its
/// own — only `queue` schedules a firing.
pub struct TimerWheel {
    next_id: AtomicU64,
    state: Mutex<TimerState>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

impl TimerWheel {
    pub fn new() -> Arc<Self> {
        Arc::new(TimerWheel {
            next_id: AtomicU64::new(1),
            state: Mutex::new(TimerState {
                slots: HashMap::new(),
                heap: BinaryHeap::new(),
            }),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn alloc(&self, callback: impl FnMut() + Send + 'static) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        state.slots.insert(
            id,
            TimerSlot {
                callback: Box::new(callback),
                deadline: None,
            },
        );
        TimerHandle(id)
    }

    /// Re-anchors the timer to fire `seconds_from_now` seconds from now,
    /// whether or not it was already queued.
    pub fn queue(&self, handle: TimerHandle, seconds_from_now: f64) {
        let deadline = Instant::now() + Duration::from_secs_f64(seconds_from_now.max(0.0));
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slots.get_mut(&handle.0) {
            slot.deadline = Some(deadline);
            state.heap.push(Reverse((deadline, handle.0)));
            self.wakeup.notify_one();
        }
    }

    pub fn dequeue(&self, handle: TimerHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slots.get_mut(&handle.0) {
            slot.deadline = None;
        }
    }

    pub fn cleanup(&self, handle: TimerHandle) {
        let mut state = self.state.lock().unwrap();
        state.slots.remove(&handle.0);
    }

    /// Spawns the dedicated timer thread. Dropping the returned handle
    /// does not stop the thread; call [`TimerWheel::shutdown`] first.
    pub fn spawn_thread(self: Arc<Self>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("fluxcap-timer".into())
            .spawn(move || self.run())
            .expect("failed to spawn timer thread")
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wakeup.notify_all();
    }

    fn run(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            match state.heap.peek().copied() {
                None => {
                    state = self.wakeup.wait(state).unwrap();
                }
                Some(Reverse((deadline, id))) => {
                    let now = Instant::now();
                    if deadline > now {
                        let (next, timeout_res) =
                            self.wakeup.wait_timeout(state, deadline - now).unwrap();
                        state = next;
                        let _ = timeout_res;
                        continue;
                    }

                    state.heap.pop();
                    // The timer may have been re-anchored or dequeued
                    // since this heap entry was pushed; only fire if this
                    // is still the slot's current deadline.
                    let should_fire = state
                        .slots
                        .get(&id)
                        .and_then(|s| s.deadline)
                        .map(|d| d == deadline)
                        .unwrap_or(false);

                    if should_fire {
                        if let Some(slot) = state.slots.get_mut(&id) {
                            slot.deadline = None;
                        }
                        // Run the callback without holding the state lock
                        // so callbacks can themselves call back into
                        // `queue`/`dequeue`/`cleanup` without deadlocking.
                        let mut callback = {
                            let slot = state.slots.get_mut(&id);
                            slot.and_then(|s| {
                                // Temporarily swap out the callback to call
                                // it outside the lock.
                                Some(std::mem::replace(&mut s.callback, Box::new(|| {})))
                            })
                        };
                        drop(state);
                        if let Some(cb) = &mut callback {
                            cb();
                        }
                        state = self.state.lock().unwrap();
                        if let (Some(cb), Some(slot)) = (callback, state.slots.get_mut(&id)) {
                            slot.callback = cb;
                        }
                    }
                }
            }
        }
    }
}
