//! Engine: wires the registry, conntrack table, timer wheel and built-in
//! protocol modules together, owns the worker pool reading from input
//! drivers, and enforces the live/non-live input exclusivity rule (spec
//! §4.7, §10, scenario S5) and graceful shutdown (scenario S6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use fluxcap_conntrack::timer::TimerWheel;
use fluxcap_conntrack::ConntrackTable;
use fluxcap_core::error::FluxcapError;
use fluxcap_core::input::{InputDriver, InputState, RawFrame};
use fluxcap_core::output::{Event, EventSink};
use fluxcap_core::registry::{ConntrackAccess, Registry};
use fluxcap_core::PipelineDispatcher;

/// Bound on a running input's capture-to-worker queue (spec §5: "a
/// lock-free per-input queue" between the capture thread and the
/// processing workers — `std::sync::mpsc::sync_channel` gives the same
/// backpressure property via a blocking `send`, without pulling in a new
/// dependency none of the corpus this crate is grounded in reaches for).
const INPUT_QUEUE_CAPACITY: usize = 1024;

struct InputSlot {
    is_live: bool,
    /// §4.7 state machine. `Starting`/`Stopping` are held only while a
    /// `start_input`/`stop_input` transition is in flight; the capture and
    /// worker threads settle it to `Running`/`Stopped` once they've
    /// actually taken effect.
    state: Arc<RwLock<InputState>>,
    /// Latches a transition in progress so a second `start_input`/
    /// `stop_input` call against the same name can't race the first one.
    busy: Arc<AtomicBool>,
    interrupt: Arc<dyn Fn() + Send + Sync>,
}

/// Shared pause/resume barrier (spec §5): workers block on the condvar
/// while `paused` is true, rather than busy-polling an atomic, so a
/// paused engine costs nothing beyond one parked OS thread per worker.
struct PauseBarrier {
    paused: Mutex<bool>,
    condvar: Condvar,
}

impl PauseBarrier {
    fn new() -> Self {
        PauseBarrier { paused: Mutex::new(false), condvar: Condvar::new() }
    }

    fn wait_if_paused(&self) {
        let mut guard = self.paused.lock().unwrap();
        while *guard {
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    fn set(&self, paused: bool) {
        *self.paused.lock().unwrap() = paused;
        if !paused {
            self.condvar.notify_all();
        }
    }
}

/// The running engine. Holds everything a worker thread needs an `Arc`
/// clone of to process frames independently of every other worker.
pub struct Engine {
    registry: Arc<Registry>,
    conntrack: Arc<ConntrackTable>,
    timers: Arc<TimerWheel>,
    inputs: Mutex<HashMap<String, InputSlot>>,
    shutdown: Arc<AtomicBool>,
    pause_barrier: Arc<PauseBarrier>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    worker_handles: Mutex<Vec<(String, JoinHandle<()>)>>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
    /// Size of the processing worker pool spawned per running input,
    /// default = CPU count (spec §5).
    worker_pool_size: usize,
}

impl Engine {
    pub fn new(num_shards: usize, default_ttl: Duration, frag_timeout_secs: f64) -> Result<Arc<Self>, FluxcapError> {
        let registry = Arc::new(Registry::new());
        let conntrack = Arc::new(ConntrackTable::new(num_shards, default_ttl));
        let timers = TimerWheel::new();

        let conntrack_dyn: Arc<dyn ConntrackAccess> = conntrack.clone();
        fluxcap_proto::install(&registry, conntrack_dyn, timers.clone(), frag_timeout_secs)?;

        let timer_thread = timers.clone().spawn_thread();

        let worker_pool_size = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        Ok(Arc::new(Engine {
            registry,
            conntrack,
            timers,
            inputs: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            pause_barrier: Arc::new(PauseBarrier::new()),
            sinks: RwLock::new(Vec::new()),
            worker_handles: Mutex::new(Vec::new()),
            timer_thread: Mutex::new(Some(timer_thread)),
            worker_pool_size,
        }))
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn conntrack(&self) -> &Arc<ConntrackTable> {
        &self.conntrack
    }

    /// Enforces the exclusivity rule carried from `input.c` (spec §10,
    /// scenario S5): a non-live input cannot start while anything else is
    /// running, and a live input cannot start while a non-live input is
    /// running. Multiple live inputs may run concurrently.
    fn check_exclusivity(&self, is_live: bool, inputs: &HashMap<String, InputSlot>) -> Result<(), FluxcapError> {
        for slot in inputs.values() {
            if *slot.state.read() == InputState::Stopped {
                continue;
            }
            if !is_live {
                return Err(FluxcapError::ConfigError {
                    reason: "non-live input cannot start while any input is running".into(),
                });
            }
            if !slot.is_live {
                return Err(FluxcapError::ConfigError {
                    reason: "live input cannot start while a non-live input is running".into(),
                });
            }
        }
        Ok(())
    }

    /// Starts one capture thread reading from `driver` under name `name`,
    /// plus a bounded pool of processing worker threads draining the
    /// per-input queue between them (spec §5). Returns an error without
    /// spawning anything if the exclusivity rule rejects it.
    ///
    /// `interrupt` is a thread-safe callback that unblocks `driver`'s
    /// `read()` from outside the capture thread — `InputDriver::interrupt`
    /// itself takes `&mut self`, which only the capture thread can call, so
    /// graceful shutdown needs its own way in. [`crate::file_input::
    /// FileInput::interrupt_handle`] and [`crate::synthetic_input::
    /// SyntheticInput::interrupt_handle`] provide one.
    pub fn start_input(
        self: &Arc<Self>,
        name: impl Into<String>,
        link_protocol: &'static str,
        mut driver: Box<dyn InputDriver>,
        interrupt: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<(), FluxcapError> {
        let name = name.into();
        let is_live = driver.is_live();

        let mut inputs = self.inputs.lock().unwrap();
        if let Some(existing) = inputs.get(&name) {
            if *existing.state.read() != InputState::Stopped {
                return Err(FluxcapError::ConfigError {
                    reason: format!("input {name} is already running"),
                });
            }
        }
        self.check_exclusivity(is_live, &inputs)?;

        let state = Arc::new(RwLock::new(InputState::Starting));
        let busy = Arc::new(AtomicBool::new(true));

        driver.open()?;

        let (tx, rx) = mpsc::sync_channel::<RawFrame>(INPUT_QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        let remaining_workers = Arc::new(AtomicUsize::new(self.worker_pool_size));

        *state.write() = InputState::Running;
        busy.store(false, Ordering::SeqCst);

        inputs.insert(name.clone(), InputSlot {
            is_live,
            state: state.clone(),
            busy,
            interrupt,
        });
        drop(inputs);

        let mut handles = Vec::with_capacity(self.worker_pool_size + 1);

        let capture_engine = self.clone();
        let capture_name = name.clone();
        let capture_state = state.clone();
        let capture_handle = std::thread::Builder::new()
            .name(format!("fluxcap-{name}-capture"))
            .spawn(move || capture_engine.run_capture(capture_name, driver, tx, capture_state))
            .map_err(|e| FluxcapError::Fatal { reason: format!("failed to spawn capture thread: {e}") })?;
        handles.push((format!("{name}/capture"), capture_handle));

        for worker_idx in 0..self.worker_pool_size {
            let worker_engine = self.clone();
            let worker_name = name.clone();
            let worker_state = state.clone();
            let worker_rx = rx.clone();
            let worker_remaining = remaining_workers.clone();
            let handle = std::thread::Builder::new()
                .name(format!("fluxcap-{name}-worker-{worker_idx}"))
                .spawn(move || {
                    worker_engine.run_worker(worker_name, worker_idx, link_protocol, worker_rx, worker_state, worker_remaining)
                })
                .map_err(|e| FluxcapError::Fatal { reason: format!("failed to spawn worker thread: {e}") })?;
            handles.push((format!("{name}/worker-{worker_idx}"), handle));
        }

        self.worker_handles.lock().unwrap().extend(handles);
        Ok(())
    }

    /// Delivers `event` to every registered sink subscribed to its kind
    /// (spec §6).
    fn dispatch_event(&self, event: Event) {
        for sink in self.sinks.read().iter() {
            if sink.subscribed_kinds().contains(&event.kind) {
                sink.emit(&event);
            }
        }
    }

    /// Capture role (spec §5): blocks on `driver.read()` and pushes every
    /// frame onto the per-input queue. `tx`'s blocking `send` is the
    /// backpressure boundary between this thread and the worker pool — a
    /// slow pool stalls capture rather than growing memory without bound.
    fn run_capture(
        self: Arc<Self>,
        name: String,
        mut driver: Box<dyn InputDriver>,
        tx: SyncSender<RawFrame>,
        state: Arc<RwLock<InputState>>,
    ) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) || *state.read() == InputState::Stopping {
                break;
            }
            self.pause_barrier.wait_if_paused();

            match driver.read() {
                Ok(Some(frame)) => {
                    if tx.send(frame).is_err() {
                        // Every worker has exited; nothing left to read for.
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(input = %name, error = %e, "input driver error, stopping");
                    break;
                }
            }
        }

        *state.write() = InputState::Stopping;
        let _ = driver.close();
        debug!(input = %name, "capture stopped");
        // `tx` drops here; once every queued frame is drained each worker's
        // `recv` returns `Err` and it exits on its own.
    }

    /// Processing-worker role (spec §5): one of a bounded pool draining the
    /// shared per-input queue and running the full dispatch pipeline.
    fn run_worker(
        self: Arc<Self>,
        name: String,
        worker_idx: usize,
        link_protocol: &'static str,
        rx: Arc<Mutex<Receiver<RawFrame>>>,
        state: Arc<RwLock<InputState>>,
        remaining: Arc<AtomicUsize>,
    ) {
        let emit_event = |event: Event| self.dispatch_event(event);

        loop {
            let received = {
                let rx = rx.lock().unwrap();
                rx.recv()
            };
            let frame = match received {
                Ok(frame) => frame,
                Err(_) => break,
            };

            let mut packet = fluxcap_core::packet::Packet::new(frame.captured_at, frame.bytes);
            let dispatcher = PipelineDispatcher::with_events(self.registry.as_ref(), self.conntrack.as_ref(), &emit_event);
            let outcome = dispatcher.process(&mut packet, link_protocol);
            debug!(input = %name, worker = worker_idx, ?outcome, "frame dispatched");
        }

        // Last worker out settles the state machine into `Stopped`.
        if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            *state.write() = InputState::Stopped;
            info!(input = %name, "input stopped");
        }
    }

    pub fn stop_input(&self, name: &str) {
        let inputs = self.inputs.lock().unwrap();
        if let Some(slot) = inputs.get(name) {
            if slot.busy.swap(true, Ordering::SeqCst) {
                // A start or stop transition is already in flight.
                return;
            }
            *slot.state.write() = InputState::Stopping;
            (slot.interrupt)();
            slot.busy.store(false, Ordering::SeqCst);
        }
    }

    pub fn pause(&self) {
        self.pause_barrier.set(true);
    }

    pub fn resume(&self) {
        self.pause_barrier.set(false);
    }

    /// One pass of conntrack-entry expiry, releasing each expired entry's
    /// per-protocol private state through the owning protocol's `cleanup`
    /// hook (spec §4.2).
    pub fn expire_sweep(&self) {
        let registry = self.registry.clone();
        self.conntrack.expire_scan(Instant::now(), |entry| {
            entry.release_private_state(|protocol, state| {
                if let Some(descriptor) = registry.get(protocol) {
                    descriptor.handlers.cleanup(state);
                }
            });
        });
    }

    /// Graceful shutdown (scenario S6): interrupt every input driver so
    /// its blocking `read` returns, set the shutdown flag so worker loops
    /// exit even on a clean `Ok(None)`, join every worker thread, run a
    /// final expiry sweep, then stop the timer thread.
    pub fn shutdown(self: &Arc<Self>) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.pause_barrier.set(false);

        for slot in self.inputs.lock().unwrap().values() {
            *slot.state.write() = InputState::Stopping;
            (slot.interrupt)();
        }

        let handles = std::mem::take(&mut *self.worker_handles.lock().unwrap());
        for (name, handle) in handles {
            if !handle.is_finished() {
                debug!(input = %name, "waiting for worker to stop");
            }
            let _ = handle.join();
        }

        self.expire_sweep();

        self.timers.shutdown();
        if let Some(handle) = self.timer_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        info!("engine shut down cleanly");
    }
}
