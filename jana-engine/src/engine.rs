use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use jana_event::{Error, Event, Result};
use jana_log::{debug, error, info, trace, warn};
use jana_params::ParameterManager;
use jana_topology::{Arrow, FireResult, Outputs, PortIndex, PullResult, Topology};
use smallvec::SmallVec;

use crate::signal::{self, BacktraceSlot};

/// Process exit codes reported alongside `run()` failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Clean shutdown.
    Success = 0,
    /// A user component raised an error.
    UnhandledException = 1,
    /// A worker missed its heartbeat deadline.
    Timeout = 2,
}

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Not processing; the resting state before `run` and after draining.
    Paused,
    /// Workers are firing arrows.
    Running,
    /// Pause requested; in-flight fires are completing.
    Pausing,
    /// Sources are off; the pipeline is emptying.
    Draining,
    /// A worker stored an error or timed out.
    Failed,
    /// Terminal: arrows and pools have been finalized.
    Finished,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Paused => "Paused",
            RunStatus::Running => "Running",
            RunStatus::Pausing => "Pausing",
            RunStatus::Draining => "Draining",
            RunStatus::Failed => "Failed",
            RunStatus::Finished => "Finished",
        };
        f.write_str(name)
    }
}

/// Live performance snapshot.
#[derive(Debug, Clone)]
pub struct Perf {
    /// Current lifecycle state.
    pub run_status: RunStatus,
    /// Events retired since the current run started.
    pub event_count: usize,
    /// Wall time since the current run started (frozen once paused).
    pub uptime: Duration,
    /// Average throughput over the run.
    pub throughput_hz: f64,
    /// Current worker count.
    pub thread_count: usize,
}

/// One checked-out unit of work: an arrow plus its input event and output
/// reservations. Produced by [`ExecutionEngine::exchange_task`], fired by
/// the worker outside the engine lock, and handed back on the next
/// exchange.
pub struct Task {
    arrow_id: usize,
    arrow: Arc<Arrow>,
    location: usize,
    input: Option<Box<Event>>,
    input_port: Option<PortIndex>,
    reservations: SmallVec<[(PortIndex, usize); 2]>,
    outputs: Outputs,
    result: Option<Result<FireResult>>,
}

impl Task {
    /// Name of the arrow this task fires.
    pub fn arrow_name(&self) -> &str {
        self.arrow.name()
    }

    /// Id of the arrow this task fires.
    pub fn arrow_id(&self) -> usize {
        self.arrow_id
    }

    /// Event number of the input, before the task has fired.
    pub fn input_event_nr(&self) -> Option<u64> {
        self.input.as_ref().map(|event| event.event_nr())
    }

    /// Number of outputs produced by the fire.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// The fire outcome, once fired.
    pub fn fire_result(&self) -> Option<&Result<FireResult>> {
        self.result.as_ref()
    }

    /// Runs the arrow on this task's input. Called by workers outside the
    /// engine lock; panics in user code are converted into stored errors.
    pub fn fire(&mut self) {
        let input = self.input.take();
        let input_port = self.input_port;
        let location = self.location;
        let mut outputs = Outputs::new();
        let arrow = self.arrow.clone();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            arrow.fire(input, input_port, &mut outputs, location)
        }));
        self.result = Some(match outcome {
            Ok(result) => result,
            Err(panic) => Err(Error::user(format!(
                "panic in arrow '{}': {}",
                self.arrow.name(),
                panic_message(&panic)
            ))),
        });
        self.outputs = outputs;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrowStatus {
    Paused,
    Running,
    Finished,
}

struct ArrowState {
    status: ArrowStatus,
    active_tasks: usize,
    events_processed: usize,
    processing_time: Duration,
    // Earliest moment the scheduler should try this arrow again after a
    // ComeBackLater.
    next_visit_time: Option<Instant>,
}

pub(crate) struct WorkerState {
    pub(crate) worker_id: usize,
    pub(crate) cpu_id: usize,
    pub(crate) location_id: usize,
    thread: Option<JoinHandle<()>>,
    #[cfg(unix)]
    pub(crate) pthread: Option<libc::pthread_t>,
    stop_requested: bool,
    pub(crate) timed_out: bool,
    // Whether the worker currently has a task checked out; only busy
    // workers are subject to the heartbeat timeout.
    busy: bool,
    warmed_up: bool,
    pub(crate) last_arrow_id: Option<usize>,
    pub(crate) last_event_nr: u64,
    last_checkout_time: Instant,
    pub(crate) stored_error: Option<Error>,
    pub(crate) backtrace: Arc<BacktraceSlot>,
}

impl WorkerState {
    fn new(worker_id: usize, cpu_id: usize, location_id: usize) -> Self {
        Self {
            worker_id,
            cpu_id,
            location_id,
            thread: None,
            #[cfg(unix)]
            pthread: None,
            stop_requested: false,
            timed_out: false,
            busy: false,
            warmed_up: false,
            last_arrow_id: None,
            last_event_nr: 0,
            last_checkout_time: Instant::now(),
            stored_error: None,
            backtrace: Arc::new(BacktraceSlot::default()),
        }
    }
}

pub(crate) struct EngineState {
    pub(crate) run_status: RunStatus,
    arrows: Vec<ArrowState>,
    pub(crate) workers: Vec<WorkerState>,
    next_arrow_id: usize,
    event_count_at_start: usize,
    event_count_at_finish: usize,
    time_at_start: Instant,
    time_at_finish: Instant,
    total_scheduler_time: Duration,
    total_idle_time: Duration,
}

/// The worker pool and cooperative scheduler.
///
/// One mutex guards all scheduling state; user code always runs outside
/// it. Workers loop on [`exchange_task`](Self::exchange_task): hand back
/// the completed task, receive the next ready one, block on the condition
/// variable when nothing is ready. A single supervisor (driven from
/// [`run`](Self::run)) owns the ticker, timeouts, signals, and reports.
pub struct ExecutionEngine {
    topology: Arc<Topology>,
    state: Mutex<EngineState>,
    condvar: Condvar,
    nthreads: usize,
    timeout: Duration,
    warmup_timeout: Duration,
    backoff: Duration,
    pub(crate) ticker_interval: Duration,
    pub(crate) show_ticker: AtomicBool,
    enable_timeout: AtomicBool,
    pub(crate) status_pipe: Option<PathBuf>,
    exit_code: AtomicI32,
}

impl ExecutionEngine {
    /// Creates the engine: declares its parameters, initializes every
    /// arrow (opening sources, initializing processors), and creates the
    /// status FIFO when one is configured.
    pub fn new(topology: Topology, params: &ParameterManager) -> Result<Arc<Self>> {
        let config_err = |e: jana_params::ParseError| Error::Configuration(e.to_string());

        let nthreads = params
            .set_default("nthreads", 1usize, "Initial worker count")
            .map_err(config_err)?;
        let timeout_s = params
            .set_default(
                "jana:timeout",
                8u64,
                "Seconds a busy worker may go without a heartbeat (0 disables)",
            )
            .map_err(config_err)?;
        let warmup_timeout_s = params
            .set_default(
                "jana:warmup_timeout",
                30u64,
                "Heartbeat allowance for cold events (first cycle per event)",
            )
            .map_err(config_err)?;
        let backoff_ms = params
            .set_default(
                "jana:backoff_interval",
                10u64,
                "Milliseconds before retrying an arrow that reported ComeBackLater",
            )
            .map_err(config_err)?;
        let ticker_ms = params
            .set_default("jana:ticker_interval", 1000u64, "Supervisor tick period (ms)")
            .map_err(config_err)?;
        let show_ticker = params
            .set_default("jana:show_ticker", true, "Log a throughput line per tick")
            .map_err(config_err)?;
        let status_fname = params
            .set_default(
                "jana:status_fname",
                String::new(),
                "Named pipe for status queries (empty disables)",
            )
            .map_err(config_err)?;

        for arrow in topology.arrows() {
            arrow.initialize()?;
        }

        let arrows = topology
            .arrows()
            .iter()
            .map(|_| ArrowState {
                status: ArrowStatus::Paused,
                active_tasks: 0,
                events_processed: 0,
                processing_time: Duration::ZERO,
                next_visit_time: None,
            })
            .collect();

        let status_pipe = (!status_fname.is_empty()).then(|| PathBuf::from(&status_fname));
        if let Some(path) = &status_pipe {
            create_fifo(path);
        }

        let now = Instant::now();
        Ok(Arc::new(Self {
            topology: Arc::new(topology),
            state: Mutex::new(EngineState {
                run_status: RunStatus::Paused,
                arrows,
                workers: Vec::new(),
                next_arrow_id: 0,
                event_count_at_start: 0,
                event_count_at_finish: 0,
                time_at_start: now,
                time_at_finish: now,
                total_scheduler_time: Duration::ZERO,
                total_idle_time: Duration::ZERO,
            }),
            condvar: Condvar::new(),
            nthreads,
            timeout: Duration::from_secs(timeout_s),
            warmup_timeout: Duration::from_secs(warmup_timeout_s),
            backoff: Duration::from_millis(backoff_ms.max(1)),
            ticker_interval: Duration::from_millis(ticker_ms.max(1)),
            show_ticker: AtomicBool::new(show_ticker),
            enable_timeout: AtomicBool::new(true),
            status_pipe,
            exit_code: AtomicI32::new(ExitCode::Success as i32),
        }))
    }

    /// The topology this engine drives.
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs the topology to completion on `nthreads` workers, supervising
    /// from the calling thread. Returns once the topology pauses (sources
    /// exhausted or pause requested) or fails; failures come back as the
    /// first stored worker error, with [`exit_code`](Self::exit_code) set.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        signal::install_handlers();
        self.start_topology()?;
        self.scale(self.nthreads)?;
        let result = crate::supervisor::supervise(self);
        self.scale(0)?;
        result
    }

    /// Moves the topology to `Running` without touching the worker pool.
    /// Exposed for callers that drive workers themselves.
    pub fn start_topology(&self) -> Result<()> {
        let mut state = self.lock_state();
        match state.run_status {
            RunStatus::Failed => {
                return Err(Error::Configuration(
                    "cannot run the topology: it has already failed".into(),
                ))
            }
            RunStatus::Finished => {
                return Err(Error::Configuration(
                    "cannot run the topology: it has already finished".into(),
                ))
            }
            _ => {}
        }
        let now = Instant::now();
        state.time_at_start = now;
        state.event_count_at_start = state.event_count_at_finish;
        for arrow in &mut state.arrows {
            if arrow.status == ArrowStatus::Paused {
                arrow.status = ArrowStatus::Running;
            }
        }
        for worker in &mut state.workers {
            worker.last_checkout_time = now;
        }
        state.run_status = RunStatus::Running;
        drop(state);
        self.condvar.notify_one();
        Ok(())
    }

    /// Sets the worker pool size. Growth spawns threads; shrinkage asks
    /// them to stop and joins, detaching any thread that previously timed
    /// out rather than cancelling it.
    pub fn scale(self: &Arc<Self>, nthreads: usize) -> Result<()> {
        let mut state = self.lock_state();
        let prev = state.workers.len();

        if prev < nthreads {
            debug!("scaling up to {nthreads} worker threads");
            for worker_id in prev..nthreads {
                let cpu_id = self.topology.mapping().cpu_id(worker_id);
                let location_id = self.topology.mapping().loc_id(worker_id);
                let mut worker = WorkerState::new(worker_id, cpu_id, location_id);
                let engine = self.clone();
                let thread = std::thread::Builder::new()
                    .name(format!("jana-worker-{worker_id}"))
                    .spawn(move || engine.run_worker(worker_id))
                    .map_err(|e| {
                        Error::Configuration(format!("cannot spawn worker {worker_id}: {e}"))
                    })?;
                debug!("launching worker {worker_id} on cpu={cpu_id}, location={location_id}");
                worker.thread = Some(thread);
                state.workers.push(worker);
            }
        } else if prev > nthreads {
            debug!("scaling down to {nthreads} worker threads");
            for worker in &mut state.workers[nthreads..] {
                worker.stop_requested = true;
            }
            self.condvar.notify_all();
            let handles: Vec<(usize, bool, Option<JoinHandle<()>>)> = state.workers[nthreads..]
                .iter_mut()
                .map(|w| (w.worker_id, w.timed_out, w.thread.take()))
                .collect();
            drop(state);

            for (worker_id, timed_out, handle) in handles {
                let Some(handle) = handle else { continue };
                if timed_out {
                    // The thread is wedged in user code. Relinquish the
                    // handle instead of cancelling it; it is out there,
                    // somewhere, biding its time.
                    debug!("detaching timed-out worker {worker_id}");
                    drop(handle);
                } else {
                    let _ = handle.join();
                    debug!("joined worker {worker_id}");
                }
            }

            state = self.lock_state();
            state.workers.truncate(nthreads);
        }
        Ok(())
    }

    /// Requests a cooperative pause: every arrow deactivates once its
    /// in-flight fires complete.
    pub fn request_pause(&self) {
        let mut state = self.lock_state();
        if state.run_status != RunStatus::Running {
            return;
        }
        state.run_status = RunStatus::Pausing;
        for arrow in &mut state.arrows {
            if arrow.status == ArrowStatus::Running {
                arrow.status = ArrowStatus::Paused;
            }
        }
        info!("pause requested");
        drop(state);
        self.condvar.notify_all();
    }

    /// Deactivates sources only and lets the pipeline empty.
    pub fn request_drain(&self) {
        let mut state = self.lock_state();
        if state.run_status != RunStatus::Running {
            return;
        }
        state.run_status = RunStatus::Draining;
        for (arrow_id, arrow) in self.topology.arrows().iter().enumerate() {
            if arrow.is_source() && state.arrows[arrow_id].status == ArrowStatus::Running {
                state.arrows[arrow_id].status = ArrowStatus::Paused;
            }
        }
        info!("drain requested");
        drop(state);
        self.condvar.notify_all();
    }

    /// Blocks until the engine reaches `Paused`, `Finished`, or `Failed`.
    ///
    /// Also performs the quiescence check itself, so a topology driven by
    /// zero workers (external stepping) still settles into `Paused`.
    pub fn wait(&self) -> RunStatus {
        loop {
            let status = {
                let mut state = self.lock_state();
                self.maybe_pause(&mut state);
                state.run_status
            };
            match status {
                RunStatus::Paused | RunStatus::Finished | RunStatus::Failed => return status,
                _ => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    /// Finalizes every arrow and pool. Requires a paused topology;
    /// terminal.
    pub fn finish(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.run_status != RunStatus::Paused {
            return Err(Error::Configuration(format!(
                "finish requires a paused topology, but it is {}",
                state.run_status
            )));
        }
        debug!("finishing processing");
        let mut first_error = None;
        for arrow in self.topology.arrows() {
            if let Err(err) = arrow.finalize() {
                error!("error finalizing arrow '{}': {err}", arrow.name());
                first_error.get_or_insert(err);
            }
        }
        for pool in self.topology.pools() {
            pool.finalize();
        }
        state.run_status = RunStatus::Finished;
        info!("finished processing");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The current lifecycle state.
    pub fn run_status(&self) -> RunStatus {
        self.lock_state().run_status
    }

    /// The exit code recorded by failure handling.
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    pub(crate) fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    /// Toggles the supervisor ticker line.
    pub fn set_ticker_enabled(&self, enabled: bool) {
        self.show_ticker.store(enabled, Ordering::SeqCst);
    }

    /// Toggles timeout enforcement (used around inspection).
    pub fn set_timeout_enabled(&self, enabled: bool) {
        self.enable_timeout.store(enabled, Ordering::SeqCst);
    }

    /// Live performance counters.
    pub fn perf(&self) -> Perf {
        let state = self.lock_state();
        let (event_count, uptime) = match state.run_status {
            RunStatus::Paused | RunStatus::Finished => (
                state
                    .event_count_at_finish
                    .saturating_sub(state.event_count_at_start),
                state
                    .time_at_finish
                    .saturating_duration_since(state.time_at_start),
            ),
            _ => (
                Self::total_events(&state).saturating_sub(state.event_count_at_start),
                state.time_at_start.elapsed(),
            ),
        };
        let secs = uptime.as_secs_f64();
        Perf {
            run_status: state.run_status,
            event_count,
            uptime,
            throughput_hz: if secs > 0.0 {
                event_count as f64 / secs
            } else {
                0.0
            },
            thread_count: state.workers.len(),
        }
    }

    fn total_events(state: &EngineState) -> usize {
        state.arrows.iter().map(|a| a.events_processed).sum()
    }

    /// Registers a worker slot for an external (caller-owned) thread, so
    /// it can participate in [`exchange_task`](Self::exchange_task).
    pub fn register_external_worker(&self) -> usize {
        let mut state = self.lock_state();
        let worker_id = state.workers.len();
        let cpu_id = self.topology.mapping().cpu_id(worker_id);
        let location_id = self.topology.mapping().loc_id(worker_id);
        state
            .workers
            .push(WorkerState::new(worker_id, cpu_id, location_id));
        worker_id
    }

    fn run_worker(self: Arc<Self>, worker_id: usize) {
        debug!("launched worker thread {worker_id}");
        let slot = {
            let mut state = self.lock_state();
            let Some(worker) = state.workers.get_mut(worker_id) else {
                return;
            };
            #[cfg(unix)]
            {
                worker.pthread = Some(signal::current_thread_handle());
            }
            worker.backtrace.clone()
        };
        // The slot outlives the registration: cleared before `slot` drops.
        unsafe { signal::set_worker_slot(Arc::as_ptr(&slot)) };
        self.topology.mapping().pin_current_thread(worker_id);

        let mut task: Option<Task> = None;
        loop {
            task = self.exchange_task(task, worker_id, true);
            let Some(current) = task.as_mut() else { break };
            current.fire();
        }

        unsafe { signal::set_worker_slot(std::ptr::null()) };
        drop(slot);
        debug!("stopped worker thread {worker_id}");
    }

    /// The scheduler entry point: checks a completed task back in, then
    /// returns the next ready task. With `block`, parks on the condition
    /// variable until work appears or the worker is told to stop; without
    /// it, returns `None` immediately when nothing is ready.
    pub fn exchange_task(
        &self,
        completed: Option<Task>,
        worker_id: usize,
        block: bool,
    ) -> Option<Task> {
        // Measured before taking the lock: contention on the engine mutex
        // is part of the scheduler overhead.
        let checkin_time = Instant::now();
        let mut state = self.lock_state();
        if worker_id >= state.workers.len() {
            // A previously detached worker finally returned; its slot is
            // long gone.
            return None;
        }

        if let Some(task) = completed {
            self.checkin_completed(&mut state, worker_id, task, checkin_time);
        }
        if state.workers[worker_id].stop_requested {
            drop(state);
            // The checkin above may have unblocked work for the others.
            self.condvar.notify_one();
            return None;
        }

        let mut found = self.find_next_ready(&mut state, worker_id);
        if !block {
            if found.is_some() {
                let worker = &mut state.workers[worker_id];
                worker.last_checkout_time = Instant::now();
                worker.busy = true;
            }
            drop(state);
            self.condvar.notify_one();
            return found;
        }

        let idle_start = Instant::now();
        state.total_scheduler_time += idle_start.saturating_duration_since(checkin_time);

        while found.is_none() && !state.workers[worker_id].stop_requested {
            state = match Self::earliest_visit(&state) {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        state
                    } else {
                        self.condvar
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                }
                None => self
                    .condvar
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
            found = self.find_next_ready(&mut state, worker_id);
        }

        let now = Instant::now();
        state.total_idle_time += now.saturating_duration_since(idle_start);
        if found.is_some() {
            let worker = &mut state.workers[worker_id];
            worker.last_checkout_time = now;
            worker.busy = true;
        }
        drop(state);
        // Wake one more worker; it wakes the next in turn for as long as
        // ready tasks keep coming, so parallelism ramps without a
        // thundering herd.
        self.condvar.notify_one();
        found
    }

    // Earliest backoff deadline among running arrows, if any.
    fn earliest_visit(state: &EngineState) -> Option<Instant> {
        state
            .arrows
            .iter()
            .filter(|a| a.status == ArrowStatus::Running)
            .filter_map(|a| a.next_visit_time)
            .min()
    }

    fn checkin_completed(
        &self,
        state: &mut EngineState,
        worker_id: usize,
        task: Task,
        checkin_time: Instant,
    ) {
        let location_id = state.workers[worker_id].location_id;
        let last_checkout = state.workers[worker_id].last_checkout_time;

        {
            let arrow_state = &mut state.arrows[task.arrow_id];
            arrow_state.active_tasks -= 1;
            arrow_state.processing_time += checkin_time.saturating_duration_since(last_checkout);
        }

        let completed = task
            .arrow
            .push_outputs(task.outputs, &task.reservations, location_id);
        state.arrows[task.arrow_id].events_processed += completed;

        match task.result {
            Some(Ok(FireResult::KeepGoing)) | None => {}
            Some(Ok(FireResult::ComeBackLater)) => {
                state.arrows[task.arrow_id].next_visit_time = Some(Instant::now() + self.backoff);
            }
            Some(Ok(FireResult::Finished)) => {
                state.arrows[task.arrow_id].status = ArrowStatus::Finished;
                // The last source finishing tips the topology into
                // draining.
                if state.run_status == RunStatus::Running {
                    let any_running_source = self
                        .topology
                        .arrows()
                        .iter()
                        .enumerate()
                        .any(|(id, arrow)| {
                            arrow.is_source() && state.arrows[id].status == ArrowStatus::Running
                        });
                    if !any_running_source {
                        debug!("all sources finished; draining");
                        state.run_status = RunStatus::Draining;
                    }
                }
            }
            Some(Err(err)) => {
                error!(
                    "error in worker thread {worker_id} while executing '{}': {err}",
                    task.arrow.name()
                );
                state.run_status = RunStatus::Failed;
                state.workers[worker_id].stored_error.get_or_insert(err);
            }
        }

        let worker = &mut state.workers[worker_id];
        worker.busy = false;
        worker.last_arrow_id = None;
        worker.last_event_nr = 0;
    }

    fn find_next_ready(&self, state: &mut EngineState, worker_id: usize) -> Option<Task> {
        if matches!(state.run_status, RunStatus::Running | RunStatus::Draining) {
            let arrow_count = state.arrows.len();
            // Rotate the starting arrow so assignments stay balanced and
            // no ready arrow can be starved indefinitely.
            state.next_arrow_id = (state.next_arrow_id + 1) % arrow_count;
            let start = state.next_arrow_id;
            let loc = state.workers[worker_id].location_id;

            for i in start..start + arrow_count {
                let arrow_id = i % arrow_count;
                let arrow = &self.topology.arrows()[arrow_id];
                {
                    let arrow_state = &mut state.arrows[arrow_id];
                    if arrow_state.status != ArrowStatus::Running {
                        continue;
                    }
                    // Clear expired backoffs before any other readiness
                    // check, so a stale deadline cannot keep waking the
                    // pool.
                    if let Some(visit) = arrow_state.next_visit_time {
                        if Instant::now() < visit {
                            continue;
                        }
                        arrow_state.next_visit_time = None;
                    }
                    if !arrow.is_parallel() && arrow_state.active_tasks != 0 {
                        trace!("scheduler: arrow {arrow_id} is sequential and already active");
                        continue;
                    }
                }

                // Backpressure: output space is reserved before the input
                // is taken; an arrow whose outputs cannot be reserved in
                // full is simply not ready.
                let Some(reservations) = arrow.reserve_outputs(loc) else {
                    trace!("scheduler: arrow {arrow_id} blocked on output reservations");
                    continue;
                };

                let input_ports = arrow.next_input_ports();
                let mut input = None;
                let mut input_port = None;
                if !input_ports.is_empty() {
                    for port in input_ports {
                        if let PullResult::Event(event) = arrow.pull(port, loc) {
                            input = Some(event);
                            input_port = Some(port);
                            break;
                        }
                    }
                    if input.is_none() {
                        arrow.unreserve_outputs(&reservations, loc);
                        continue;
                    }
                }

                trace!("scheduler: arrow {arrow_id} is ready");
                state.arrows[arrow_id].active_tasks += 1;
                let worker = &mut state.workers[worker_id];
                worker.last_arrow_id = Some(arrow_id);
                match &input {
                    Some(event) => {
                        worker.warmed_up = event.is_warmed_up();
                        worker.last_event_nr = event.event_nr();
                    }
                    None => {
                        worker.warmed_up = true;
                        worker.last_event_nr = 0;
                    }
                }
                return Some(Task {
                    arrow_id,
                    arrow: arrow.clone(),
                    location: loc,
                    input,
                    input_port,
                    reservations,
                    outputs: Outputs::new(),
                    result: None,
                });
            }
        }

        // Nothing is ready; maybe nothing can become ready either.
        self.maybe_pause(state);

        let worker = &mut state.workers[worker_id];
        worker.last_arrow_id = None;
        worker.last_event_nr = 0;
        None
    }

    // The only place the topology pauses: no source can still emit, no
    // task is in flight, and no unfolder holds a half-unfolded parent.
    fn maybe_pause(&self, state: &mut EngineState) {
        if !matches!(
            state.run_status,
            RunStatus::Running | RunStatus::Pausing | RunStatus::Draining
        ) {
            return;
        }
        for (arrow_id, arrow_state) in state.arrows.iter().enumerate() {
            let arrow = &self.topology.arrows()[arrow_id];
            if arrow_state.active_tasks != 0 {
                return;
            }
            if arrow.is_source() && arrow_state.status == ArrowStatus::Running {
                return;
            }
        }
        // Quiescent as far as the queues go; no fire is in flight, so
        // probing arrow-internal slots cannot block on a firing arrow. An
        // unfolder mid-parent still owes children and counts as pending
        // work even with no queued inputs.
        let any_held_parent = state.arrows.iter().enumerate().any(|(arrow_id, arrow_state)| {
            let arrow = &self.topology.arrows()[arrow_id];
            arrow_state.status == ArrowStatus::Running
                && !arrow.is_source()
                && arrow.next_input_ports().is_empty()
                && arrow.held_events() > 0
        });
        if !any_held_parent {
            state.time_at_finish = Instant::now();
            state.event_count_at_finish = Self::total_events(state);
            state.run_status = RunStatus::Paused;
            debug!("scheduler: processing paused");
        }
    }

    /// Fires one arrow once from the calling thread, pulling its input
    /// and routing its outputs exactly like a worker would. Returns
    /// `Ok(None)` when the arrow was not ready. This is the external
    /// single-stepping interface: with zero workers it drives events
    /// through the topology one arrow at a time.
    pub fn fire(&self, arrow_id: usize, location: usize) -> Result<Option<FireResult>> {
        let mut state = self.lock_state();
        let Some(arrow) = self.topology.arrows().get(arrow_id).cloned() else {
            warn!("firing unsuccessful: no arrow with id {arrow_id}");
            return Ok(None);
        };
        if state.arrows[arrow_id].status == ArrowStatus::Finished {
            return Ok(Some(FireResult::Finished));
        }
        if !arrow.is_parallel() && state.arrows[arrow_id].active_tasks != 0 {
            return Ok(None);
        }
        let Some(reservations) = arrow.reserve_outputs(location) else {
            return Ok(None);
        };
        let input_ports = arrow.next_input_ports();
        let mut input = None;
        let mut input_port = None;
        if !input_ports.is_empty() {
            for port in input_ports {
                if let PullResult::Event(event) = arrow.pull(port, location) {
                    input = Some(event);
                    input_port = Some(port);
                    break;
                }
            }
            if input.is_none() {
                arrow.unreserve_outputs(&reservations, location);
                return Ok(None);
            }
        }
        state.arrows[arrow_id].active_tasks += 1;
        drop(state);

        let mut outputs = Outputs::new();
        let result = arrow.fire(input, input_port, &mut outputs, location);

        let mut state = self.lock_state();
        let completed = arrow.push_outputs(outputs, &reservations, location);
        state.arrows[arrow_id].events_processed += completed;
        state.arrows[arrow_id].active_tasks -= 1;
        match result {
            Ok(FireResult::Finished) => {
                state.arrows[arrow_id].status = ArrowStatus::Finished;
                Ok(Some(FireResult::Finished))
            }
            Ok(other) => Ok(Some(other)),
            Err(err) => {
                state.run_status = RunStatus::Failed;
                Err(err)
            }
        }
    }

    /// Marks every busy worker that has missed its heartbeat deadline,
    /// failing the run if any did. Returns true when a timeout was
    /// detected.
    pub(crate) fn check_timeouts(&self) -> bool {
        if !self.enable_timeout.load(Ordering::SeqCst) || self.timeout.is_zero() {
            return false;
        }
        let mut state = self.lock_state();
        let now = Instant::now();
        let mut detected = false;
        for worker in &mut state.workers {
            if !worker.busy || worker.timed_out {
                continue;
            }
            let limit = if worker.warmed_up {
                self.timeout
            } else {
                self.warmup_timeout
            };
            if !limit.is_zero() && now.saturating_duration_since(worker.last_checkout_time) > limit
            {
                worker.timed_out = true;
                detected = true;
            }
        }
        if detected {
            state.run_status = RunStatus::Failed;
        }
        detected
    }

    pub(crate) fn arrow_name(&self, arrow_id: Option<usize>) -> String {
        arrow_id
            .and_then(|id| self.topology.arrows().get(id))
            .map(|arrow| arrow.name().to_owned())
            .unwrap_or_else(|| "(idle)".to_owned())
    }

    // Per-arrow rows plus scheduler totals for the final report.
    pub(crate) fn metrics_snapshot(&self) -> MetricsSnapshot {
        let state = self.lock_state();
        let arrows = self
            .topology
            .arrows()
            .iter()
            .zip(&state.arrows)
            .map(|(arrow, arrow_state)| ArrowMetrics {
                name: arrow.name().to_owned(),
                is_parallel: arrow.is_parallel(),
                events_processed: arrow_state.events_processed,
                processing_time: arrow_state.processing_time,
            })
            .collect();
        MetricsSnapshot {
            arrows,
            total_scheduler_time: state.total_scheduler_time,
            total_idle_time: state.total_idle_time,
        }
    }
}

pub(crate) struct ArrowMetrics {
    pub(crate) name: String,
    pub(crate) is_parallel: bool,
    pub(crate) events_processed: usize,
    pub(crate) processing_time: Duration,
}

pub(crate) struct MetricsSnapshot {
    pub(crate) arrows: Vec<ArrowMetrics>,
    pub(crate) total_scheduler_time: Duration,
    pub(crate) total_idle_time: Duration,
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn create_fifo(path: &std::path::Path) {
            use std::os::unix::ffi::OsStrExt;
            let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
                return;
            };
            // EEXIST is fine: an earlier run left the FIFO behind.
            unsafe { libc::mkfifo(cpath.as_ptr(), 0o666) };
        }
    } else {
        fn create_fifo(_path: &std::path::Path) {}
    }
}
