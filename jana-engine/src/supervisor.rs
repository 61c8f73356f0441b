//! The single controller loop: ticker, timeout enforcement, interrupt
//! polling, worker reports, and end-of-run failure aggregation.

use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jana_event::{Error, Result};
use jana_log::si::si_prefix;
use jana_log::{error, info};

use crate::engine::{ExecutionEngine, ExitCode, RunStatus};
use crate::signal::{self, BacktraceSlot, InterruptStatus};

const CAPTURE_WAIT: Duration = Duration::from_secs(1);

/// Runs the supervisor loop on the calling thread until the topology
/// pauses, finishes, or fails. On failure, aggregates the stored worker
/// errors and returns the first.
pub(crate) fn supervise(engine: &Arc<ExecutionEngine>) -> Result<()> {
    signal::set_interrupt_status(InterruptStatus::None);
    let mut last_event_count = 0usize;
    let mut last_tick = Instant::now();

    loop {
        engine.check_timeouts();

        if signal::take_print_request() {
            info!("{}", worker_report(engine, true));
        }
        if signal::take_pipe_request() {
            send_report_to_pipe(engine);
        }
        poll_status_pipe(engine);

        let perf = engine.perf();
        let interrupt = signal::interrupt_status();
        match perf.run_status {
            RunStatus::Paused if interrupt != InterruptStatus::InspectRequested => break,
            RunStatus::Finished | RunStatus::Failed => break,
            _ => {}
        }

        match interrupt {
            InterruptStatus::InspectRequested => match perf.run_status {
                RunStatus::Paused => {
                    // The interactive inspector degrades to a report here;
                    // processing resumes right after.
                    engine.set_timeout_enabled(false);
                    signal::set_interrupt_status(InterruptStatus::InspectInProgress);
                    info!("{}", worker_report(engine, true));
                    signal::set_interrupt_status(InterruptStatus::None);
                    engine.set_timeout_enabled(true);
                    let _ = engine.start_topology();
                    last_tick = Instant::now();
                    last_event_count = 0;
                    continue;
                }
                RunStatus::Running => engine.request_pause(),
                _ => {}
            },
            InterruptStatus::PauseAndQuit => engine.request_pause(),
            _ => {}
        }

        if engine.show_ticker.load(Ordering::SeqCst) {
            let now = Instant::now();
            let dt = now.saturating_duration_since(last_tick).as_secs_f64();
            let delta = perf.event_count.saturating_sub(last_event_count);
            let instantaneous = if dt > 0.0 { delta as f64 / dt } else { 0.0 };
            info!(
                "status: {} events processed at {}Hz ({}Hz avg)",
                perf.event_count,
                si_prefix(instantaneous),
                si_prefix(perf.throughput_hz)
            );
            last_tick = now;
            last_event_count = perf.event_count;
        }

        std::thread::sleep(engine.ticker_interval);
    }
    info!("processing paused");

    let failure = if engine.run_status() == RunStatus::Failed {
        signal::set_interrupt_status(InterruptStatus::Unsupervised);
        handle_failures(engine)
    } else {
        signal::set_interrupt_status(InterruptStatus::Unsupervised);
        None
    };

    info!("{}", final_report(engine));
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

struct ReportTarget {
    worker_id: usize,
    arrow: String,
    slot: Arc<BacktraceSlot>,
    #[cfg(unix)]
    pthread: Option<libc::pthread_t>,
}

fn handle_failures(engine: &ExecutionEngine) -> Option<Error> {
    let mut targets = Vec::new();
    {
        let state = engine.lock_state();
        for worker in &state.workers {
            let arrow = engine.arrow_name(worker.last_arrow_id);
            if worker.timed_out {
                error!(
                    "timeout in worker thread {} while executing '{}' on event #{}",
                    worker.worker_id, arrow, worker.last_event_nr
                );
                worker.backtrace.reset();
                targets.push(ReportTarget {
                    worker_id: worker.worker_id,
                    arrow,
                    slot: worker.backtrace.clone(),
                    #[cfg(unix)]
                    pthread: worker.pthread,
                });
            } else if worker.stored_error.is_some() {
                error!(
                    "exception in worker thread {} while executing '{}' on event #{}",
                    worker.worker_id, arrow, worker.last_event_nr
                );
            }
        }
    }

    #[cfg(unix)]
    for target in &targets {
        if let Some(pthread) = target.pthread {
            signal::request_backtrace(pthread);
        }
    }
    let mut timeout_error = None;
    for target in targets {
        let backtrace = target.slot.wait_for_capture(CAPTURE_WAIT);
        timeout_error.get_or_insert(Error::Timeout {
            worker_id: target.worker_id,
            arrow: target.arrow,
            backtrace,
        });
    }

    // Stored user errors outrank the timeout, matching the order the
    // failures were actually raised in.
    let mut state = engine.lock_state();
    for worker in &mut state.workers {
        if let Some(err) = worker.stored_error.take() {
            let code = match &err {
                Error::Quit(code) => *code,
                _ => ExitCode::UnhandledException as i32,
            };
            engine.set_exit_code(code);
            return Some(err);
        }
    }
    drop(state);
    if timeout_error.is_some() {
        engine.set_exit_code(ExitCode::Timeout as i32);
    }
    timeout_error
}

/// Formats the per-worker report: current arrow, current event, and (when
/// `capture` is set, on unix) a backtrace from each live worker thread.
pub(crate) fn worker_report(engine: &ExecutionEngine, capture: bool) -> String {
    struct Row {
        worker_id: usize,
        cpu_id: usize,
        arrow: String,
        event_nr: u64,
        slot: Arc<BacktraceSlot>,
        #[cfg(unix)]
        pthread: Option<libc::pthread_t>,
    }

    let (status, rows) = {
        let state = engine.lock_state();
        let rows: Vec<Row> = state
            .workers
            .iter()
            .map(|worker| Row {
                worker_id: worker.worker_id,
                cpu_id: worker.cpu_id,
                arrow: engine.arrow_name(worker.last_arrow_id),
                event_nr: worker.last_event_nr,
                slot: worker.backtrace.clone(),
                #[cfg(unix)]
                pthread: worker.pthread,
            })
            .collect();
        (state.run_status, rows)
    };

    #[cfg(unix)]
    if capture {
        for row in &rows {
            if let Some(pthread) = row.pthread {
                row.slot.reset();
                signal::request_backtrace(pthread);
            }
        }
    }

    let mut out = format!("Worker report (run status: {status})\n");
    for row in rows {
        let _ = writeln!(out, "------------------------------");
        let _ = writeln!(out, "  Worker:        {}", row.worker_id);
        let _ = writeln!(out, "  Assigned cpu:  {}", row.cpu_id);
        let _ = writeln!(out, "  Current arrow: {}", row.arrow);
        let _ = writeln!(out, "  Current event: {}", row.event_nr);
        if capture {
            let backtrace = row.slot.wait_for_capture(CAPTURE_WAIT);
            if !backtrace.is_empty() {
                let _ = writeln!(out, "  Backtrace:\n{backtrace}");
            }
        }
    }
    out
}

/// Formats the end-of-run summary: totals plus per-arrow latency and the
/// throughput each arrow would bottleneck the topology at.
pub(crate) fn final_report(engine: &ExecutionEngine) -> String {
    let perf = engine.perf();
    let metrics = engine.metrics_snapshot();

    let mut out = String::from("Detailed report:\n");
    let _ = writeln!(
        out,
        "  Avg throughput [Hz]:      {}",
        si_prefix(perf.throughput_hz)
    );
    let _ = writeln!(out, "  Completed events [count]: {}", perf.event_count);
    let _ = writeln!(
        out,
        "  Total uptime [s]:         {:.3}",
        perf.uptime.as_secs_f64()
    );
    let _ = writeln!(out, "  Thread team size [count]: {}", perf.thread_count);
    let _ = writeln!(out, "  Arrow-level metrics:");

    let mut total_useful = Duration::ZERO;
    for arrow in &metrics.arrows {
        total_useful += arrow.processing_time;
        let _ = writeln!(out, "  - Arrow name:                 {}", arrow.name);
        let _ = writeln!(out, "    Parallel:                   {}", arrow.is_parallel);
        let _ = writeln!(
            out,
            "    Events completed:           {}",
            arrow.events_processed
        );
        if arrow.events_processed > 0 {
            let avg_latency_ms =
                arrow.processing_time.as_secs_f64() * 1e3 / arrow.events_processed as f64;
            let mut bottleneck_hz = if avg_latency_ms > 0.0 {
                1e3 / avg_latency_ms
            } else {
                f64::INFINITY
            };
            if arrow.is_parallel {
                bottleneck_hz *= perf.thread_count.max(1) as f64;
            }
            let _ = writeln!(out, "    Avg latency [ms/event]:     {avg_latency_ms:.4}");
            let _ = writeln!(
                out,
                "    Throughput bottleneck [Hz]: {}",
                si_prefix(bottleneck_hz)
            );
        }
    }

    let _ = writeln!(
        out,
        "  Total useful time [s]:    {:.4}",
        total_useful.as_secs_f64()
    );
    let _ = writeln!(
        out,
        "  Total scheduler time [s]: {:.4}",
        metrics.total_scheduler_time.as_secs_f64()
    );
    let _ = writeln!(
        out,
        "  Total idle time [s]:      {:.4}",
        metrics.total_idle_time.as_secs_f64()
    );
    let _ = write!(
        out,
        "Final report: {} events processed at {}Hz",
        perf.event_count,
        si_prefix(perf.throughput_hz)
    );
    out
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::io::{Read, Write};
        use std::os::unix::fs::OpenOptionsExt;

        // A byte written to the FIFO by an external `jana-status`-style
        // query triggers a worker report back into the pipe.
        fn poll_status_pipe(engine: &ExecutionEngine) {
            let Some(path) = &engine.status_pipe else { return };
            let Ok(mut pipe) = std::fs::OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            else {
                return;
            };
            let mut byte = [0u8; 1];
            if matches!(pipe.read(&mut byte), Ok(n) if n > 0) {
                send_report_to_pipe(engine);
            }
        }

        fn send_report_to_pipe(engine: &ExecutionEngine) {
            let Some(path) = &engine.status_pipe else {
                info!("no status pipe configured; set jana:status_fname to enable one");
                return;
            };
            let report = worker_report(engine, true);
            match std::fs::OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            {
                Ok(mut pipe) => {
                    let _ = pipe.write_all(report.as_bytes());
                }
                Err(err) => {
                    error!(
                        "unable to open status pipe '{}' for writing: {err}; \
                         the report still lands in the log",
                        path.display()
                    );
                    info!("{report}");
                }
            }
        }
    } else {
        fn poll_status_pipe(_engine: &ExecutionEngine) {}

        fn send_report_to_pipe(engine: &ExecutionEngine) {
            info!("{}", worker_report(engine, true));
        }
    }
}
