//! Process-wide signal plumbing for the supervisor.
//!
//! Handlers do as little as possible: every signal only mutates an atomic
//! that the supervisor polls on its next tick. The two exceptions are the
//! third SIGINT, which hard-exits, and SIGUSR2, which captures a backtrace
//! of the signalled thread into that thread's registered slot (this is how
//! timeout reports name the stalled frame).

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// What the operator has asked for via SIGINT so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InterruptStatus {
    /// No supervisor is watching; SIGINT falls through to a hard exit.
    Unsupervised = 0,
    /// Supervised, nothing requested.
    None = 1,
    /// First SIGINT: pause and report.
    InspectRequested = 2,
    /// Inspection underway; a further SIGINT hard-exits.
    InspectInProgress = 3,
    /// Second SIGINT: pause and quit.
    PauseAndQuit = 4,
}

static INTERRUPT: AtomicU8 = AtomicU8::new(InterruptStatus::Unsupervised as u8);
static PRINT_REPORT: AtomicBool = AtomicBool::new(false);
static PIPE_REPORT: AtomicBool = AtomicBool::new(false);

/// Reads the current interrupt state.
pub fn interrupt_status() -> InterruptStatus {
    match INTERRUPT.load(Ordering::SeqCst) {
        1 => InterruptStatus::None,
        2 => InterruptStatus::InspectRequested,
        3 => InterruptStatus::InspectInProgress,
        4 => InterruptStatus::PauseAndQuit,
        _ => InterruptStatus::Unsupervised,
    }
}

/// Sets the interrupt state. Used by the supervisor on entry/exit and
/// around inspection.
pub fn set_interrupt_status(status: InterruptStatus) {
    INTERRUPT.store(status as u8, Ordering::SeqCst);
}

/// Takes the SIGTSTP "print worker report" request, clearing it.
pub fn take_print_request() -> bool {
    PRINT_REPORT.swap(false, Ordering::SeqCst)
}

/// Takes the SIGUSR1 "send worker report to the pipe" request, clearing it.
pub fn take_pipe_request() -> bool {
    PIPE_REPORT.swap(false, Ordering::SeqCst)
}

/// Where a worker thread's backtrace lands when SIGUSR2 arrives.
#[derive(Default)]
pub struct BacktraceSlot {
    captured: Mutex<Option<String>>,
    done: Condvar,
}

impl BacktraceSlot {
    /// Clears a previous capture.
    pub fn reset(&self) {
        *self.captured.lock().unwrap() = None;
    }

    // Called from the signal handler, on the signalled thread.
    fn capture(&self) {
        let backtrace = std::backtrace::Backtrace::force_capture().to_string();
        *self.captured.lock().unwrap() = Some(backtrace);
        self.done.notify_all();
    }

    /// Blocks until a capture arrives or the timeout elapses; returns the
    /// captured text, possibly empty on timeout.
    pub fn wait_for_capture(&self, timeout: Duration) -> String {
        let mut captured = self.captured.lock().unwrap();
        if captured.is_none() {
            let (guard, _) = self.done.wait_timeout(captured, timeout).unwrap();
            captured = guard;
        }
        captured.clone().unwrap_or_default()
    }
}

thread_local! {
    // Raw pointer to this worker's slot; the owning WorkerState keeps the
    // Arc alive for at least as long as the thread runs.
    static WORKER_SLOT: Cell<*const BacktraceSlot> = const { Cell::new(std::ptr::null()) };
}

/// Registers (or clears) the calling thread's backtrace slot.
///
/// # Safety
///
/// The caller must keep `slot` alive until it re-registers with null; the
/// worker loop does this by holding the `Arc<BacktraceSlot>` across its
/// whole lifetime.
pub unsafe fn set_worker_slot(slot: *const BacktraceSlot) {
    WORKER_SLOT.with(|cell| cell.set(slot));
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::sync::Once;

        extern "C" fn handle_sigint(_sig: libc::c_int) {
            match interrupt_status() {
                InterruptStatus::None => set_interrupt_status(InterruptStatus::InspectRequested),
                InterruptStatus::InspectRequested => {
                    set_interrupt_status(InterruptStatus::PauseAndQuit)
                }
                InterruptStatus::Unsupervised
                | InterruptStatus::InspectInProgress
                | InterruptStatus::PauseAndQuit => unsafe { libc::_exit(-2) },
            }
        }

        extern "C" fn handle_sigusr1(_sig: libc::c_int) {
            PIPE_REPORT.store(true, Ordering::SeqCst);
        }

        extern "C" fn handle_sigusr2(_sig: libc::c_int) {
            let slot = WORKER_SLOT.with(|cell| cell.get());
            if !slot.is_null() {
                // The registration contract keeps the slot alive.
                unsafe { (*slot).capture() };
            }
        }

        extern "C" fn handle_sigtstp(_sig: libc::c_int) {
            PRINT_REPORT.store(true, Ordering::SeqCst);
        }

        unsafe fn install(sig: libc::c_int, handler: extern "C" fn(libc::c_int)) {
            libc::signal(sig, handler as *const () as libc::sighandler_t);
        }

        /// Installs the SIGINT/SIGUSR1/SIGUSR2/SIGTSTP handlers, once per
        /// process.
        pub fn install_handlers() {
            static INSTALLED: Once = Once::new();
            INSTALLED.call_once(|| unsafe {
                install(libc::SIGINT, handle_sigint);
                install(libc::SIGUSR1, handle_sigusr1);
                install(libc::SIGUSR2, handle_sigusr2);
                install(libc::SIGTSTP, handle_sigtstp);
            });
        }

        /// Asks `thread` to capture its backtrace by delivering SIGUSR2.
        pub fn request_backtrace(thread: libc::pthread_t) {
            unsafe {
                libc::pthread_kill(thread, libc::SIGUSR2);
            }
        }

        /// The calling thread's native handle, for later
        /// [`request_backtrace`] calls.
        pub fn current_thread_handle() -> libc::pthread_t {
            unsafe { libc::pthread_self() }
        }
    } else {
        /// No-op off unix: signals are not wired up.
        pub fn install_handlers() {}
    }
}

#[cfg(test)]
mod tests {
    use super::InterruptStatus;

    #[test]
    fn interrupt_status_round_trips() {
        super::set_interrupt_status(InterruptStatus::None);
        assert_eq!(super::interrupt_status(), InterruptStatus::None);
        super::set_interrupt_status(InterruptStatus::PauseAndQuit);
        assert_eq!(super::interrupt_status(), InterruptStatus::PauseAndQuit);
        super::set_interrupt_status(InterruptStatus::Unsupervised);
    }

    #[cfg(unix)]
    #[test]
    fn sigusr2_captures_into_the_registered_slot() {
        use std::sync::Arc;
        use std::time::Duration;

        use super::BacktraceSlot;

        let slot = Arc::new(BacktraceSlot::default());
        let handle = {
            let slot = slot.clone();
            std::thread::spawn(move || {
                super::install_handlers();
                unsafe { super::set_worker_slot(Arc::as_ptr(&slot)) };
                super::request_backtrace(super::current_thread_handle());
                std::thread::sleep(Duration::from_millis(100));
                unsafe { super::set_worker_slot(std::ptr::null()) };
            })
        };
        let backtrace = slot.wait_for_capture(Duration::from_secs(5));
        handle.join().unwrap();
        assert!(!backtrace.is_empty());
    }
}
