//! Stack of another thread
//!
//! The requesting thread sends [`DUMP_SIGNAL`] to the target with `tgkill`; the handler
//! runs on the target, unwinds its own stack into a static slot and flags it done. One
//! request is in flight at a time.
//!
//! The request state and the target thread id share one atomic word, so a signal that
//! reaches a thread after its request was abandoned never answers a later request.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::debug;
use probe_types::{StackTrace, MAX_FRAMES};

use super::signals;
use crate::error::CaptureError;
use crate::stacktrace::{self, Budget};

/// Ignored by default, so a request that arrives late is harmless.
pub const DUMP_SIGNAL: libc::c_int = libc::SIGURG;

const IDLE: u8 = 0;
const REQUESTED: u8 = 1;
const WRITING: u8 = 2;
const DONE: u8 = 3;

/// Target thread id in the upper half, request phase in the low byte.
static STATE: AtomicU64 = AtomicU64::new(IDLE as u64);

fn word(thread_id: u32, phase: u8) -> u64 {
    (u64::from(thread_id) << 32) | u64::from(phase)
}

fn phase(word: u64) -> u8 {
    word as u8
}
static INSTALLED: AtomicBool = AtomicBool::new(false);
static FRAMES: AtomicUsize = AtomicUsize::new(MAX_FRAMES);
static TIME_BUDGET_US: AtomicU64 = AtomicU64::new(100_000);

struct Slot(UnsafeCell<StackTrace>);

// Written only by the handler that moved STATE to WRITING, read only after DONE.
unsafe impl Sync for Slot {}

static SLOT: Slot = Slot(UnsafeCell::new(StackTrace::new()));

lazy_static! {
    static ref REQUESTS: Mutex<()> = Mutex::new(());
}

/// A thread whose stack can be requested from another thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MonitoredThread {
    thread_id: u32,
}

impl MonitoredThread {
    pub fn current() -> Self {
        MonitoredThread {
            thread_id: signals::thread_id(),
        }
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }
}

/// Install the dump handler. Later calls only update the budget.
pub fn install(budget: Budget) -> Result<(), CaptureError> {
    let _guard = REQUESTS.lock().unwrap_or_else(PoisonError::into_inner);
    FRAMES.store(budget.frames, Ordering::Relaxed);
    TIME_BUDGET_US.store(budget.time.as_micros() as u64, Ordering::Relaxed);
    if !INSTALLED.load(Ordering::Acquire) {
        signals::install(
            DUMP_SIGNAL,
            on_dump_request,
            libc::SA_ONSTACK | libc::SA_RESTART,
        )?;
        INSTALLED.store(true, Ordering::Release);
        debug!("stack dump handler installed for signal {}", DUMP_SIGNAL);
    }
    Ok(())
}

extern "C" fn on_dump_request(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let me = signals::thread_id();
    if STATE
        .compare_exchange(
            word(me, REQUESTED),
            word(me, WRITING),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return;
    }
    // SAFETY: errno is thread local; the context comes from the kernel.
    unsafe {
        let errno = *libc::__errno_location();
        let (pc, _) = signals::registers(context);
        let budget = Budget::new(
            FRAMES.load(Ordering::Relaxed),
            Duration::from_micros(TIME_BUDGET_US.load(Ordering::Relaxed)),
        );
        *SLOT.0.get() = stacktrace::capture_at(pc, budget);
        STATE.store(word(me, DONE), Ordering::Release);
        *libc::__errno_location() = errno;
    }
}

/// Wait until the phase leaves `from` or `deadline` passes. Returns the last phase seen.
fn wait_while(from: u8, deadline: Instant) -> u8 {
    loop {
        let state = phase(STATE.load(Ordering::Acquire));
        if state != from || Instant::now() >= deadline {
            return state;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Stack of `thread`, captured by the thread itself.
///
/// Fails with [`CaptureError::CaptureTimeout`] if the thread does not answer within
/// `timeout`, for example because it blocks the signal.
pub fn request_stack(thread: &MonitoredThread, timeout: Duration) -> Result<StackTrace, CaptureError> {
    let _guard = REQUESTS.lock().unwrap_or_else(PoisonError::into_inner);
    if !INSTALLED.load(Ordering::Acquire) {
        return Err(CaptureError::NotArmed);
    }
    let timed_out = || CaptureError::CaptureTimeout {
        thread_id: thread.thread_id,
        timeout_ms: timeout.as_millis() as u64,
    };

    // A handler from an earlier, abandoned request may still be writing.
    if wait_while(WRITING, Instant::now() + timeout) == WRITING {
        return Err(timed_out());
    }
    let requested = word(thread.thread_id, REQUESTED);
    STATE.store(requested, Ordering::Release);
    // SAFETY: tgkill only delivers a signal; the thread id is checked by the kernel.
    let sent = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            libc::getpid(),
            thread.thread_id as libc::pid_t,
            DUMP_SIGNAL,
        )
    };
    if sent != 0 {
        STATE.store(u64::from(IDLE), Ordering::Release);
        return Err(CaptureError::SignalDelivery {
            thread_id: thread.thread_id,
            source: io::Error::last_os_error(),
        });
    }

    let deadline = Instant::now() + timeout;
    let mut state = wait_while(REQUESTED, deadline);
    if state == REQUESTED {
        match STATE.compare_exchange(
            requested,
            u64::from(IDLE),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return Err(timed_out()),
            Err(current) => state = phase(current),
        }
    }
    if state == WRITING {
        // Started just in time, give it one more period.
        state = wait_while(WRITING, Instant::now() + timeout);
    }
    if state != DONE {
        return Err(timed_out());
    }
    // SAFETY: DONE was stored with release ordering after the slot was written.
    let trace = unsafe { *SLOT.0.get() };
    STATE.store(u64::from(IDLE), Ordering::Release);
    Ok(trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const BUDGET: Budget = Budget::new(MAX_FRAMES, Duration::from_millis(100));

    #[test]
    fn test_dump_of_blocked_thread() {
        install(BUDGET).unwrap();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocked = std::thread::spawn(move || {
            ready_tx.send(MonitoredThread::current()).unwrap();
            let _ = release_rx.recv();
        });
        let thread = ready_rx.recv().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let trace = request_stack(&thread, Duration::from_secs(2)).unwrap();
        assert!(!trace.is_empty());
        release_tx.send(()).unwrap();
        blocked.join().unwrap();
    }

    #[test]
    fn test_dump_times_out_when_signal_is_blocked() {
        install(BUDGET).unwrap();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocked = std::thread::spawn(move || {
            unsafe {
                let mut set: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut set);
                libc::sigaddset(&mut set, DUMP_SIGNAL);
                libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
            }
            ready_tx.send(MonitoredThread::current()).unwrap();
            let _ = release_rx.recv();
        });
        let thread = ready_rx.recv().unwrap();

        let err = request_stack(&thread, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, CaptureError::CaptureTimeout { timeout_ms: 50, .. }));
        release_tx.send(()).unwrap();
        blocked.join().unwrap();
    }

    #[test]
    fn test_late_signal_does_not_answer_another_request() {
        install(BUDGET).unwrap();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (unblock_tx, unblock_rx) = mpsc::channel::<()>();
        let (unblocked_tx, unblocked_rx) = mpsc::channel::<()>();
        let late = std::thread::spawn(move || {
            let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
            unsafe {
                libc::sigemptyset(&mut set);
                libc::sigaddset(&mut set, DUMP_SIGNAL);
                libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
            }
            ready_tx.send(MonitoredThread::current()).unwrap();
            let _ = unblock_rx.recv();
            // The pending request is delivered before this returns.
            unsafe { libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut()) };
            unblocked_tx.send(()).unwrap();
        });
        let thread = ready_rx.recv().unwrap();
        let err = request_stack(&thread, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, CaptureError::CaptureTimeout { .. }));

        // A request for another thread is in flight when the stale signal lands.
        let _guard = REQUESTS.lock().unwrap_or_else(PoisonError::into_inner);
        let other = word(signals::thread_id(), REQUESTED);
        STATE.store(other, Ordering::Release);
        unblock_tx.send(()).unwrap();
        unblocked_rx.recv().unwrap();
        assert_eq!(STATE.load(Ordering::Acquire), other);
        STATE.store(u64::from(IDLE), Ordering::Release);
        late.join().unwrap();
    }
}
