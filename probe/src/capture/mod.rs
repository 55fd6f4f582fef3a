//! Crash capture
//!
//! Capture moves through `Uninitialized -> Armed -> Capturing -> Reported`, once per
//! process. [`arm`] installs handlers for `SIGSEGV`, `SIGBUS`, `SIGILL`, `SIGABRT` and
//! `SIGFPE`. The first fault moves `Armed -> Capturing` with a compare-and-swap; the
//! winner builds the report in static storage and hands it to the sinks. The state
//! becomes `Reported` once the sinks returned. A fault that arrives while the state is
//! `Capturing`, in a sink or on another thread, writes one line to the fault descriptor
//! and exits with [`REENTRANT_FAULT_EXIT_CODE`]. Afterwards the fault is passed on to the
//! handler that was installed before ours, and finally to the default action.
//!
//! Everything reachable from the fault handler is restricted: no allocation, no locks,
//! no `log`.

mod dump;
mod signals;

use std::cell::UnsafeCell;
use std::fmt::Write as _;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use lazy_static::lazy_static;
use log::{debug, info};
use probe_types::{AllocationRecord, ContextTag, CrashReport, FaultKind, HangReport};

pub use dump::{request_stack, MonitoredThread, DUMP_SIGNAL};
pub(crate) use dump::install as install_dump_handler;

use crate::config::CaptureConfig;
use crate::error::{CaptureError, REENTRANT_FAULT_EXIT_CODE};
use crate::sink::{Disposition, LineBuffer, ReportSink};
use crate::stacktrace::{self, Budget};

/// Signals handled as faults.
pub const FAULT_SIGNALS: [libc::c_int; 5] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGABRT,
    libc::SIGFPE,
];

/// A `SIGSEGV` or `SIGBUS` this close to the stack pointer, on either side, is a stack
/// overflow. Once the stack pointer is inside the guard page, stores to `[sp + n]` fault too.
const OVERFLOW_REACH: usize = 64 * 1024;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CaptureState {
    Uninitialized = 0,
    Armed = 1,
    Capturing = 2,
    Reported = 3,
}

impl CaptureState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CaptureState::Armed,
            2 => CaptureState::Capturing,
            3 => CaptureState::Reported,
            _ => CaptureState::Uninitialized,
        }
    }
}

static STATE: AtomicU8 = AtomicU8::new(CaptureState::Uninitialized as u8);

pub fn state() -> CaptureState {
    CaptureState::from_u8(STATE.load(Ordering::Acquire))
}

/// Sinks per report kind, in registration order.
///
/// Built before [`arm`] and never changed afterwards, so the fault path reads it without
/// locking.
pub struct HandlerRegistry {
    by_kind: [Vec<Arc<dyn ReportSink>>; FaultKind::COUNT],
    leak: Vec<Arc<dyn ReportSink>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            by_kind: std::array::from_fn(|_| Vec::new()),
            leak: Vec::new(),
        }
    }

    /// Deliver reports of `kinds` to `sink`.
    pub fn register(mut self, kinds: &[FaultKind], sink: Arc<dyn ReportSink>) -> Self {
        for kind in kinds {
            self.by_kind[kind.index()].push(Arc::clone(&sink));
        }
        self
    }

    /// Deliver leak reports to `sink`.
    pub fn register_leaks(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.leak.push(sink);
        self
    }

    /// Deliver every report to `sink`.
    pub fn register_all(self, sink: Arc<dyn ReportSink>) -> Self {
        self.register(&FaultKind::ALL, Arc::clone(&sink))
            .register_leaks(sink)
    }

    pub fn sinks(&self, kind: FaultKind) -> &[Arc<dyn ReportSink>] {
        &self.by_kind[kind.index()]
    }

    pub fn is_empty(&self) -> bool {
        self.leak.is_empty() && self.by_kind.iter().all(Vec::is_empty)
    }

    /// Hand `report` to every sink of its kind.
    ///
    /// Returns [`Disposition::Suppress`] only for non-fatal kinds, and only if some sink
    /// asked for it.
    pub fn dispatch_crash(&self, report: &CrashReport) -> Disposition {
        let mut suppress = false;
        for sink in self.sinks(report.kind) {
            suppress |= sink.on_crash_report(report) == Disposition::Suppress;
        }
        if suppress && !report.kind.is_fatal() {
            Disposition::Suppress
        } else {
            Disposition::Terminate
        }
    }

    pub fn dispatch_hang(&self, report: &HangReport) {
        for sink in self.sinks(FaultKind::Hang) {
            sink.on_hang_report(report);
        }
    }

    /// Nothing is delivered for an empty set.
    pub fn dispatch_leak(&self, records: &[AllocationRecord]) {
        if records.is_empty() {
            return;
        }
        for sink in &self.leak {
            sink.on_leak_report(records);
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for kind in FaultKind::ALL {
            map.entry(&kind.name(), &self.sinks(kind).len());
        }
        map.entry(&"leak", &self.leak.len()).finish()
    }
}

/// Fault path settings, fixed at [`arm`].
struct Settings {
    budget: Budget,
    fault_fd: libc::c_int,
    context: Option<ContextTag>,
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();
static REGISTRY: OnceLock<&'static HandlerRegistry> = OnceLock::new();
/// Handlers we replaced, by signal.
static PREVIOUS: OnceLock<Vec<(libc::c_int, libc::sigaction)>> = OnceLock::new();

struct ReportSlot(UnsafeCell<MaybeUninit<CrashReport>>);

// Written once, by the thread that moved the state to `Capturing`.
unsafe impl Sync for ReportSlot {}

static REPORT: ReportSlot = ReportSlot(UnsafeCell::new(MaybeUninit::uninit()));

lazy_static! {
    static ref ARMING: Mutex<()> = Mutex::new(());
}

/// Install the fault handlers and enter `Armed`. Later calls do nothing.
///
/// Also gives the calling thread an alternate signal stack, which is needed to report
/// stack overflows. Other threads can get one with [`prepare_current_thread`].
pub fn arm(registry: &'static HandlerRegistry, config: &CaptureConfig) -> Result<(), CaptureError> {
    let _guard = ARMING.lock().unwrap_or_else(PoisonError::into_inner);
    if state() != CaptureState::Uninitialized {
        debug!("crash capture already armed");
        return Ok(());
    }
    prepare_current_thread()?;
    let _ = SETTINGS.set(Settings {
        budget: Budget::new(config.frame_budget, config.time_budget),
        fault_fd: config.fault_fd,
        context: config.context.as_deref().map(ContextTag::new),
    });
    let _ = REGISTRY.set(registry);

    let mut previous = Vec::with_capacity(FAULT_SIGNALS.len());
    for signal in FAULT_SIGNALS {
        match signals::install(signal, on_fault, libc::SA_ONSTACK | libc::SA_NODEFER) {
            Ok(old) => previous.push((signal, old)),
            Err(err) => {
                for (signal, old) in &previous {
                    // SAFETY: restores an action the kernel handed us.
                    unsafe { libc::sigaction(*signal, old, std::ptr::null_mut()) };
                }
                return Err(err);
            }
        }
    }
    let _ = PREVIOUS.set(previous);
    STATE.store(CaptureState::Armed as u8, Ordering::Release);
    info!(
        "crash capture armed for signals {:?}, {:?}",
        FAULT_SIGNALS, registry
    );
    Ok(())
}

/// Give the calling thread an alternate signal stack large enough for a capture.
pub fn prepare_current_thread() -> Result<(), CaptureError> {
    signals::ensure_alt_stack().map_err(CaptureError::AltStack)
}

/// The handler faults are passed on to after capture, if there was one.
pub fn previous_handler(signal: libc::c_int) -> Option<usize> {
    PREVIOUS
        .get()?
        .iter()
        .find(|(candidate, _)| *candidate == signal)
        .map(|(_, action)| action.sa_sigaction)
}

fn previous_action(signal: libc::c_int) -> Option<&'static libc::sigaction> {
    PREVIOUS
        .get()?
        .iter()
        .find(|(candidate, _)| *candidate == signal)
        .map(|(_, action)| action)
}

/// What a signal means, given the fault address and the interrupted stack pointer.
pub fn classify(signal: libc::c_int, fault_address: Option<usize>, sp: usize) -> FaultKind {
    match signal {
        libc::SIGSEGV | libc::SIGBUS => match fault_address {
            Some(address) if address.abs_diff(sp) <= OVERFLOW_REACH => FaultKind::StackOverflow,
            _ => FaultKind::IllegalMemoryAccess,
        },
        libc::SIGILL => FaultKind::IllegalInstruction,
        libc::SIGFPE => FaultKind::ArithmeticFault,
        libc::SIGABRT => FaultKind::Abort,
        _ => FaultKind::IllegalMemoryAccess,
    }
}

extern "C" fn on_fault(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    match STATE.compare_exchange(
        CaptureState::Armed as u8,
        CaptureState::Capturing as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            // SAFETY: we won the transition, so nobody else touches the slot.
            unsafe { capture(signal, info, context) };
            STATE.store(CaptureState::Reported as u8, Ordering::Release);
        }
        Err(current) if current == CaptureState::Capturing as u8 => reentrant(signal),
        Err(_) => {}
    }
    // SAFETY: called from the handler of `signal` with its own arguments.
    unsafe { signals::chain(signal, previous_action(signal), info, context) };
}

/// # Safety
///
/// Only the thread that moved the state to `Capturing` may call this, from the handler.
unsafe fn capture(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let Some(settings) = SETTINGS.get() else {
        return;
    };
    let (pc, sp) = signals::registers(context);
    let fault_address = match signal {
        libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE if !info.is_null() => {
            Some((*info).si_addr() as usize)
        }
        _ => None,
    };
    let slot = &mut *REPORT.0.get();
    let report = slot.write(CrashReport {
        kind: classify(signal, fault_address, sp),
        signal,
        thread_id: signals::thread_id(),
        fault_address: fault_address.map(|address| address as u64),
        stack: stacktrace::capture_at(pc, settings.budget),
        timestamp: crate::timestamp(),
        context: settings.context,
    });
    if let Some(registry) = REGISTRY.get() {
        // Every signal kind is fatal, the disposition cannot keep the process alive.
        let _ = registry.dispatch_crash(report);
    }
}

/// Fault during capture: one line, then exit without unwinding or running handlers.
fn reentrant(signal: libc::c_int) -> ! {
    let fd = SETTINGS
        .get()
        .map_or(libc::STDERR_FILENO, |settings| settings.fault_fd);
    let mut line = LineBuffer::new();
    let _ = writeln!(
        line,
        "perf-probe: {}: {} (signal {}) at {}, exiting",
        CaptureError::ReentrantFault,
        classify(signal, None, 0).name(),
        signal,
        crate::timestamp()
    );
    line.flush_to(fd);
    // SAFETY: _exit is async-signal-safe.
    unsafe { libc::_exit(REENTRANT_FAULT_EXIT_CODE) }
}

/// Run a capture cycle on the current stack without a fault.
///
/// The report has kind [`FaultKind::Synthetic`], goes to the registered sinks and is
/// returned. The state machine is not touched and the process keeps running whatever
/// the sinks answer.
#[inline(never)]
pub fn capture_synthetic() -> Result<CrashReport, CaptureError> {
    let settings = SETTINGS.get().ok_or(CaptureError::NotArmed)?;
    let report = CrashReport {
        kind: FaultKind::Synthetic,
        signal: 0,
        thread_id: signals::thread_id(),
        fault_address: None,
        stack: stacktrace::capture_after(capture_synthetic as usize, settings.budget),
        timestamp: crate::timestamp(),
        context: settings.context,
    };
    if let Some(registry) = REGISTRY.get() {
        let disposition = registry.dispatch_crash(&report);
        debug!("synthetic capture delivered, sinks answered {:?}", disposition);
    }
    Ok(report)
}

/// The registry given to [`arm`].
pub fn registry() -> Option<&'static HandlerRegistry> {
    REGISTRY.get().copied()
}
