//! Native instrumentation for performance debugging
//!
//! The probe redirects calls to native functions (`hook`), tracks allocations made
//! through `malloc` and friends to find leaks, reports threads that stop making progress,
//! and captures a report when the process faults.
//!
//! Process-wide state lives in a [`Runtime`], created by [`init`] or [`init_with`]. The
//! runtime owns the configuration and the [`HandlerRegistry`]; components receive both
//! from it. Calling [`init`] again returns the existing runtime.
//!
//! ```no_run
//! use perf_probe::{HookSpec, LibraryMatcher};
//!
//! extern "C" fn fake_getppid() -> libc::pid_t {
//!     1
//! }
//!
//! let runtime = perf_probe::init()?;
//! let handle = runtime.hook(
//!     HookSpec::indirection(LibraryMatcher::MainProgram, "getppid"),
//!     fake_getppid as usize,
//! )?;
//! assert_eq!(unsafe { libc::getppid() }, 1);
//! runtime.unhook(&handle)?;
//! # Ok::<(), perf_probe::error::ProbeError>(())
//! ```

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use log::{debug, info, warn};
use probe_types::{AllocationRecord, CrashReport, Timestamp};

pub mod capture;
pub mod config;
pub mod elf;
pub mod error;
pub mod hook;
pub mod interceptor;
pub mod memory;
pub mod resolver;
pub mod sink;
pub mod stacktrace;
pub mod triggers;
pub mod watchdog;

pub use capture::{CaptureState, HandlerRegistry, MonitoredThread};
pub use config::{CaptureConfig, InterceptorConfig, ProbeConfig, WatchdogConfig};
pub use error::{CaptureError, HookError, ProbeError, ResolveError};
pub use hook::{HookEngine, HookHandle, HookSpec, Strategy};
pub use interceptor::{Interceptor, LeakWindow};
pub use probe_types;
pub use resolver::LibraryMatcher;
pub use sink::{BincodeSink, ChannelSink, Disposition, FdSink, LogSink, ReportSink};
pub use triggers::{trigger_crash, trigger_hang, trigger_leak, trigger_native_allocation};
pub use watchdog::{HangWatchdog, Heartbeat};

/// Wall-clock time in nanoseconds. Safe to call from a signal handler.
pub(crate) fn timestamp() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_nanos() as Timestamp)
}

/// Process-scoped probe state.
#[derive(Debug)]
pub struct Runtime {
    config: ProbeConfig,
    registry: &'static HandlerRegistry,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

lazy_static! {
    static ref INIT: Mutex<()> = Mutex::new(());
}

/// Initialize with configuration from the environment and a [`LogSink`] for every report.
///
/// Arms crash capture. Later calls return the existing runtime.
pub fn init() -> error::Result<&'static Runtime> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    let config = ProbeConfig::from_env()?;
    let sink = Arc::new(LogSink::with_fault_fd(config.capture.fault_fd));
    init_with(config, HandlerRegistry::new().register_all(sink))
}

/// Initialize with explicit configuration and sinks.
///
/// If the runtime already exists it is returned unchanged and both arguments are dropped.
pub fn init_with(
    config: ProbeConfig,
    registry: HandlerRegistry,
) -> error::Result<&'static Runtime> {
    let _guard = INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(runtime) = RUNTIME.get() {
        debug!("perf-probe already initialized");
        return Ok(runtime);
    }
    let registry: &'static HandlerRegistry = Box::leak(Box::new(registry));
    capture::arm(registry, &config.capture)?;
    let runtime = RUNTIME.get_or_init(|| Runtime { config, registry });
    info!("perf-probe initialized");
    Ok(runtime)
}

/// The runtime, if [`init`] has run.
pub fn runtime() -> Option<&'static Runtime> {
    RUNTIME.get()
}

impl Runtime {
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn registry(&self) -> &'static HandlerRegistry {
        self.registry
    }

    pub fn capture_state(&self) -> CaptureState {
        capture::state()
    }

    /// Redirect calls described by `spec` to `handler`.
    pub fn hook(&self, spec: HookSpec, handler: usize) -> Result<HookHandle, HookError> {
        HookEngine::global().install(spec, handler)
    }

    pub fn unhook(&self, handle: &HookHandle) -> Result<(), HookError> {
        HookEngine::global().uninstall(handle)
    }

    /// Inline hook on `symbol` in `library`; if the function cannot be patched there,
    /// indirection-table hooks in the modules `callers` selects.
    pub fn hook_preferring_inline(
        &self,
        library: impl Into<LibraryMatcher>,
        callers: impl Into<LibraryMatcher>,
        symbol: &str,
        handler: usize,
    ) -> Result<HookHandle, HookError> {
        self.hook_with_fallback(
            HookSpec::inline(library, symbol),
            HookSpec::indirection(callers, symbol),
            handler,
        )
    }

    /// Install `preferred`; if the environment does not allow it, install `fallback`.
    ///
    /// Other errors of `preferred` are returned as they are.
    pub fn hook_with_fallback(
        &self,
        preferred: HookSpec,
        fallback: HookSpec,
        handler: usize,
    ) -> Result<HookHandle, HookError> {
        match self.hook(preferred, handler) {
            Err(err) if err.is_environment_limitation() => {
                warn!("{}, falling back to {:?}", err, fallback.strategy());
                self.hook(fallback, handler)
            }
            result => result,
        }
    }

    /// Track allocations made from the modules `callers` selects.
    pub fn install_interceptor(
        &self,
        callers: impl Into<LibraryMatcher>,
    ) -> Result<Interceptor, HookError> {
        Interceptor::install(callers.into(), &self.config.interceptor)
    }

    /// Close `window` and send what leaked inside it to the leak sinks.
    pub fn end_window(&self, interceptor: &Interceptor, window: LeakWindow) -> Vec<AllocationRecord> {
        let leaked = window.end(interceptor.tracker());
        self.registry.dispatch_leak(&leaked);
        leaked
    }

    /// Send every live allocation to the leak sinks.
    pub fn report_outstanding(&self, interceptor: &Interceptor) -> Vec<AllocationRecord> {
        let outstanding = interceptor.snapshot_outstanding();
        self.registry.dispatch_leak(&outstanding);
        outstanding
    }

    /// Run a crash capture cycle on the current stack without faulting.
    pub fn capture_crash(&self) -> Result<CrashReport, CaptureError> {
        capture::capture_synthetic()
    }

    /// Watch `monitored` for hangs with the configured timeout.
    pub fn watch(
        &self,
        monitored: MonitoredThread,
        heartbeat: Heartbeat,
    ) -> Result<HangWatchdog, CaptureError> {
        HangWatchdog::spawn(monitored, heartbeat, self.config.watchdog, self.registry)
    }

    /// Watch the calling thread. It has to call [`Heartbeat::beat`] regularly.
    pub fn watch_current_thread(&self) -> Result<(Heartbeat, HangWatchdog), CaptureError> {
        let heartbeat = Heartbeat::new();
        let watchdog = self.watch(MonitoredThread::current(), heartbeat.clone())?;
        Ok((heartbeat, watchdog))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_recent() {
        let first = timestamp();
        let second = timestamp();
        assert!(first > 1_600_000_000_000_000_000);
        assert!(second >= first);
    }
}
