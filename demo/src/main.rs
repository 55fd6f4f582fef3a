//! Exercises the probe: a native leak, a hang, a crash, a synthetic capture and a hook.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;
use perf_probe::stacktrace;
use perf_probe::triggers::LEAK_SIZE;
use perf_probe::{HandlerRegistry, HookSpec, LibraryMatcher, LogSink, ProbeConfig, ProbeError};

#[derive(Parser)]
#[command(
    name = "perf-probe-demo",
    about = "Make the process misbehave and watch the probe report it",
    after_help = "\
EXAMPLES:
    perf-probe-demo leak --size 4096       Leak 4 KiB and list what the interceptor saw
    perf-probe-demo hang --hold-ms 3000    Block the main thread for three seconds
    RUST_LOG=info perf-probe-demo crash    Fault and print the crash report"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Leak native memory through a tracked `malloc`
    Leak {
        /// Bytes to leak
        #[arg(long, default_value_t = LEAK_SIZE)]
        size: usize,
    },
    /// Wait on a lock another thread holds while a watchdog watches
    Hang {
        /// How long the other thread holds the lock
        #[arg(long, default_value = "2000")]
        hold_ms: u64,
        /// Silence after which the watchdog reports a hang
        #[arg(long, default_value = "500")]
        timeout_ms: u64,
    },
    /// Write through an invalid pointer
    Crash,
    /// Print a crash report of the current stack as JSON, without crashing
    Capture,
    /// Redirect `getppid` in this binary and restore it
    Hook,
}

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("cannot start the blocker thread: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot encode report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malloc({0}) failed")]
    Allocation(usize),
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(args.command) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<(), DemoError> {
    match command {
        Command::Leak { size } => leak(size),
        Command::Hang {
            hold_ms,
            timeout_ms,
        } => hang(Duration::from_millis(hold_ms), Duration::from_millis(timeout_ms)),
        Command::Crash => {
            perf_probe::init()?;
            perf_probe::trigger_crash()
        }
        Command::Capture => capture(),
        Command::Hook => hook(),
    }
}

fn leak(size: usize) -> Result<(), DemoError> {
    let runtime = perf_probe::init()?;
    let interceptor = runtime
        .install_interceptor(LibraryMatcher::MainProgram)
        .map_err(ProbeError::from)?;
    let window = interceptor.begin_window();
    let address =
        perf_probe::trigger_native_allocation(size).ok_or(DemoError::Allocation(size))?;
    let leaked = runtime.end_window(&interceptor, window);
    interceptor.uninstall().map_err(ProbeError::from)?;

    println!("{} allocations outstanding in the window", leaked.len());
    for record in leaked.iter().filter(|record| record.address == address as u64) {
        println!("leaked {} bytes at {:#x}", record.size, record.address);
        for frame in stacktrace::symbolize(&[record.call_site.0]) {
            println!("  allocated at {}", frame);
        }
    }
    Ok(())
}

fn hang(hold: Duration, timeout: Duration) -> Result<(), DemoError> {
    let mut config = ProbeConfig::from_env().map_err(ProbeError::from)?;
    config.watchdog.timeout = timeout;
    let runtime = perf_probe::init_with(
        config,
        HandlerRegistry::new().register_all(Arc::new(LogSink::new())),
    )?;
    let (heartbeat, watchdog) = runtime.watch_current_thread().map_err(ProbeError::from)?;

    let fixture = perf_probe::trigger_hang(hold)?;
    heartbeat.beat();
    info!("waiting for a lock held for {} ms", hold.as_millis());
    let waited = fixture.contend();
    heartbeat.beat();
    fixture.join();

    println!(
        "waited {} ms, {} hang report(s)",
        waited.as_millis(),
        watchdog.reports()
    );
    watchdog.stop();
    Ok(())
}

fn capture() -> Result<(), DemoError> {
    let runtime = perf_probe::init()?;
    let report = runtime.capture_crash().map_err(ProbeError::from)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

static ORIGINAL_GETPPID: AtomicUsize = AtomicUsize::new(0);

extern "C" fn getppid_plus_one() -> libc::pid_t {
    let original: extern "C" fn() -> libc::pid_t =
        unsafe { std::mem::transmute(ORIGINAL_GETPPID.load(Ordering::SeqCst)) };
    original() + 1
}

fn hook() -> Result<(), DemoError> {
    let runtime = perf_probe::init()?;
    let before = unsafe { libc::getppid() };
    let handle = runtime
        .hook(
            HookSpec::indirection(LibraryMatcher::MainProgram, "getppid")
                .store_original(&ORIGINAL_GETPPID),
            getppid_plus_one as usize,
        )
        .map_err(ProbeError::from)?;
    let hooked = unsafe { libc::getppid() };
    runtime.unhook(&handle).map_err(ProbeError::from)?;
    let restored = unsafe { libc::getppid() };

    println!("getppid: {} before, {} hooked, {} restored", before, hooked, restored);
    Ok(())
}
