//! Payloads that make the probe report something
//!
//! Each trigger misbehaves in one specific way: a leak, a hang, a crash.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};

/// Bytes leaked by [`trigger_leak`].
pub const LEAK_SIZE: usize = 100 * 1000 * 1000;

/// Allocate `size` bytes with `malloc` and never free them.
///
/// The call goes through this crate's import of `malloc`, so an interceptor installed on
/// the main program sees it. Returns the address, `None` if the allocation failed.
#[inline(never)]
pub fn trigger_native_allocation(size: usize) -> Option<usize> {
    // SAFETY: plain allocation, intentionally leaked.
    let address = unsafe { libc::malloc(std::hint::black_box(size)) } as usize;
    debug!("leaked {} bytes at {:#x}", size, address);
    (address != 0).then_some(address)
}

/// Leak [`LEAK_SIZE`] bytes.
pub fn trigger_leak() -> Option<usize> {
    trigger_native_allocation(LEAK_SIZE)
}

/// A thread holding a lock that the main path is about to wait for.
///
/// The lock is released after the hold time, so a hang built with this fixture always
/// ends.
#[derive(Debug)]
pub struct HangFixture {
    lock: Arc<Mutex<()>>,
    blocker: Option<JoinHandle<()>>,
    hold: Duration,
}

/// Start a thread that holds a lock for `hold`. Returns once the lock is held.
pub fn trigger_hang(hold: Duration) -> io::Result<HangFixture> {
    let lock = Arc::new(Mutex::new(()));
    let (held, wait_held) = crossbeam_channel::bounded(0);
    let blocker = {
        let lock = Arc::clone(&lock);
        std::thread::Builder::new()
            .name("perf-probe-blocker".to_string())
            .spawn(move || {
                let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
                let _ = held.send(());
                std::thread::sleep(hold);
            })?
    };
    let _ = wait_held.recv();
    Ok(HangFixture {
        lock,
        blocker: Some(blocker),
        hold,
    })
}

impl HangFixture {
    pub fn hold(&self) -> Duration {
        self.hold
    }

    /// Block on the lock until the blocker releases it. Returns the time spent waiting.
    #[inline(never)]
    pub fn contend(&self) -> Duration {
        let started = Instant::now();
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        started.elapsed()
    }

    /// Wait for the blocker thread to exit.
    pub fn join(mut self) {
        if let Some(blocker) = self.blocker.take() {
            if blocker.join().is_err() {
                warn!("hang blocker thread panicked");
            }
        }
    }
}

/// Write through an invalid pointer.
#[inline(never)]
pub fn trigger_crash() -> ! {
    warn!("writing through an invalid pointer");
    let address = std::hint::black_box(8usize);
    // SAFETY: none, this is the point.
    unsafe { std::ptr::write_volatile(address as *mut i32, 10) };
    // Only reached if the page at `address` is mapped.
    std::process::abort()
}
