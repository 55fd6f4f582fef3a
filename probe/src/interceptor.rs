//! Allocation tracking through `malloc` hooks
//!
//! The interceptor redirects `malloc`, `calloc`, `realloc` and `free` in the selected caller
//! modules and keeps one [`AllocationRecord`] per live allocation. Allocations the probe
//! makes for itself, such as growing the store or formatting a log line, pass straight to
//! the allocator: a thread-local flag marks the thread as inside the probe.

use std::cell::Cell;
use std::collections::VecDeque;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fnv::FnvHashMap;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use probe_types::{AllocationRecord, CallSite, Timestamp, MAX_FRAMES};

use crate::config::InterceptorConfig;
use crate::error::HookError;
use crate::hook::{HookEngine, HookHandle, HookSpec};
use crate::resolver::LibraryMatcher;
use crate::stacktrace::{self, Budget};

const SHARDS: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a `free` of an address meant to the tracker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FreeOutcome {
    /// The address was live and its record was removed.
    Released(AllocationRecord),
    /// The address was freed moments ago and not allocated since.
    DoubleFree,
    /// The address was never tracked, e.g. allocated before the hooks were installed.
    Untracked,
}

/// Counters since the tracker was created or cleared.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub allocations: u64,
    pub frees: u64,
    pub double_frees: u64,
    pub outstanding: usize,
}

struct Shard {
    live: FnvHashMap<u64, AllocationRecord>,
    /// Recently freed addresses, oldest first.
    freed: VecDeque<u64>,
}

/// Outstanding allocations, keyed by address.
pub struct AllocationTracker {
    shards: Vec<Mutex<Shard>>,
    freed_window: AtomicUsize,
    allocations: AtomicU64,
    frees: AtomicU64,
    double_frees: AtomicU64,
}

impl AllocationTracker {
    pub fn new(freed_window: usize) -> Self {
        AllocationTracker {
            shards: (0..SHARDS)
                .map(|_| {
                    Mutex::new(Shard {
                        live: FnvHashMap::default(),
                        freed: VecDeque::with_capacity(freed_window),
                    })
                })
                .collect(),
            freed_window: AtomicUsize::new(freed_window),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
        }
    }

    fn shard(&self, address: u64) -> MutexGuard<'_, Shard> {
        lock(&self.shards[(address >> 4) as usize % SHARDS])
    }

    pub fn record_allocation(&self, record: AllocationRecord) {
        let _scope = ProbeScope::enter();
        let mut shard = self.shard(record.address);
        if let Some(position) = shard.freed.iter().position(|freed| *freed == record.address) {
            shard.freed.remove(position);
        }
        shard.live.insert(record.address, record);
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self, address: u64) -> FreeOutcome {
        let _scope = ProbeScope::enter();
        let mut shard = self.shard(address);
        if let Some(record) = shard.live.remove(&address) {
            let window = self.freed_window.load(Ordering::Relaxed);
            while !shard.freed.is_empty() && shard.freed.len() >= window {
                shard.freed.pop_front();
            }
            if window > 0 {
                shard.freed.push_back(address);
            }
            self.frees.fetch_add(1, Ordering::Relaxed);
            FreeOutcome::Released(record)
        } else if shard.freed.contains(&address) {
            self.double_frees.fetch_add(1, Ordering::Relaxed);
            FreeOutcome::DoubleFree
        } else {
            FreeOutcome::Untracked
        }
    }

    /// Number of freed addresses per shard remembered for double-free detection.
    pub fn set_freed_window(&self, window: usize) {
        self.freed_window.store(window, Ordering::Relaxed);
    }

    /// Live records sorted by timestamp, then address.
    pub fn snapshot_outstanding(&self) -> Vec<AllocationRecord> {
        // Allocating under a shard lock must not come back through the hooks.
        let _scope = ProbeScope::enter();
        let mut records: Vec<_> = self
            .shards
            .iter()
            .flat_map(|shard| lock(shard).live.values().copied().collect::<Vec<_>>())
            .collect();
        records.sort_by_key(|record| (record.timestamp, record.address));
        records
    }

    pub fn outstanding(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).live.len()).sum()
    }

    pub fn is_outstanding(&self, address: u64) -> bool {
        self.shard(address).live.contains_key(&address)
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            double_frees: self.double_frees.load(Ordering::Relaxed),
            outstanding: self.outstanding(),
        }
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = lock(shard);
            shard.live.clear();
            shard.freed.clear();
        }
        self.allocations.store(0, Ordering::Relaxed);
        self.frees.store(0, Ordering::Relaxed);
        self.double_frees.store(0, Ordering::Relaxed);
    }
}

/// Records allocated since [`Interceptor::begin_window`] that are still live at the end.
#[derive(Debug, Copy, Clone)]
pub struct LeakWindow {
    started: Timestamp,
}

impl LeakWindow {
    pub fn started(&self) -> Timestamp {
        self.started
    }

    /// Records of the window that are still outstanding.
    pub fn end(self, tracker: &AllocationTracker) -> Vec<AllocationRecord> {
        tracker
            .snapshot_outstanding()
            .into_iter()
            .filter(|record| record.timestamp >= self.started)
            .collect()
    }
}

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);

static ORIGINAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_FREE: AtomicUsize = AtomicUsize::new(0);

static INSTALLED: AtomicBool = AtomicBool::new(false);
static RECORDING: AtomicBool = AtomicBool::new(false);
static CAPTURE_CALL_SITES: AtomicBool = AtomicBool::new(true);
/// Zero disables large allocation reports.
static LARGE_ALLOCATION: AtomicUsize = AtomicUsize::new(0);

lazy_static! {
    static ref TRACKER: AllocationTracker =
        AllocationTracker::new(InterceptorConfig::default().freed_window);
}

thread_local! {
    static IN_PROBE: Cell<bool> = const { Cell::new(false) };
}

/// Marks the thread as inside the probe while alive.
struct ProbeScope;

impl ProbeScope {
    /// `None` if the thread is already inside the probe or its thread-locals are gone.
    fn enter() -> Option<ProbeScope> {
        let entered = IN_PROBE.try_with(|flag| !flag.replace(true)).unwrap_or(false);
        // Lazily: a scope built for a nested call would clear the flag when dropped.
        entered.then(|| ProbeScope)
    }
}

impl Drop for ProbeScope {
    fn drop(&mut self) {
        let _ = IN_PROBE.try_with(|flag| flag.set(false));
    }
}

/// # Safety
///
/// `cell` must hold zero or the address of a function of type `F`.
unsafe fn original<F: Copy>(cell: &AtomicUsize) -> Option<F> {
    let address = cell.load(Ordering::Acquire);
    (address != 0).then(|| std::mem::transmute_copy(&address))
}

fn on_allocation(address: *mut c_void, size: usize, handler: usize) {
    if address.is_null() || !RECORDING.load(Ordering::Relaxed) {
        return;
    }
    let Some(_scope) = ProbeScope::enter() else {
        return;
    };
    let call_site = if CAPTURE_CALL_SITES.load(Ordering::Relaxed) {
        stacktrace::caller_of(handler)
    } else {
        CallSite::UNKNOWN
    };
    TRACKER.record_allocation(AllocationRecord {
        address: address as u64,
        size,
        call_site,
        timestamp: crate::timestamp(),
    });

    let threshold = LARGE_ALLOCATION.load(Ordering::Relaxed);
    if threshold != 0 && size >= threshold {
        let budget = Budget::new(MAX_FRAMES, Duration::from_millis(100));
        let stack = stacktrace::capture_after(handler, budget);
        warn!(
            "large allocation of {} bytes at {:#x}\n{}",
            size,
            address as usize,
            stacktrace::symbolize(&stack).join("\n")
        );
    }
}

fn on_free(address: *mut c_void) -> Option<AllocationRecord> {
    if address.is_null() || !RECORDING.load(Ordering::Relaxed) {
        return None;
    }
    let _scope = ProbeScope::enter()?;
    match TRACKER.record_free(address as u64) {
        FreeOutcome::Released(record) => Some(record),
        FreeOutcome::DoubleFree => {
            warn!("double free of {:#x}", address as usize);
            None
        }
        FreeOutcome::Untracked => None,
    }
}

unsafe extern "C" fn malloc_hook(size: usize) -> *mut c_void {
    let Some(malloc) = original::<MallocFn>(&ORIGINAL_MALLOC) else {
        return std::ptr::null_mut();
    };
    let address = malloc(size);
    on_allocation(address, size, malloc_hook as usize);
    address
}

unsafe extern "C" fn calloc_hook(count: usize, size: usize) -> *mut c_void {
    let Some(calloc) = original::<CallocFn>(&ORIGINAL_CALLOC) else {
        return std::ptr::null_mut();
    };
    let address = calloc(count, size);
    on_allocation(address, count.saturating_mul(size), calloc_hook as usize);
    address
}

unsafe extern "C" fn realloc_hook(address: *mut c_void, size: usize) -> *mut c_void {
    let Some(realloc) = original::<ReallocFn>(&ORIGINAL_REALLOC) else {
        return std::ptr::null_mut();
    };
    // Forget the old block first, the allocator may hand it out again right away.
    let previous = on_free(address);
    let moved = realloc(address, size);
    if moved.is_null() {
        if let (Some(previous), true) = (previous, size != 0) {
            // Failed, the old block is still live.
            if let Some(_scope) = ProbeScope::enter() {
                TRACKER.record_allocation(previous);
            }
        }
        return moved;
    }
    on_allocation(moved, size, realloc_hook as usize);
    moved
}

unsafe extern "C" fn free_hook(address: *mut c_void) {
    on_free(address);
    if let Some(free) = original::<FreeFn>(&ORIGINAL_FREE) {
        free(address);
    }
}

/// Installed allocation hooks; uninstalls them when [`Interceptor::uninstall`] is called.
#[derive(Debug)]
pub struct Interceptor {
    callers: LibraryMatcher,
    handles: Vec<HookHandle>,
}

impl Interceptor {
    /// Hook the allocator in the modules `callers` selects.
    ///
    /// Only one interceptor can be installed at a time.
    pub fn install(callers: LibraryMatcher, config: &InterceptorConfig) -> Result<Self, HookError> {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(HookError::AlreadyInstalled {
                library: callers.to_string(),
                symbol: "malloc".to_string(),
            });
        }
        TRACKER.set_freed_window(config.freed_window);
        CAPTURE_CALL_SITES.store(config.capture_call_sites, Ordering::Relaxed);
        LARGE_ALLOCATION.store(
            config.large_allocation_threshold.unwrap_or(0),
            Ordering::Relaxed,
        );

        // `free` first, so that nothing recorded can be released unseen.
        let hooks: [(&str, usize, &'static AtomicUsize, bool); 4] = [
            ("free", free_hook as usize, &ORIGINAL_FREE, true),
            ("realloc", realloc_hook as usize, &ORIGINAL_REALLOC, false),
            ("calloc", calloc_hook as usize, &ORIGINAL_CALLOC, false),
            ("malloc", malloc_hook as usize, &ORIGINAL_MALLOC, true),
        ];
        let engine = HookEngine::global();
        let mut interceptor = Interceptor {
            callers: callers.clone(),
            handles: Vec::new(),
        };
        for (symbol, handler, original, required) in hooks {
            let spec = HookSpec::indirection(callers.clone(), symbol).store_original(original);
            match engine.install(spec, handler) {
                Ok(handle) => interceptor.handles.push(handle),
                Err(HookError::SymbolNotFound { .. }) if !required => {
                    debug!("{} is not called from {}", symbol, callers);
                }
                Err(err) => {
                    interceptor.remove_hooks();
                    INSTALLED.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
        RECORDING.store(true, Ordering::SeqCst);
        info!(
            "allocation tracking installed in {} ({} hooks)",
            callers,
            interceptor.handles.len()
        );
        Ok(interceptor)
    }

    pub fn callers(&self) -> &LibraryMatcher {
        &self.callers
    }

    pub fn tracker(&self) -> &'static AllocationTracker {
        &TRACKER
    }

    pub fn snapshot_outstanding(&self) -> Vec<AllocationRecord> {
        TRACKER.snapshot_outstanding()
    }

    pub fn begin_window(&self) -> LeakWindow {
        LeakWindow {
            started: crate::timestamp(),
        }
    }

    /// Stop recording and restore the allocator entries.
    pub fn uninstall(mut self) -> Result<(), HookError> {
        RECORDING.store(false, Ordering::SeqCst);
        let result = self.remove_hooks();
        INSTALLED.store(false, Ordering::SeqCst);
        info!("allocation tracking removed from {}", self.callers);
        result
    }

    fn remove_hooks(&mut self) -> Result<(), HookError> {
        let engine = HookEngine::global();
        let mut result = Ok(());
        // `free` goes last.
        while let Some(handle) = self.handles.pop() {
            if let Err(err) = engine.uninstall(&handle) {
                warn!("failed to unhook {}: {}", handle.symbol(), err);
                result = Err(err);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: u64, timestamp: Timestamp) -> AllocationRecord {
        AllocationRecord {
            address,
            size: 16,
            call_site: CallSite(0x1000),
            timestamp,
        }
    }

    #[test]
    fn test_outstanding_is_allocations_minus_frees() {
        let tracker = AllocationTracker::new(8);
        for i in 0..100 {
            tracker.record_allocation(record(0x10_0000 + i * 32, i));
        }
        for i in (0..100).step_by(3) {
            assert!(matches!(
                tracker.record_free(0x10_0000 + i * 32),
                FreeOutcome::Released(_)
            ));
        }
        let stats = tracker.stats();
        assert_eq!(stats.allocations, 100);
        assert_eq!(stats.frees, 34);
        assert_eq!(stats.outstanding, 66);
        let outstanding = tracker.snapshot_outstanding();
        assert_eq!(outstanding.len(), 66);
        assert!(outstanding.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(!tracker.is_outstanding(0x10_0000));
        assert!(tracker.is_outstanding(0x10_0000 + 32));
    }

    #[test]
    fn test_single_allocation_then_free() {
        let tracker = AllocationTracker::new(8);
        tracker.record_allocation(record(0x2000, 1));
        assert_eq!(tracker.snapshot_outstanding(), vec![record(0x2000, 1)]);
        tracker.record_free(0x2000);
        assert!(tracker.snapshot_outstanding().is_empty());
    }

    #[test]
    fn test_double_free_is_flagged_once_per_free() {
        let tracker = AllocationTracker::new(8);
        tracker.record_allocation(record(0x3000, 1));
        assert!(matches!(tracker.record_free(0x3000), FreeOutcome::Released(_)));
        assert_eq!(tracker.record_free(0x3000), FreeOutcome::DoubleFree);
        assert_eq!(tracker.record_free(0x4000), FreeOutcome::Untracked);
        assert_eq!(tracker.stats().double_frees, 1);

        // Reuse of the address by the allocator is not a double free.
        tracker.record_allocation(record(0x3000, 2));
        assert!(matches!(tracker.record_free(0x3000), FreeOutcome::Released(_)));
    }

    #[test]
    fn test_freed_window_is_bounded() {
        let tracker = AllocationTracker::new(2);
        // Same shard: addresses differ by a multiple of 16 * SHARDS.
        let addresses = [0x1_0000, 0x1_0100, 0x1_0200];
        for (i, address) in addresses.iter().enumerate() {
            tracker.record_allocation(record(*address, i as u64));
            tracker.record_free(*address);
        }
        assert_eq!(tracker.record_free(addresses[0]), FreeOutcome::Untracked);
        assert_eq!(tracker.record_free(addresses[2]), FreeOutcome::DoubleFree);
    }

    #[test]
    fn test_leak_window_keeps_only_new_records() {
        let tracker = AllocationTracker::new(8);
        tracker.record_allocation(record(0x5000, 10));
        let window = LeakWindow { started: 20 };
        tracker.record_allocation(record(0x6000, 25));
        tracker.record_allocation(record(0x7000, 30));
        tracker.record_free(0x7000);
        assert_eq!(window.end(&tracker), vec![record(0x6000, 25)]);
    }

    fn in_probe() -> bool {
        IN_PROBE.with(Cell::get)
    }

    #[test]
    fn test_nested_scope_keeps_the_thread_inside() {
        let outer = ProbeScope::enter();
        assert!(outer.is_some());
        assert!(in_probe());
        let inner = ProbeScope::enter();
        assert!(inner.is_none());
        drop(inner);
        assert!(in_probe());

        // Tracker calls enter a scope of their own.
        let tracker = AllocationTracker::new(8);
        tracker.record_allocation(record(0x8000, 1));
        assert!(in_probe());
        tracker.record_free(0x8000);
        assert!(in_probe());
        tracker.snapshot_outstanding();
        assert!(in_probe());

        drop(outer);
        assert!(!in_probe());
    }

    #[test]
    fn test_concurrent_recording() {
        let tracker = std::sync::Arc::new(AllocationTracker::new(8));
        let threads: Vec<_> = (0..4u64)
            .map(|t| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        let address = (t << 32) | (i << 4);
                        tracker.record_allocation(record(address, i));
                        if i % 2 == 0 {
                            tracker.record_free(address);
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(tracker.outstanding(), 2000);
    }
}
