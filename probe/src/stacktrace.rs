//! Stack walking into fixed-size traces
//!
//! [`capture_at`] is the only function here that may run in a signal handler: it walks with
//! `trace_unsynchronized` into stack-allocated buffers and neither locks nor allocates. The
//! other functions are for ordinary contexts.

use std::ffi::c_void;
use std::time::{Duration, Instant};

use probe_types::{CallSite, StackTrace};

/// Limits for a single stack walk.
#[derive(Debug, Copy, Clone)]
pub struct Budget {
    pub frames: usize,
    pub time: Duration,
}

impl Budget {
    pub const fn new(frames: usize, time: Duration) -> Self {
        Budget { frames, time }
    }
}

/// Collects innermost-first frames until a budget runs out.
struct Collector {
    trace: StackTrace,
    budget: Budget,
    started: Instant,
}

impl Collector {
    fn new(budget: Budget) -> Self {
        Collector {
            trace: StackTrace::new(),
            budget,
            started: Instant::now(),
        }
    }

    /// Returns `false` once the walk has to stop.
    fn push(&mut self, ip: u64) -> bool {
        if self.trace.len() >= self.budget.frames || self.started.elapsed() > self.budget.time {
            self.trace.mark_truncated();
            return false;
        }
        self.trace.push(ip)
    }

    /// Outermost frame first.
    fn finish(mut self) -> StackTrace {
        self.trace.reverse();
        self.trace
    }
}

/// Stack of the thread that was interrupted at `pc`, for use in a signal handler.
///
/// Frames of the handler itself are dropped. If the unwinder cannot find the interrupted
/// frame, the trace is `pc` followed by whatever it walked.
pub fn capture_at(pc: usize, budget: Budget) -> StackTrace {
    let pc = pc as u64;
    let mut collector = Collector::new(budget);
    let mut skipped = StackTrace::new();
    let mut found = false;
    // SAFETY: the walk does not allocate or lock; nothing else unwinds this thread concurrently.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let ip = frame.ip() as u64;
            if !found {
                if ip == pc {
                    found = true;
                } else {
                    return skipped.push(ip);
                }
            }
            collector.push(ip)
        });
    }
    if !found {
        collector.push(pc);
        for ip in skipped.iter() {
            if !collector.push(*ip) {
                break;
            }
        }
    }
    collector.finish()
}

/// Stack of the current thread, starting at the caller of `anchor`.
///
/// `anchor` is the address of a function on the current stack; its frame and everything
/// inside it are dropped. Without a matching frame the full stack is returned.
pub fn capture_after(anchor: usize, budget: Budget) -> StackTrace {
    let mut all = Collector::new(Budget::new(probe_types::MAX_FRAMES, budget.time));
    let mut collector = Collector::new(budget);
    let mut found = false;
    backtrace::trace(|frame| {
        if found {
            return collector.push(frame.ip() as u64);
        }
        if is_anchor(frame, anchor) {
            found = true;
            return true;
        }
        all.push(frame.ip() as u64)
    });
    if !found {
        for ip in all.trace.iter() {
            if !collector.push(*ip) {
                break;
            }
        }
        if all.trace.is_truncated() {
            collector.trace.mark_truncated();
        }
    }
    collector.finish()
}

/// Frames without a known function start never match.
fn is_anchor(frame: &backtrace::Frame, anchor: usize) -> bool {
    let start = frame.symbol_address() as usize;
    start != 0 && start == anchor
}

/// Return address in the function that called `anchor`.
pub fn caller_of(anchor: usize) -> CallSite {
    let mut found = false;
    let mut site = CallSite::UNKNOWN;
    backtrace::trace(|frame| {
        if found {
            site = CallSite(frame.ip() as u64);
            return false;
        }
        found = is_anchor(frame, anchor);
        true
    });
    site
}

/// One line per frame: address, symbol and offset, and source location when known.
pub fn symbolize(frames: &[u64]) -> Vec<String> {
    frames
        .iter()
        .enumerate()
        .map(|(depth, ip)| {
            let mut line = format!("#{:<2} {:#018x}", depth, ip);
            let mut resolved = false;
            backtrace::resolve(*ip as *mut c_void, |symbol| {
                if resolved {
                    return;
                }
                resolved = true;
                match (symbol.name(), symbol.addr()) {
                    (Some(name), Some(addr)) => line.push_str(&format!(
                        " {}+{:#x}",
                        name,
                        (*ip).wrapping_sub(addr as u64)
                    )),
                    (Some(name), None) => line.push_str(&format!(" {}", name)),
                    _ => {}
                }
                if let (Some(file), Some(lineno)) = (symbol.filename(), symbol.lineno()) {
                    line.push_str(&format!(" ({}:{})", file.display(), lineno));
                }
            });
            line
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: Budget = Budget::new(probe_types::MAX_FRAMES, Duration::from_secs(1));

    #[inline(never)]
    fn anchor() -> StackTrace {
        capture_after(anchor as usize, BUDGET)
    }

    #[test]
    fn test_capture_after_drops_inner_frames() {
        let trace = std::hint::black_box(anchor());
        assert!(!trace.is_empty());
        // The innermost remaining frame belongs to this test, not to `anchor`.
        let innermost = symbolize(&[*trace.last().unwrap()]);
        assert!(
            innermost[0].contains("test_capture_after_drops_inner_frames"),
            "{}",
            innermost[0]
        );
    }

    #[test]
    fn test_frame_budget_truncates() {
        let trace = capture_after(usize::MAX, Budget::new(2, Duration::from_secs(1)));
        assert_eq!(trace.len(), 2);
        assert!(trace.is_truncated());
    }

    #[test]
    fn test_null_anchor_matches_no_frame() {
        let trace = capture_after(0, Budget::new(2, Duration::from_secs(1)));
        assert_eq!(trace.len(), 2);
        assert!(trace.is_truncated());
        assert_eq!(caller_of(0), CallSite::UNKNOWN);
    }

    #[inline(never)]
    extern "C" fn callee() -> CallSite {
        caller_of(callee as usize)
    }

    #[test]
    fn test_caller_of_points_into_caller() {
        let site = std::hint::black_box(callee());
        assert!(site.is_known());
        let module = crate::resolver::module_of(site.0 as usize).unwrap();
        assert!(module.is_main_program());
    }

    #[test]
    fn test_symbolize_formats_each_frame() {
        let lines = symbolize(&[test_symbolize_formats_each_frame as usize as u64, 0]);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("#0 "));
        assert!(lines[1].starts_with("#1  0x0000000000000000"));
    }
}
