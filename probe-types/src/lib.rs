//! Types for representing probe reports
//!
//! Everything in here is plain data. Types that are filled in from a fault handler
//! ([`StackTrace`], [`ContextTag`], [`CrashReport`]) have a fixed size and never allocate.

#![forbid(missing_docs)]

use std::ops::Deref;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// Environment symbol for the hang watchdog timeout, in milliseconds.
pub static ENV_HANG_TIMEOUT_MS: &str = "PERF_PROBE_HANG_TIMEOUT_MS";

/// Environment symbol for the hang watchdog polling interval, in milliseconds.
pub static ENV_WATCHDOG_TICK_MS: &str = "PERF_PROBE_WATCHDOG_TICK_MS";

/// Environment symbol for the allocation size above which a native stack is logged.
pub static ENV_LARGE_ALLOC_BYTES: &str = "PERF_PROBE_LARGE_ALLOC_BYTES";

/// Environment symbol for the user context attached to crash reports.
pub static ENV_CONTEXT: &str = "PERF_PROBE_CONTEXT";

/// Environment symbol for the file descriptor fault-path diagnostics are written to.
pub static ENV_FAULT_FD: &str = "PERF_PROBE_FAULT_FD";

/// Nanosecond wall-clock timestamp, relative to the UNIX epoch.
pub type Timestamp = u64;

/// Maximum number of frames a [`StackTrace`] holds.
pub const MAX_FRAMES: usize = 64;

/// Maximum number of bytes of user context carried by a crash report.
pub const CONTEXT_CAPACITY: usize = 128;

/// Return address of an intercepted call, `0` if it could not be determined.
#[derive(Debug, Default, Copy, Clone, Serialize, Deserialize, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct CallSite(pub u64);

impl CallSite {
    /// The call site could not be determined.
    pub const UNKNOWN: CallSite = CallSite(0);

    /// Whether this call site points at an actual instruction.
    pub fn is_known(&self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for CallSite {
    fn from(ip: u64) -> Self {
        Self(ip)
    }
}

/// Kind of failure a report describes.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum FaultKind {
    /// Access to unmapped or protected memory (`SIGSEGV`, `SIGBUS`).
    IllegalMemoryAccess,
    /// Undefined or privileged instruction (`SIGILL`).
    IllegalInstruction,
    /// The process aborted itself (`SIGABRT`).
    Abort,
    /// A thread ran into the guard page below its stack.
    StackOverflow,
    /// Integer division by zero and friends (`SIGFPE`).
    ArithmeticFault,
    /// A capture cycle requested without an actual fault.
    Synthetic,
    /// A monitored thread stopped producing heartbeats.
    Hang,
}

impl FaultKind {
    /// Number of fault kinds.
    pub const COUNT: usize = 7;

    /// All fault kinds, in [`FaultKind::index`] order.
    pub const ALL: [FaultKind; FaultKind::COUNT] = [
        FaultKind::IllegalMemoryAccess,
        FaultKind::IllegalInstruction,
        FaultKind::Abort,
        FaultKind::StackOverflow,
        FaultKind::ArithmeticFault,
        FaultKind::Synthetic,
        FaultKind::Hang,
    ];

    /// Dense index, suitable for per-kind tables.
    pub fn index(self) -> usize {
        match self {
            FaultKind::IllegalMemoryAccess => 0,
            FaultKind::IllegalInstruction => 1,
            FaultKind::Abort => 2,
            FaultKind::StackOverflow => 3,
            FaultKind::ArithmeticFault => 4,
            FaultKind::Synthetic => 5,
            FaultKind::Hang => 6,
        }
    }

    /// Whether the process terminates after this kind was reported.
    ///
    /// Only non-fatal kinds may be suppressed by a sink.
    pub fn is_fatal(self) -> bool {
        !matches!(self, FaultKind::Synthetic | FaultKind::Hang)
    }

    /// Stable, human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            FaultKind::IllegalMemoryAccess => "illegal-memory-access",
            FaultKind::IllegalInstruction => "illegal-instruction",
            FaultKind::Abort => "abort",
            FaultKind::StackOverflow => "stack-overflow",
            FaultKind::ArithmeticFault => "arithmetic-fault",
            FaultKind::Synthetic => "synthetic",
            FaultKind::Hang => "hang",
        }
    }
}

/// A size-limited stack trace composed of instruction pointers, outermost frame first.
#[derive(Copy, Clone, Deserialize)]
#[serde(from = "StackTraceRepr")]
pub struct StackTrace {
    len: usize,
    truncated: bool,
    frames: [u64; MAX_FRAMES],
}

/// Owned wire form of a [`StackTrace`].
#[derive(Deserialize)]
struct StackTraceRepr {
    frames: Vec<u64>,
    truncated: bool,
}

impl From<StackTraceRepr> for StackTrace {
    fn from(repr: StackTraceRepr) -> Self {
        let mut trace = StackTrace::from_frames(&repr.frames);
        if repr.truncated {
            trace.mark_truncated();
        }
        trace
    }
}

impl StackTrace {
    /// An empty trace.
    pub const fn new() -> Self {
        Self {
            len: 0,
            truncated: false,
            frames: [0; MAX_FRAMES],
        }
    }

    /// Build a trace from a slice of instruction pointers, truncating at [`MAX_FRAMES`].
    pub fn from_frames(frames: &[u64]) -> Self {
        let mut trace = Self::new();
        for ip in frames {
            if !trace.push(*ip) {
                break;
            }
        }
        trace
    }

    /// Append a frame. Returns `false` and marks the trace truncated when it is full.
    pub fn push(&mut self, ip: u64) -> bool {
        if self.len == MAX_FRAMES {
            self.truncated = true;
            return false;
        }
        self.frames[self.len] = ip;
        self.len += 1;
        true
    }

    /// Remove all frames.
    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
    }

    /// Drop the first `count` frames, keeping the order of the rest.
    pub fn drain_front(&mut self, count: usize) {
        let count = count.min(self.len);
        self.frames.copy_within(count..self.len, 0);
        self.len -= count;
    }

    /// Reverse the frame order in place.
    pub fn reverse(&mut self) {
        self.frames[..self.len].reverse();
    }

    /// Whether frames were lost because a frame or time budget ran out.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Record that the trace is partial.
    pub fn mark_truncated(&mut self) {
        self.truncated = true;
    }

    /// The captured frames.
    pub fn frames(&self) -> &[u64] {
        &self.frames[..self.len]
    }
}

impl Default for StackTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for StackTrace {
    type Target = [u64];

    fn deref(&self) -> &Self::Target {
        self.frames()
    }
}

impl PartialEq for StackTrace {
    fn eq(&self, other: &Self) -> bool {
        self.truncated == other.truncated && self.frames() == other.frames()
    }
}

impl Eq for StackTrace {}

impl std::fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackTrace")
            .field("frames", &self.frames())
            .field("truncated", &self.truncated)
            .finish()
    }
}

// Serialized from the borrowed slice so that writing a report does not allocate.
impl Serialize for StackTrace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("StackTrace", 2)?;
        state.serialize_field("frames", self.frames())?;
        state.serialize_field("truncated", &self.truncated)?;
        state.end()
    }
}

/// Fixed-capacity, user supplied text attached to crash reports.
#[derive(Copy, Clone, Deserialize)]
#[serde(from = "String")]
pub struct ContextTag {
    len: usize,
    bytes: [u8; CONTEXT_CAPACITY],
}

impl ContextTag {
    /// Copy `text`, truncated at a character boundary to [`CONTEXT_CAPACITY`] bytes.
    pub fn new(text: &str) -> Self {
        let mut len = text.len().min(CONTEXT_CAPACITY);
        while !text.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0; CONTEXT_CAPACITY];
        bytes[..len].copy_from_slice(&text.as_bytes()[..len]);
        Self { len, bytes }
    }

    /// The context text.
    pub fn as_str(&self) -> &str {
        // Only ever filled from a `&str` cut at a character boundary.
        std::str::from_utf8(&self.bytes[..self.len]).unwrap_or_default()
    }
}

impl From<String> for ContextTag {
    fn from(text: String) -> Self {
        ContextTag::new(&text)
    }
}

impl PartialEq for ContextTag {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for ContextTag {}

impl std::fmt::Debug for ContextTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContextTag").field(&self.as_str()).finish()
    }
}

impl Serialize for ContextTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Diagnostic record of a fatal fault, or of a synthetic capture cycle.
///
/// Built once per fault in preallocated storage and handed to sinks by reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    /// What went wrong.
    pub kind: FaultKind,
    /// Signal number that was delivered, `0` for synthetic captures.
    pub signal: i32,
    /// Kernel thread id of the faulting thread.
    pub thread_id: u32,
    /// Address the faulting instruction tried to access, if the signal carries one.
    pub fault_address: Option<u64>,
    /// Call stack of the faulting thread.
    pub stack: StackTrace,
    /// Wall-clock time of the capture.
    pub timestamp: Timestamp,
    /// Context supplied by the user at initialization.
    pub context: Option<ContextTag>,
}

/// A monitored thread failed to produce a heartbeat in time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HangReport {
    /// Kernel thread id of the monitored thread.
    pub thread_id: u32,
    /// Stack of the monitored thread at detection time. Empty and truncated if the
    /// thread did not answer the dump request.
    pub stack: StackTrace,
    /// Time since the last heartbeat.
    pub duration_ms: u64,
    /// Wall-clock time of the detection.
    pub timestamp: Timestamp,
}

/// A live allocation observed by the allocation interceptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Address returned by the allocator.
    pub address: u64,
    /// Requested size in bytes.
    pub size: usize,
    /// Return address of the allocating call.
    pub call_site: CallSite,
    /// Wall-clock time of the allocation.
    pub timestamp: Timestamp,
}

/// A choice of reports, the unit of the binary report stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportEvent {
    /// A crash report.
    Crash(CrashReport),
    /// A hang report.
    Hang(HangReport),
    /// Allocations still live at the end of a probe window.
    Leak(Vec<AllocationRecord>),
}
