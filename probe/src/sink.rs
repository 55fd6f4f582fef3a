//! Report sinks
//!
//! A [`ReportSink`] receives reports from the crash capture, the hang watchdog and the
//! allocation interceptor. Crash reports of real faults are delivered from a signal
//! handler: implementations of [`ReportSink::on_crash_report`] must not allocate, lock or
//! log. [`FdSink`] is written for that context; the other sinks document what they do there.

use std::fmt::{self, Write as _};
use std::io::{self, Read, Write};
use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, warn};
use probe_types::{AllocationRecord, CrashReport, HangReport, ReportEvent};

use crate::stacktrace;

/// What should happen to the process after a crash report was delivered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Continue with the default action of the fault.
    Terminate,
    /// Keep the process alive. Honored for non-fatal report kinds only.
    Suppress,
}

pub trait ReportSink: Send + Sync {
    fn on_crash_report(&self, _report: &CrashReport) -> Disposition {
        Disposition::Terminate
    }

    fn on_hang_report(&self, _report: &HangReport) {}

    fn on_leak_report(&self, _records: &[AllocationRecord]) {}
}

const LINE_CAPACITY: usize = 256;

/// A stack-allocated line that is written with a single `write(2)`.
///
/// Text beyond the capacity is dropped.
pub struct LineBuffer {
    len: usize,
    bytes: [u8; LINE_CAPACITY],
}

impl LineBuffer {
    pub const fn new() -> Self {
        LineBuffer {
            len: 0,
            bytes: [0; LINE_CAPACITY],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Write the buffered text to `fd` and empty the buffer.
    pub fn flush_to(&mut self, fd: libc::c_int) {
        let mut written = 0;
        while written < self.len {
            // SAFETY: the range is initialized; `write` is async-signal-safe.
            let result = unsafe {
                libc::write(
                    fd,
                    self.bytes[written..self.len].as_ptr() as *const libc::c_void,
                    self.len - written,
                )
            };
            if result <= 0 {
                break;
            }
            written += result as usize;
        }
        self.len = 0;
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for LineBuffer {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        let take = text.len().min(LINE_CAPACITY - self.len);
        self.bytes[self.len..self.len + take].copy_from_slice(&text.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Writes reports as text lines to a file descriptor without allocating.
///
/// Frames are printed as raw addresses; symbolizing is not possible in a fault handler.
#[derive(Debug, Copy, Clone)]
pub struct FdSink {
    fd: libc::c_int,
}

impl FdSink {
    pub fn new(fd: libc::c_int) -> Self {
        FdSink { fd }
    }

    pub fn stderr() -> Self {
        FdSink::new(libc::STDERR_FILENO)
    }

    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    fn write_frames(&self, line: &mut LineBuffer, frames: &[u64], truncated: bool) {
        for (depth, ip) in frames.iter().enumerate() {
            let _ = writeln!(line, "  #{:<2} {:#018x}", depth, ip);
            line.flush_to(self.fd);
        }
        if truncated {
            let _ = writeln!(line, "  ... truncated");
            line.flush_to(self.fd);
        }
    }
}

impl ReportSink for FdSink {
    fn on_crash_report(&self, report: &CrashReport) -> Disposition {
        let mut line = LineBuffer::new();
        let _ = write!(
            line,
            "perf-probe: crash kind={} signal={} thread={}",
            report.kind.name(),
            report.signal,
            report.thread_id
        );
        if let Some(address) = report.fault_address {
            let _ = write!(line, " address={:#x}", address);
        }
        let _ = write!(line, " time={}", report.timestamp);
        if let Some(context) = &report.context {
            let _ = write!(line, " context={}", context.as_str());
        }
        let _ = writeln!(line);
        line.flush_to(self.fd);
        self.write_frames(&mut line, &report.stack, report.stack.is_truncated());
        Disposition::Terminate
    }

    fn on_hang_report(&self, report: &HangReport) {
        let mut line = LineBuffer::new();
        let _ = writeln!(
            line,
            "perf-probe: hang thread={} duration_ms={} time={}",
            report.thread_id, report.duration_ms, report.timestamp
        );
        line.flush_to(self.fd);
        self.write_frames(&mut line, &report.stack, report.stack.is_truncated());
    }

    fn on_leak_report(&self, records: &[AllocationRecord]) {
        let mut line = LineBuffer::new();
        let bytes: usize = records.iter().map(|record| record.size).sum();
        let _ = writeln!(
            line,
            "perf-probe: leak allocations={} bytes={}",
            records.len(),
            bytes
        );
        line.flush_to(self.fd);
        for record in records {
            let _ = writeln!(
                line,
                "  {:#x} size={} site={:#x} time={}",
                record.address, record.size, record.call_site.0, record.timestamp
            );
            line.flush_to(self.fd);
        }
    }
}

/// Symbolized output through `log`. Crash reports go to an [`FdSink`] on stderr.
#[derive(Debug, Copy, Clone)]
pub struct LogSink {
    crash: FdSink,
}

impl LogSink {
    pub fn new() -> Self {
        LogSink {
            crash: FdSink::stderr(),
        }
    }

    /// Send crash reports to `fd` instead of stderr.
    pub fn with_fault_fd(fd: libc::c_int) -> Self {
        LogSink {
            crash: FdSink::new(fd),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportSink for LogSink {
    fn on_crash_report(&self, report: &CrashReport) -> Disposition {
        self.crash.on_crash_report(report)
    }

    fn on_hang_report(&self, report: &HangReport) {
        let mut text = stacktrace::symbolize(&report.stack).join("\n");
        if report.stack.is_truncated() {
            text.push_str("\n...");
        }
        warn!(
            "thread {} hung for {} ms\n{}",
            report.thread_id, report.duration_ms, text
        );
    }

    fn on_leak_report(&self, records: &[AllocationRecord]) {
        let bytes: usize = records.iter().map(|record| record.size).sum();
        warn!("{} allocations ({} bytes) still live", records.len(), bytes);
        for record in records {
            let site = if record.call_site.is_known() {
                stacktrace::symbolize(&[record.call_site.0]).join("")
            } else {
                "unknown call site".to_string()
            };
            warn!("  {:#x} {} bytes from {}", record.address, record.size, site);
        }
    }
}

/// Forwards reports as [`ReportEvent`]s into a bounded channel.
///
/// Crash reports use `try_send`, a full channel drops them.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<ReportEvent>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (ChannelSink, Receiver<ReportEvent>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (ChannelSink { sender }, receiver)
    }

    fn forward(&self, event: ReportEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("report channel is full, dropping a report"),
            Err(TrySendError::Disconnected(_)) => debug!("report channel is closed"),
        }
    }
}

impl ReportSink for ChannelSink {
    fn on_crash_report(&self, report: &CrashReport) -> Disposition {
        let _ = self.sender.try_send(ReportEvent::Crash(*report));
        Disposition::Terminate
    }

    fn on_hang_report(&self, report: &HangReport) {
        self.forward(ReportEvent::Hang(*report));
    }

    fn on_leak_report(&self, records: &[AllocationRecord]) {
        self.forward(ReportEvent::Leak(records.to_vec()));
    }
}

/// Writes reports as a bincode stream of [`ReportEvent`]s.
///
/// On the crash path the writer is only used if it is not locked; a report that would
/// have to wait is dropped.
pub struct BincodeSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> BincodeSink<W> {
    pub fn new(writer: W) -> Self {
        BincodeSink {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_event(writer: &mut W, event: &ReportEvent) {
        if let Err(err) = bincode::serialize_into(&mut *writer, event) {
            warn!("failed to write report: {}", err);
        } else if let Err(err) = writer.flush() {
            warn!("failed to flush report stream: {}", err);
        }
    }
}

impl<W: Write + Send> ReportSink for BincodeSink<W> {
    fn on_crash_report(&self, report: &CrashReport) -> Disposition {
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = bincode::serialize_into(&mut *writer, &ReportEvent::Crash(*report));
            let _ = writer.flush();
        }
        Disposition::Terminate
    }

    fn on_hang_report(&self, report: &HangReport) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        Self::write_event(&mut writer, &ReportEvent::Hang(*report));
    }

    fn on_leak_report(&self, records: &[AllocationRecord]) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        Self::write_event(&mut writer, &ReportEvent::Leak(records.to_vec()));
    }
}

/// Read back every event of a stream written by [`BincodeSink`].
pub fn read_events<R: Read>(mut reader: R) -> io::Result<Vec<ReportEvent>> {
    let mut events = Vec::new();
    loop {
        match bincode::deserialize_from::<_, ReportEvent>(&mut reader) {
            Ok(event) => events.push(event),
            Err(err) => match *err {
                bincode::ErrorKind::Io(ref io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(events)
                }
                _ => return Err(io::Error::new(io::ErrorKind::InvalidData, err)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_types::{CallSite, FaultKind, StackTrace};

    fn crash() -> CrashReport {
        CrashReport {
            kind: FaultKind::IllegalMemoryAccess,
            signal: libc::SIGSEGV,
            thread_id: 7,
            fault_address: Some(0x8),
            stack: StackTrace::from_frames(&[0x1000, 0x2000]),
            timestamp: 1,
            context: None,
        }
    }

    fn hang() -> HangReport {
        HangReport {
            thread_id: 7,
            stack: StackTrace::from_frames(&[0x1000]),
            duration_ms: 600,
            timestamp: 2,
        }
    }

    #[test]
    fn test_line_buffer_truncates() {
        let mut line = LineBuffer::new();
        let long = "x".repeat(LINE_CAPACITY * 2);
        write!(line, "{}", long).unwrap();
        assert_eq!(line.as_bytes().len(), LINE_CAPACITY);
    }

    #[test]
    fn test_fd_sink_writes_lines() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let sink = FdSink::new(fds[1]);
        assert_eq!(sink.on_crash_report(&crash()), Disposition::Terminate);
        unsafe { libc::close(fds[1]) };

        let mut text = String::new();
        let mut reader = unsafe {
            <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(fds[0])
        };
        reader.read_to_string(&mut text).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3, "{}", text);
        assert!(lines[0].starts_with("perf-probe: crash kind=illegal-memory-access signal=11"));
        assert!(lines[0].contains("address=0x8"));
        assert!(lines[2].contains("0x0000000000002000"));
    }

    #[test]
    fn test_channel_sink_forwards_events() {
        let (sink, receiver) = ChannelSink::bounded(1);
        sink.on_hang_report(&hang());
        // Full, dropped.
        sink.on_crash_report(&crash());
        assert_eq!(receiver.try_recv().unwrap(), ReportEvent::Hang(hang()));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_bincode_sink_stream() {
        let sink = BincodeSink::new(Vec::new());
        sink.on_crash_report(&crash());
        sink.on_hang_report(&hang());
        let record = AllocationRecord {
            address: 0x5000,
            size: 32,
            call_site: CallSite(0x1234),
            timestamp: 3,
        };
        sink.on_leak_report(&[record]);

        let bytes = sink.into_inner();
        let events = read_events(bytes.as_slice()).unwrap();
        assert_eq!(
            events,
            vec![
                ReportEvent::Crash(crash()),
                ReportEvent::Hang(hang()),
                ReportEvent::Leak(vec![record]),
            ]
        );
    }
}
