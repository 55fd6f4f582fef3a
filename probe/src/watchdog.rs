//! Hang detection
//!
//! The monitored thread calls [`Heartbeat::beat`] whenever it makes progress. A watchdog
//! thread wakes every tick and, once the last beat is older than the timeout, asks the
//! monitored thread for its stack and reports a hang. A hang episode ends with the next
//! beat; each episode is reported once. The process is never terminated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use probe_types::{HangReport, StackTrace, MAX_FRAMES};

use crate::capture::{self, HandlerRegistry, MonitoredThread};
use crate::config::WatchdogConfig;
use crate::error::CaptureError;
use crate::stacktrace::Budget;

#[derive(Debug)]
struct Pulse {
    epoch: Instant,
    /// Milliseconds since `epoch` at the last beat.
    last: AtomicU64,
    beats: AtomicU64,
}

/// Liveness signal of a monitored thread. Clones share the same pulse.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pulse: Arc<Pulse>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Heartbeat {
            pulse: Arc::new(Pulse {
                epoch: Instant::now(),
                last: AtomicU64::new(0),
                beats: AtomicU64::new(0),
            }),
        }
    }

    pub fn beat(&self) {
        let now = self.pulse.epoch.elapsed().as_millis() as u64;
        self.pulse.last.store(now, Ordering::Release);
        self.pulse.beats.fetch_add(1, Ordering::AcqRel);
    }

    /// Time since the last beat, or since creation.
    pub fn silence(&self) -> Duration {
        let now = self.pulse.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.pulse.last.load(Ordering::Acquire)))
    }

    fn beats(&self) -> u64 {
        self.pulse.beats.load(Ordering::Acquire)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// A running watchdog thread. Dropping it stops the thread.
pub struct HangWatchdog {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    reports: Arc<AtomicU64>,
}

struct Watcher {
    monitored: MonitoredThread,
    heartbeat: Heartbeat,
    config: WatchdogConfig,
    registry: &'static HandlerRegistry,
    /// Beat count of the episode that was reported last.
    reported: Option<u64>,
    reports: Arc<AtomicU64>,
}

impl HangWatchdog {
    /// Watch `monitored`, which is expected to beat `heartbeat` at least every
    /// `config.timeout`. Hang reports go to the sinks `registry` has for hangs.
    pub fn spawn(
        monitored: MonitoredThread,
        heartbeat: Heartbeat,
        config: WatchdogConfig,
        registry: &'static HandlerRegistry,
    ) -> Result<Self, CaptureError> {
        capture::install_dump_handler(Budget::new(MAX_FRAMES, config.dump_timeout))?;
        let (stop, stopped) = crossbeam_channel::bounded(0);
        let reports = Arc::new(AtomicU64::new(0));
        let mut watcher = Watcher {
            monitored,
            heartbeat,
            config,
            registry,
            reported: None,
            reports: Arc::clone(&reports),
        };
        let thread = std::thread::Builder::new()
            .name("perf-probe-watchdog".to_string())
            .spawn(move || watcher.run(stopped))
            .map_err(CaptureError::ThreadSpawn)?;
        info!(
            "watching thread {} with a {} ms timeout",
            monitored.thread_id(),
            config.timeout.as_millis()
        );
        Ok(HangWatchdog {
            stop: Some(stop),
            thread: Some(thread),
            reports,
        })
    }

    /// Number of hang reports produced so far.
    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Acquire)
    }

    /// Stop the watchdog thread and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for HangWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Watcher {
    fn run(&mut self, stopped: Receiver<()>) {
        let tick = crossbeam_channel::tick(self.config.tick);
        loop {
            crossbeam_channel::select! {
                recv(stopped) -> _ => break,
                recv(tick) -> _tick => self.check(),
            }
        }
        debug!("watchdog for thread {} stopped", self.monitored.thread_id());
    }

    fn check(&mut self) {
        let silence = self.heartbeat.silence();
        let episode = self.heartbeat.beats();
        if silence < self.config.timeout || self.reported == Some(episode) {
            return;
        }
        self.reported = Some(episode);

        let stack = match capture::request_stack(&self.monitored, self.config.dump_timeout) {
            Ok(stack) => stack,
            Err(err) => {
                warn!("hang report without stack: {}", err);
                let mut stack = StackTrace::new();
                stack.mark_truncated();
                stack
            }
        };
        let report = HangReport {
            thread_id: self.monitored.thread_id(),
            stack,
            duration_ms: silence.as_millis() as u64,
            timestamp: crate::timestamp(),
        };
        self.reports.fetch_add(1, Ordering::AcqRel);
        self.registry.dispatch_hang(&report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_silence() {
        let heartbeat = Heartbeat::new();
        std::thread::sleep(Duration::from_millis(30));
        assert!(heartbeat.silence() >= Duration::from_millis(30));
        heartbeat.clone().beat();
        assert!(heartbeat.silence() < Duration::from_millis(30));
        assert_eq!(heartbeat.beats(), 1);
    }

    #[test]
    fn test_watchdog_quiet_while_beating() {
        let registry: &'static HandlerRegistry = Box::leak(Box::new(HandlerRegistry::new()));
        let heartbeat = Heartbeat::new();
        let config = WatchdogConfig {
            timeout: Duration::from_millis(200),
            tick: Duration::from_millis(10),
            dump_timeout: Duration::from_millis(100),
        };
        let watchdog =
            HangWatchdog::spawn(MonitoredThread::current(), heartbeat.clone(), config, registry)
                .unwrap();
        for _ in 0..20 {
            heartbeat.beat();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(watchdog.reports(), 0);
        watchdog.stop();
    }
}
