use std::sync::Arc;
use std::time::Duration;

use perf_probe::probe_types::{FaultKind, ReportEvent};
use perf_probe::{ChannelSink, HandlerRegistry, MonitoredThread, ProbeConfig, WatchdogConfig};

#[test]
fn blocked_thread_is_reported_once_and_keeps_running() {
    let _ = pretty_env_logger::try_init();
    let (sink, reports) = ChannelSink::bounded(16);
    let config = ProbeConfig {
        watchdog: WatchdogConfig {
            timeout: Duration::from_millis(500),
            tick: Duration::from_millis(50),
            dump_timeout: Duration::from_millis(200),
        },
        ..ProbeConfig::default()
    };
    let runtime = perf_probe::init_with(
        config,
        HandlerRegistry::new().register(&[FaultKind::Hang], Arc::new(sink)),
    )
    .unwrap();

    let (heartbeat, watchdog) = runtime.watch_current_thread().unwrap();
    let fixture = perf_probe::trigger_hang(Duration::from_millis(2000)).unwrap();
    heartbeat.beat();
    let waited = fixture.contend();
    heartbeat.beat();
    fixture.join();

    // Give a late tick the chance to misbehave.
    std::thread::sleep(Duration::from_millis(200));
    heartbeat.beat();
    watchdog.stop();
    assert!(waited >= Duration::from_millis(1000), "{:?}", waited);

    let hangs: Vec<_> = reports
        .try_iter()
        .filter_map(|event| match event {
            ReportEvent::Hang(report) => Some(report),
            _ => None,
        })
        .collect();
    assert_eq!(hangs.len(), 1, "{:?}", hangs);
    let report = &hangs[0];
    assert_eq!(report.thread_id, MonitoredThread::current().thread_id());
    assert!(report.duration_ms >= 500, "{}", report.duration_ms);
    assert!(report.duration_ms <= 2000, "{}", report.duration_ms);
    assert!(!report.stack.frames().is_empty());
}

#[test]
fn watchdog_without_hang_sinks_still_counts() {
    let registry: &'static HandlerRegistry = Box::leak(Box::new(HandlerRegistry::new()));
    let heartbeat = perf_probe::Heartbeat::new();
    let watchdog = perf_probe::HangWatchdog::spawn(
        MonitoredThread::current(),
        heartbeat.clone(),
        WatchdogConfig {
            timeout: Duration::from_millis(100),
            tick: Duration::from_millis(20),
            dump_timeout: Duration::from_millis(100),
        },
        registry,
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(watchdog.reports(), 1);
    heartbeat.beat();
    watchdog.stop();
}
