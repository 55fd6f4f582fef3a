//! Probe configuration
//!
//! Defaults can be overridden from the environment, see [`ProbeConfig::from_env`].

use std::time::Duration;

use probe_types::{
    ENV_CONTEXT, ENV_FAULT_FD, ENV_HANG_TIMEOUT_MS, ENV_LARGE_ALLOC_BYTES, ENV_WATCHDOG_TICK_MS,
    MAX_FRAMES,
};

use crate::error::ConfigError;

/// Crash capture settings.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Maximum number of frames walked while handling a fault.
    pub frame_budget: usize,
    /// Maximum time spent walking the stack while handling a fault.
    pub time_budget: Duration,
    /// Descriptor minimal fault-path diagnostics are written to.
    pub fault_fd: i32,
    /// Attached to every crash report.
    pub context: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_budget: MAX_FRAMES,
            time_budget: Duration::from_millis(100),
            fault_fd: libc::STDERR_FILENO,
            context: None,
        }
    }
}

/// Hang watchdog settings.
#[derive(Debug, Copy, Clone)]
pub struct WatchdogConfig {
    /// Time without heartbeat after which a hang is reported.
    pub timeout: Duration,
    /// Polling interval of the watchdog thread.
    pub tick: Duration,
    /// How long to wait for the monitored thread to answer a stack dump request.
    pub dump_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            tick: Duration::from_millis(50),
            dump_timeout: Duration::from_millis(200),
        }
    }
}

/// Allocation interceptor settings.
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    /// Allocations of at least this many bytes log a native stack.
    pub large_allocation_threshold: Option<usize>,
    /// Unwind to the caller of every intercepted allocation.
    pub capture_call_sites: bool,
    /// Number of freed addresses per shard remembered for double-free detection.
    pub freed_window: usize,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            large_allocation_threshold: Some(1024 * 1024),
            capture_call_sites: true,
            freed_window: 64,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProbeConfig {
    pub capture: CaptureConfig,
    pub watchdog: WatchdogConfig,
    pub interceptor: InterceptorConfig,
}

impl ProbeConfig {
    /// Defaults overlaid with `PERF_PROBE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let mut config = ProbeConfig::default();
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_HANG_TIMEOUT_MS)? {
            config.watchdog.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_WATCHDOG_TICK_MS)? {
            if ms == 0 {
                return Err(invalid(ENV_WATCHDOG_TICK_MS, "0", "tick must be positive"));
            }
            config.watchdog.tick = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse_var::<usize, _>(&lookup, ENV_LARGE_ALLOC_BYTES)? {
            config.interceptor.large_allocation_threshold = (bytes > 0).then_some(bytes);
        }
        if let Some(fd) = parse_var::<i32, _>(&lookup, ENV_FAULT_FD)? {
            config.capture.fault_fd = fd;
        }
        if let Some(context) = lookup(ENV_CONTEXT) {
            config.capture.context = Some(context);
        }
        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|err: T::Err| invalid(key, &value, &err.to_string())),
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = ProbeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.watchdog.timeout, Duration::from_millis(5000));
        assert_eq!(config.interceptor.large_allocation_threshold, Some(1 << 20));
        assert_eq!(config.capture.fault_fd, 2);
        assert!(config.capture.context.is_none());
    }

    #[test]
    fn test_environment_overrides() {
        let config = ProbeConfig::from_lookup(lookup(&[
            (ENV_HANG_TIMEOUT_MS, "500"),
            (ENV_LARGE_ALLOC_BYTES, "0"),
            (ENV_CONTEXT, "nightly build"),
        ]))
        .unwrap();
        assert_eq!(config.watchdog.timeout, Duration::from_millis(500));
        assert_eq!(config.interceptor.large_allocation_threshold, None);
        assert_eq!(config.capture.context.as_deref(), Some("nightly build"));
    }

    #[test]
    fn test_malformed_value_is_rejected() {
        let err = ProbeConfig::from_lookup(lookup(&[(ENV_HANG_TIMEOUT_MS, "soon")])).unwrap_err();
        let ConfigError::InvalidValue { key, value, .. } = err;
        assert_eq!(key, ENV_HANG_TIMEOUT_MS);
        assert_eq!(value, "soon");
        assert!(ProbeConfig::from_lookup(lookup(&[(ENV_WATCHDOG_TICK_MS, "0")])).is_err());
    }
}
