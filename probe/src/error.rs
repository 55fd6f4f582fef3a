//! Structured error types for the probe
//!
//! Resolver and hook errors are always returned to the caller. Errors that happen while a
//! fault is being handled have no caller; they degrade into partial reports instead.

use thiserror::Error;

/// Exit code of a process that faulted again while a crash report was being captured.
pub const REENTRANT_FAULT_EXIT_CODE: i32 = 125;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("symbol {symbol} not found in any module matching {library}")]
    NotFound { library: String, symbol: String },

    #[error("symbol {symbol} is exported by {} modules: {}", .modules.len(), .modules.join(", "))]
    AmbiguousMatch { symbol: String, modules: Vec<String> },
}

#[derive(Error, Debug)]
pub enum HookError {
    #[error("symbol {symbol} not found in {library}")]
    SymbolNotFound { library: String, symbol: String },

    #[error("symbol {symbol} is ambiguous: {}", .modules.join(", "))]
    AmbiguousMatch { symbol: String, modules: Vec<String> },

    #[error("{symbol} in {library} is already hooked")]
    AlreadyInstalled { library: String, symbol: String },

    #[error("hook is not installed")]
    NotInstalled,

    #[error("cannot patch {symbol} at {address:#x}: {reason}")]
    UnsupportedInstructionPattern {
        symbol: String,
        address: usize,
        reason: String,
    },

    #[error("memory at {address:#x} is not writable: {source}")]
    PermissionDenied {
        address: usize,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HookError {
    /// Whether falling back to the indirection-table strategy may succeed.
    pub fn is_environment_limitation(&self) -> bool {
        matches!(
            self,
            HookError::UnsupportedInstructionPattern { .. } | HookError::PermissionDenied { .. }
        )
    }
}

impl From<ResolveError> for HookError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound { library, symbol } => {
                HookError::SymbolNotFound { library, symbol }
            }
            ResolveError::AmbiguousMatch { symbol, modules } => {
                HookError::AmbiguousMatch { symbol, modules }
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to install handler for signal {signal}: {source}")]
    SignalInstall {
        signal: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set up an alternate signal stack: {0}")]
    AltStack(#[source] std::io::Error),

    #[error("crash capture is not armed")]
    NotArmed,

    #[error("thread {thread_id} did not answer the stack dump request within {timeout_ms} ms")]
    CaptureTimeout { thread_id: u32, timeout_ms: u64 },

    #[error("cannot signal thread {thread_id}: {source}")]
    SignalDelivery {
        thread_id: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("fault while capturing a crash report")]
    ReentrantFault,

    #[error("failed to spawn the watchdog thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = ProbeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_error_display() {
        let err = ResolveError::AmbiguousMatch {
            symbol: "malloc".to_string(),
            modules: vec!["libc.so.6".to_string(), "libjemalloc.so".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "symbol malloc is exported by 2 modules: libc.so.6, libjemalloc.so"
        );
    }

    #[test]
    fn test_resolve_error_converts_to_hook_error() {
        let err: HookError = ResolveError::NotFound {
            library: "libexample.so".to_string(),
            symbol: "malloc".to_string(),
        }
        .into();
        assert!(matches!(err, HookError::SymbolNotFound { .. }));
        assert!(err.to_string().contains("libexample.so"));
    }

    #[test]
    fn test_environment_limitations() {
        let unsupported = HookError::UnsupportedInstructionPattern {
            symbol: "getppid".to_string(),
            address: 0x1000,
            reason: "function too short".to_string(),
        };
        assert!(unsupported.is_environment_limitation());
        assert!(unsupported.to_string().contains("0x1000"));
        assert!(!HookError::NotInstalled.is_environment_limitation());
    }
}
