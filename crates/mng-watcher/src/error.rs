//! Error types for the idle watcher.

use std::path::PathBuf;

use mng_core::{CoreError, ErrorCategory};
use thiserror::Error;

/// A result type using `WatcherError`.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur while watching a host.
#[derive(Debug, Error)]
pub enum WatcherError {
    /// The activity config or a marker could not be read.
    #[error(transparent)]
    Ledger(#[from] CoreError),

    /// The shutdown hook does not exist.
    #[error("shutdown hook missing at {}", path.display())]
    HookMissing {
        /// Expected hook path.
        path: PathBuf,
    },

    /// The shutdown hook could not be spawned.
    #[error("failed to run shutdown hook {}: {source}", path.display())]
    HookSpawn {
        /// Hook path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The shutdown hook exited unsuccessfully.
    #[error("shutdown hook {} exited with {}", path.display(), describe_exit(*code))]
    HookFailed {
        /// Hook path.
        path: PathBuf,
        /// Exit code, if the hook was not killed by a signal.
        code: Option<i32>,
    },

    /// The watcher log could not be appended to.
    #[error("failed to write watcher log {}: {source}", path.display())]
    Log {
        /// Log path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

fn describe_exit(code: Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}"))
}

impl WatcherError {
    /// Classify this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Ledger(e) => e.category(),
            Self::HookMissing { .. } => ErrorCategory::Fatal,
            Self::HookSpawn { .. } | Self::HookFailed { .. } => ErrorCategory::HostScoped,
            Self::Log { .. } => ErrorCategory::Unexpected,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }
}
