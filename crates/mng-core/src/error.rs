//! Common error types for mng.
//!
//! `ErrorCategory` is the classification every crate's error enum maps onto. It
//! decides whether the caller retries, skips one unit of work, or aborts.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// How a failure should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network blips, lock-wait timeouts. Safe to retry with backoff.
    Transient,
    /// A hook or extension failed. Disable only that extension and continue.
    PluginScoped,
    /// Failure isolated to one agent. Fail that agent and continue with others.
    AgentScoped,
    /// Failure isolated to one host or provider instance.
    HostScoped,
    /// Configuration or invariant violation. Abort the command.
    Fatal,
    /// Anything uncategorized. Logged with full context before any retry.
    Unexpected,
}

impl ErrorCategory {
    /// Returns true if retrying the same operation may succeed.
    #[must_use]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Returns true if the user must change configuration to make progress.
    #[must_use]
    pub const fn requires_user_fix(self) -> bool {
        matches!(self, Self::Fatal)
    }
}

/// Core errors shared by the lower layers.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// An invalid name was provided.
    #[error("invalid name: {0}")]
    InvalidName(#[from] crate::names::NameError),

    /// A value outside its allowed set was provided.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// A filesystem operation on the host data root failed.
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A glob pattern could not be compiled.
    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

impl CoreError {
    /// Wrap an i/o error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidId(_) | Self::InvalidName(_) | Self::InvalidValue(_) | Self::Pattern(_) => {
                ErrorCategory::Fatal
            }
            Self::Io { .. } => ErrorCategory::HostScoped,
            Self::Serialization(_) => ErrorCategory::Unexpected,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retriable() {
        assert!(ErrorCategory::Transient.is_retriable());
        assert!(!ErrorCategory::HostScoped.is_retriable());
        assert!(!ErrorCategory::Fatal.is_retriable());
        assert!(ErrorCategory::Fatal.requires_user_fix());
    }

    #[test]
    fn io_error_names_path() {
        let err = CoreError::io(
            "/mng/activity/boot",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/mng/activity/boot"));
        assert_eq!(err.category(), ErrorCategory::HostScoped);
    }
}
