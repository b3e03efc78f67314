//! Error types for the provider crate.

use std::path::PathBuf;
use std::time::Duration;

use mng_core::{CoreError, ErrorCategory, HostId};
use mng_store::StoreError;
use thiserror::Error;

/// Errors that can occur while talking to a backend.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The instance has no host with this id.
    #[error("provider {instance}: host {host_id} not found")]
    HostNotFound {
        /// Provider instance name.
        instance: String,
        /// The missing host.
        host_id: HostId,
    },

    /// The backend cannot perform this operation.
    #[error("provider {instance} does not support {operation}")]
    Unsupported {
        /// Provider instance name.
        instance: String,
        /// The rejected operation.
        operation: &'static str,
    },

    /// Allocating or bootstrapping a new host failed.
    #[error("provider {instance}: creating host {host_name} failed: {reason}")]
    CreateFailed {
        /// Provider instance name.
        instance: String,
        /// Name of the host being created.
        host_name: String,
        /// One-line reason.
        reason: String,
        /// Captured build output.
        build_log: String,
    },

    /// An external command exited unsuccessfully.
    #[error("`{program} {args}` exited with {code:?}: {stderr}")]
    Command {
        /// The program that was run.
        program: String,
        /// Its arguments, space separated.
        args: String,
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// An external command could not be started at all.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// The program that was run.
        program: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// HTTP transport failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote API answered with an error status.
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The instance settings are invalid.
    #[error("provider {instance}: invalid configuration: {message}")]
    Config {
        /// Provider instance name.
        instance: String,
        /// What is wrong.
        message: String,
    },

    /// Local filesystem access failed.
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A backend operation did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// How long we waited.
        after: Duration,
    },

    /// Durable record store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Core error (layout, ledger, parsing).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProviderError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn unsupported(instance: &str, operation: &'static str) -> Self {
        Self::Unsupported {
            instance: instance.to_string(),
            operation,
        }
    }

    pub(crate) fn not_found(instance: &str, host_id: &HostId) -> Self {
        Self::HostNotFound {
            instance: instance.to_string(),
            host_id: *host_id,
        }
    }

    pub(crate) fn config(instance: &str, message: impl Into<String>) -> Self {
        Self::Config {
            instance: instance.to_string(),
            message: message.into(),
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::HostNotFound { .. }
            | Self::CreateFailed { .. }
            | Self::Command { .. }
            | Self::Io { .. } => ErrorCategory::HostScoped,
            Self::Unsupported { .. } | Self::Config { .. } | Self::Spawn { .. } => {
                ErrorCategory::Fatal
            }
            Self::Http(e) if e.is_timeout() || e.is_connect() => ErrorCategory::Transient,
            Self::Http(_) => ErrorCategory::HostScoped,
            Self::Api { status, .. } if *status == 429 || *status >= 500 => {
                ErrorCategory::Transient
            }
            Self::Api { .. } => ErrorCategory::HostScoped,
            Self::Timeout { .. } => ErrorCategory::Transient,
            Self::Store(e) => e.category(),
            Self::Core(e) => e.category(),
            Self::Serialization(_) => ErrorCategory::Unexpected,
        }
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Returns true if the backend reported the host as gone.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::HostNotFound { .. }) || matches!(self, Self::Api { status: 404, .. })
    }
}

/// A specialized Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_retry_on_server_side_only() {
        let busy = ProviderError::Api {
            status: 503,
            message: "busy".into(),
        };
        let bad = ProviderError::Api {
            status: 400,
            message: "bad image".into(),
        };
        assert!(busy.is_retriable());
        assert!(!bad.is_retriable());
    }

    #[test]
    fn unsupported_requires_user_fix() {
        let err = ProviderError::unsupported("local", "create_snapshot");
        assert!(err.category().requires_user_fix());
        assert_eq!(
            err.to_string(),
            "provider local does not support create_snapshot"
        );
    }

    #[test]
    fn not_found_detection() {
        let host = HostId::generate();
        assert!(ProviderError::not_found("docker", &host).is_not_found());
        assert!(ProviderError::Api {
            status: 404,
            message: String::new()
        }
        .is_not_found());
    }
}
