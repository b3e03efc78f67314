//! Error types for the storage layer.

use std::path::PathBuf;
use std::time::Duration;

use mng_core::{ErrorCategory, HostId, HostName};
use thiserror::Error;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested host record was not found.
    #[error("no durable record for host {0}")]
    NotFound(HostId),

    /// A filesystem operation failed.
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error at {}: {message}", path.display())]
    Serialization {
        /// The record being (de)serialized.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// A per-host lock could not be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound(_) => ErrorCategory::HostScoped,
            Self::Io { .. } | Self::Serialization { .. } => ErrorCategory::Unexpected,
            Self::Lock(e) => e.category(),
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }
}

/// Errors from the advisory per-host lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another invocation held the lock for longer than the bounded wait.
    #[error("timed out after {waited:?} waiting for the lock on host {host_id}; another mng command is working on it, try again")]
    Timeout {
        /// The contended host.
        host_id: HostId,
        /// How long we waited.
        waited: Duration,
    },

    /// Another creation held the host name for longer than the bounded wait.
    #[error("timed out after {waited:?} waiting for the name {host_name}; another mng command is creating a host with it, try again")]
    NameTimeout {
        /// The contended name.
        host_name: HostName,
        /// How long we waited.
        waited: Duration,
    },

    /// The lock file could not be created, read, or removed.
    #[error("lock i/o error at {}: {source}", path.display())]
    Io {
        /// The lock file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    /// Classify this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout { .. } | Self::NameTimeout { .. } => ErrorCategory::Transient,
            Self::Io { .. } => ErrorCategory::Unexpected,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }
}
