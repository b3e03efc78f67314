//! Error types for the control layer.
//!
//! Every error that concerns a host names it by id and human name, and maps
//! onto the shared `ErrorCategory` so callers can tell "retry" apart from
//! "fix your configuration".

use std::path::PathBuf;

use mng_core::{AgentName, CoreError, ErrorCategory, HostId, HostName, HostRef, HostState};
use mng_provider::ProviderError;
use mng_store::{LockError, StoreError};
use thiserror::Error;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in control-layer operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// No configured provider instance knows the host.
    #[error("host {0} not found on any provider instance")]
    HostNotFound(HostRef),

    /// The host could not be located because some instances failed to answer.
    #[error("host {reference} not found, but provider instances {failed:?} could not be checked")]
    LookupIncomplete {
        /// What was looked up.
        reference: HostRef,
        /// Instances whose discovery failed.
        failed: Vec<String>,
    },

    /// A host name matches more than one host.
    #[error("host name {name} is ambiguous: {count} hosts match; use the host id")]
    AmbiguousName {
        /// The ambiguous name.
        name: HostName,
        /// Number of matching hosts.
        count: usize,
    },

    /// A live host already uses this name.
    #[error("host name {name} is already in use by {host_id}")]
    NameTaken {
        /// The requested name.
        name: HostName,
        /// The host holding it.
        host_id: HostId,
    },

    /// An agent with this name already exists on the host.
    #[error("agent {agent} already exists on host {host_id} ({host_name})")]
    AgentExists {
        /// The requested name.
        agent: AgentName,
        /// The host.
        host_id: HostId,
        /// Its name.
        host_name: HostName,
    },

    /// No provider instance with this name is configured.
    #[error("unknown provider instance: {0}")]
    UnknownProvider(String),

    /// The requested lifecycle transition is not allowed.
    #[error("host {host_id} ({host_name}): cannot transition from {from} to {to}")]
    InvalidTransition {
        /// The host.
        host_id: HostId,
        /// Its name.
        host_name: HostName,
        /// Current state.
        from: HostState,
        /// Requested state.
        to: HostState,
    },

    /// The operation needs a running host.
    #[error("host {host_id} ({host_name}) is {state}, not running")]
    NotLive {
        /// The host.
        host_id: HostId,
        /// Its name.
        host_name: HostName,
        /// Its current state.
        state: HostState,
    },

    /// The host's provider instance lacks a capability the operation needs.
    #[error("host {host_id} ({host_name}): provider {instance} does not support {operation}")]
    Unsupported {
        /// The host.
        host_id: HostId,
        /// Its name.
        host_name: HostName,
        /// Provider instance name.
        instance: String,
        /// The rejected operation.
        operation: &'static str,
    },

    /// The snapshot is not listed for the host.
    #[error("snapshot {snapshot_id} not found for host {host_id} ({host_name})")]
    SnapshotNotFound {
        /// The snapshot.
        snapshot_id: mng_core::SnapshotId,
        /// The host.
        host_id: HostId,
        /// Its name.
        host_name: HostName,
    },

    /// Host creation failed; a FAILED record was written.
    #[error("creating host {host_id} ({host_name}) on {instance} failed: {reason}")]
    CreateFailed {
        /// The id assigned to the failed host.
        host_id: HostId,
        /// The requested name.
        host_name: HostName,
        /// Provider instance name.
        instance: String,
        /// One-line reason.
        reason: String,
        /// The underlying provider error.
        #[source]
        source: ProviderError,
    },

    /// A provider call for a specific host failed.
    #[error("host {host_id} ({host_name}) on {instance}: {source}")]
    HostOperation {
        /// The host.
        host_id: HostId,
        /// Its name.
        host_name: HostName,
        /// Provider instance name.
        instance: String,
        /// The underlying provider error.
        #[source]
        source: ProviderError,
    },

    /// A provider call not tied to one host failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A provider call did not finish within its budget.
    #[error("host {host_id} ({host_name}): {operation} timed out")]
    Timeout {
        /// The host.
        host_id: HostId,
        /// Its name.
        host_name: HostName,
        /// What was being waited for.
        operation: &'static str,
    },

    /// The per-host lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Durable record store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Core error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Reading a local file failed.
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A registered hook failed.
    #[error("hook {hook} failed: {message}")]
    Hook {
        /// Hook name.
        hook: String,
        /// What went wrong.
        message: String,
    },
}

impl ControlError {
    /// Wrap a provider error raised while operating on one host.
    pub fn host_operation(
        host_id: HostId,
        host_name: &HostName,
        instance: &str,
        source: ProviderError,
    ) -> Self {
        Self::HostOperation {
            host_id,
            host_name: host_name.clone(),
            instance: instance.to_string(),
            source,
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::HostNotFound(_)
            | Self::NotLive { .. }
            | Self::SnapshotNotFound { .. }
            | Self::CreateFailed { .. } => ErrorCategory::HostScoped,
            Self::LookupIncomplete { .. } | Self::Timeout { .. } => ErrorCategory::Transient,
            Self::AgentExists { .. } => ErrorCategory::AgentScoped,
            Self::AmbiguousName { .. }
            | Self::NameTaken { .. }
            | Self::UnknownProvider(_)
            | Self::InvalidTransition { .. }
            | Self::Unsupported { .. }
            | Self::Config(_)
            | Self::ConfigParse(_) => ErrorCategory::Fatal,
            Self::HostOperation { source, .. } | Self::Provider(source) => source.category(),
            Self::Lock(e) => e.category(),
            Self::Store(e) => e.category(),
            Self::Core(e) => e.category(),
            Self::Io { .. } => ErrorCategory::Unexpected,
            Self::Hook { .. } => ErrorCategory::PluginScoped,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Returns true if the user must change configuration to make progress.
    #[must_use]
    pub fn requires_user_fix(&self) -> bool {
        self.category().requires_user_fix()
    }
}
