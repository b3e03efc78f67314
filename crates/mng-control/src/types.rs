//! Host and agent views returned by the control layer.
//!
//! Views are plain data re-derived from provider instances on every call.
//! They reference each other by id only; use the accessors on
//! [`InvocationContext`](crate::InvocationContext) to traverse.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use mng_core::{
    ActivityConfig, AgentId, AgentName, AgentObservedState, ErrorCategory, HostId, HostName,
    HostState,
};
use mng_provider::{ProviderHost, ResourceDescriptor};
use mng_store::{AgentRecord, DurableRecord, FailureRecord};
use serde::{Deserialize, Serialize};

/// A reachable host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Host {
    /// Host id.
    pub id: HostId,
    /// Host name.
    pub name: HostName,
    /// Owning provider instance.
    pub provider_instance_name: String,
    /// Lifecycle state.
    pub state: HostState,
    /// Certified idle configuration.
    pub activity_config: ActivityConfig,
    /// Backing resource.
    pub resource: Option<ResourceDescriptor>,
    /// When the host was created.
    pub created_at: DateTime<Utc>,
    /// Free-form user tags.
    pub user_tags: BTreeMap<String, String>,
}

/// A host that exists but cannot be reached right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfflineHost {
    /// Host id.
    pub id: HostId,
    /// Host name.
    pub name: HostName,
    /// Owning provider instance.
    pub provider_instance_name: String,
    /// Lifecycle state.
    pub state: HostState,
    /// Certified idle configuration, when known.
    pub activity_config: Option<ActivityConfig>,
    /// Creation time, when known.
    pub created_at: Option<DateTime<Utc>>,
    /// Why creation failed, for FAILED hosts.
    pub failure: Option<FailureRecord>,
}

/// What discovery reports for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostView {
    /// The host is running and its certified data was read.
    Online(Host),
    /// The host exists but is not reachable.
    Offline(OfflineHost),
}

impl HostView {
    /// Build a view from what a provider instance reported.
    ///
    /// A host is online only if it is running and its certified data is known.
    #[must_use]
    pub fn from_provider(instance: &str, host: ProviderHost) -> Self {
        match host.certified {
            Some(certified) if host.state.is_live() => Self::Online(Host {
                id: host.id,
                name: host.name,
                provider_instance_name: instance.to_string(),
                state: host.state,
                activity_config: certified.activity_config,
                resource: host.resource,
                created_at: certified.created_at,
                user_tags: certified.user_tags,
            }),
            certified => Self::Offline(OfflineHost {
                id: host.id,
                name: host.name,
                provider_instance_name: instance.to_string(),
                state: host.state,
                created_at: certified.as_ref().map(|c| c.created_at),
                activity_config: certified.map(|c| c.activity_config),
                failure: host.failure,
            }),
        }
    }

    /// Build an offline view from a durable record, e.g. a FAILED creation.
    #[must_use]
    pub fn from_record(record: &DurableRecord) -> Self {
        Self::Offline(OfflineHost {
            id: *record.host_id(),
            name: record.host_name().clone(),
            provider_instance_name: record.provider_instance_name.clone(),
            state: record.state,
            activity_config: Some(record.certified.activity_config.clone()),
            created_at: Some(record.certified.created_at),
            failure: record.failure.clone(),
        })
    }

    /// Host id.
    #[must_use]
    pub const fn id(&self) -> &HostId {
        match self {
            Self::Online(h) => &h.id,
            Self::Offline(h) => &h.id,
        }
    }

    /// Host name.
    #[must_use]
    pub const fn name(&self) -> &HostName {
        match self {
            Self::Online(h) => &h.name,
            Self::Offline(h) => &h.name,
        }
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> HostState {
        match self {
            Self::Online(h) => h.state,
            Self::Offline(h) => h.state,
        }
    }

    /// Owning provider instance.
    #[must_use]
    pub fn provider_instance_name(&self) -> &str {
        match self {
            Self::Online(h) => &h.provider_instance_name,
            Self::Offline(h) => &h.provider_instance_name,
        }
    }

    /// The online host, if reachable.
    #[must_use]
    pub const fn as_online(&self) -> Option<&Host> {
        match self {
            Self::Online(h) => Some(h),
            Self::Offline(_) => None,
        }
    }

    /// Return a copy reporting `state`, dropping the live parts if it is no
    /// longer live.
    #[must_use]
    pub fn with_state(self, state: HostState) -> Self {
        match self {
            Self::Online(h) if state.is_live() => Self::Online(Host { state, ..h }),
            Self::Online(h) => Self::Offline(OfflineHost {
                id: h.id,
                name: h.name,
                provider_instance_name: h.provider_instance_name,
                state,
                activity_config: Some(h.activity_config),
                created_at: Some(h.created_at),
                failure: None,
            }),
            Self::Offline(h) => Self::Offline(OfflineHost { state, ..h }),
        }
    }
}

/// A provider instance that failed during a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceError {
    /// Provider instance name.
    pub instance: String,
    /// Error classification.
    pub category: ErrorCategory,
    /// Human-readable message.
    pub message: String,
}

/// Result of `list_hosts`: everything found plus every instance that failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostListing {
    /// Hosts, ordered by provider instance order, then name, then id.
    pub hosts: Vec<HostView>,
    /// One entry per instance whose discovery failed.
    pub errors: Vec<InstanceError>,
}

/// An agent with its computed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Agent {
    /// Agent id.
    pub id: AgentId,
    /// Agent name, unique on its host.
    pub name: AgentName,
    /// Agent type, e.g. the program it runs.
    pub agent_type: String,
    /// Working directory on the host.
    pub work_dir: PathBuf,
    /// Owning host.
    pub host_id: HostId,
    /// When the agent was created.
    pub create_time: DateTime<Utc>,
    /// Granted permissions.
    pub permissions: Vec<String>,
    /// Free-form labels.
    pub labels: BTreeMap<String, String>,
    /// Observed state, computed on this query.
    pub state: AgentObservedState,
}

impl Agent {
    /// Attach an observed state to a stored agent record.
    #[must_use]
    pub fn from_record(record: AgentRecord, state: AgentObservedState) -> Self {
        Self {
            id: record.id,
            name: record.name,
            agent_type: record.agent_type,
            work_dir: record.work_dir,
            host_id: record.host_id,
            create_time: record.create_time,
            permissions: record.permissions,
            labels: record.labels,
            state,
        }
    }
}

/// Parameters for registering a new agent on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAgent {
    /// Agent name, unique on the host.
    pub name: AgentName,
    /// Agent type.
    pub agent_type: String,
    /// Working directory on the host.
    pub work_dir: PathBuf,
    /// Granted permissions.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Free-form labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Outcome of `stop_host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The host is now stopped.
    Stopped(HostView),
    /// The host was already destroyed; nothing was done.
    AlreadyGone,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mng_store::CertifiedHostData;

    fn provider_host(state: HostState, certified: bool) -> ProviderHost {
        let data = CertifiedHostData::new(
            HostId::generate(),
            "box".parse().unwrap(),
            ActivityConfig::default(),
        );
        let mut host = ProviderHost::from_certified(data, state);
        if !certified {
            host.certified = None;
        }
        host
    }

    #[test]
    fn running_host_with_data_is_online() {
        let view = HostView::from_provider("docker", provider_host(HostState::Running, true));
        assert!(view.as_online().is_some());
        assert_eq!(view.provider_instance_name(), "docker");
    }

    #[test]
    fn stopped_or_unreadable_hosts_are_offline() {
        let stopped = HostView::from_provider("docker", provider_host(HostState::Stopped, true));
        assert!(stopped.as_online().is_none());
        assert_eq!(stopped.state(), HostState::Stopped);

        let unreadable = HostView::from_provider("docker", provider_host(HostState::Running, false));
        assert!(unreadable.as_online().is_none());
    }

    #[test]
    fn with_state_drops_online_view() {
        let view = HostView::from_provider("m", provider_host(HostState::Running, true));
        let stopped = view.with_state(HostState::Stopped);
        assert!(matches!(stopped, HostView::Offline(ref h) if h.activity_config.is_some()));
    }
}
