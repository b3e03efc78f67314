//! Records persisted by the Durable Record Store.
//!
//! Everything here is plain data: records reference each other by id only, so
//! they serialize without cycles and can be re-validated against the backend
//! at any time.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use mng_core::{ActivityConfig, AgentId, AgentName, HostId, HostName, HostState, SnapshotId};
use serde::{Deserialize, Serialize};

/// Host identity and configuration certified at creation time.
///
/// Written to the host as `data.json` and mirrored into the [`DurableRecord`]
/// for backends that need a local fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedHostData {
    /// Immutable host identifier.
    pub host_id: HostId,
    /// Human-chosen name.
    pub host_name: HostName,
    /// Idle-detection configuration.
    #[serde(default)]
    pub activity_config: ActivityConfig,
    /// When the host was created.
    pub created_at: DateTime<Utc>,
    /// Free-form user tags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_tags: BTreeMap<String, String>,
}

impl CertifiedHostData {
    /// Create certified data for a brand new host.
    #[must_use]
    pub fn new(host_id: HostId, host_name: HostName, activity_config: ActivityConfig) -> Self {
        Self {
            host_id,
            host_name,
            activity_config,
            created_at: Utc::now(),
            user_tags: BTreeMap::new(),
        }
    }
}

/// Connection details for hosts reached over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshInfo {
    /// Hostname or address.
    pub address: String,
    /// Port, usually 22.
    #[serde(default = "SshInfo::default_port")]
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Private key, if not using the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

impl SshInfo {
    const fn default_port() -> u16 {
        22
    }

    /// The `user@address` destination string.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// A captured filesystem state of a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Backend-assigned snapshot identifier.
    pub id: SnapshotId,
    /// Human-readable name.
    pub name: String,
    /// The host the snapshot was taken from.
    pub host_id: HostId,
    /// Capture time; listings are ordered by this.
    pub created_at: DateTime<Utc>,
}

/// Why a host failed to come up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// One-line reason.
    pub reason: String,
    /// Whatever build output was captured before the failure.
    #[serde(default)]
    pub build_log: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    /// Create a failure record timestamped now.
    #[must_use]
    pub fn new(reason: impl Into<String>, build_log: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            build_log: build_log.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Local mirror of a host, keyed by `HostId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableRecord {
    /// Certified host data.
    pub certified: CertifiedHostData,
    /// The provider instance that owns the host.
    pub provider_instance_name: String,
    /// Backend-native handle (container id, sandbox id, address).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_ref: Option<String>,
    /// SSH connection details, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshInfo>,
    /// Snapshots in creation order.
    #[serde(default)]
    pub snapshots: Vec<SnapshotRecord>,
    /// Last state this invocation or a previous one observed.
    pub state: HostState,
    /// Present when creation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl DurableRecord {
    /// Create a record in the given state.
    #[must_use]
    pub fn new(
        certified: CertifiedHostData,
        provider_instance_name: impl Into<String>,
        state: HostState,
    ) -> Self {
        Self {
            certified,
            provider_instance_name: provider_instance_name.into(),
            backend_ref: None,
            ssh: None,
            snapshots: Vec::new(),
            state,
            failure: None,
            updated_at: Utc::now(),
        }
    }

    /// The host id.
    #[must_use]
    pub const fn host_id(&self) -> &HostId {
        &self.certified.host_id
    }

    /// The host name.
    #[must_use]
    pub const fn host_name(&self) -> &HostName {
        &self.certified.host_name
    }

    /// Find a snapshot by id.
    #[must_use]
    pub fn snapshot(&self, id: &SnapshotId) -> Option<&SnapshotRecord> {
        self.snapshots.iter().find(|s| &s.id == id)
    }
}

/// Certified data of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Immutable agent identifier.
    pub id: AgentId,
    /// Human-chosen name.
    pub name: AgentName,
    /// Kind of agent, e.g. `claude` or `shell`.
    pub agent_type: String,
    /// Working directory on the host.
    pub work_dir: PathBuf,
    /// Owning host.
    pub host_id: HostId,
    /// When the agent was created.
    pub create_time: DateTime<Utc>,
    /// Granted permissions.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Free-form labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mng_core::IdleMode;

    #[test]
    fn record_serializes_without_optional_fields() {
        let certified = CertifiedHostData::new(
            HostId::generate(),
            "dev".parse().unwrap(),
            ActivityConfig::new(IdleMode::Agent, 60),
        );
        let record = DurableRecord::new(certified, "docker", HostState::Running);
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("backend_ref"));
        assert!(!json.contains("failure"));

        let parsed: DurableRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn ssh_port_defaults() {
        let info: SshInfo =
            serde_json::from_str(r#"{"address":"10.0.0.4","user":"ubuntu"}"#).unwrap();
        assert_eq!(info.port, 22);
        assert_eq!(info.destination(), "ubuntu@10.0.0.4");
    }
}
