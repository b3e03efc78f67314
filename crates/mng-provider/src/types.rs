//! Types exchanged between provider instances and the control layer.

use std::collections::BTreeMap;

use mng_core::{ActivityConfig, HostId, HostName, HostState};
use mng_store::{CertifiedHostData, FailureRecord};
use serde::{Deserialize, Serialize};

/// What a provider instance can do.
///
/// The control layer consults these flags before every capability-gated
/// operation and substitutes an equivalent sequence when one is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ProviderCapabilities {
    /// Hosts can be stopped and started without losing the backing resource.
    pub supports_shutdown_hosts: bool,
    /// Snapshots can be captured and restored.
    pub supports_snapshots: bool,
    /// Snapshot backing storage can be deleted explicitly.
    pub supports_snapshot_deletion: bool,
    /// Paused hosts can be resumed in place.
    pub supports_resume: bool,
    /// Hosts can be destroyed at all.
    pub can_destroy: bool,
}

impl ProviderCapabilities {
    /// Capabilities of a backend that can do nothing beyond running commands.
    #[must_use]
    pub const fn minimal() -> Self {
        Self {
            supports_shutdown_hosts: false,
            supports_snapshots: false,
            supports_snapshot_deletion: false,
            supports_resume: false,
            can_destroy: true,
        }
    }
}

/// The backing resource of a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Base image, when the backend uses one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// CPU allocation in millicores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_millicores: Option<u32>,
    /// Memory allocation in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    /// Backend-native handle: container id, sandbox id, or SSH address.
    pub backend_ref: String,
}

impl ResourceDescriptor {
    /// A descriptor holding only the native handle.
    #[must_use]
    pub fn new(backend_ref: impl Into<String>) -> Self {
        Self {
            image: None,
            cpu_millicores: None,
            memory_mb: None,
            backend_ref: backend_ref.into(),
        }
    }
}

/// Build parameters for a new host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Base image; backends fall back to their configured default.
    #[serde(default)]
    pub image: Option<String>,
    /// CPU allocation in millicores.
    #[serde(default)]
    pub cpu_millicores: Option<u32>,
    /// Memory allocation in megabytes.
    #[serde(default)]
    pub memory_mb: Option<u32>,
    /// Idle-detection configuration certified into the host.
    #[serde(default)]
    pub activity_config: ActivityConfig,
    /// Free-form user tags.
    #[serde(default)]
    pub user_tags: BTreeMap<String, String>,
}

/// A request to allocate a new host.
#[derive(Debug, Clone)]
pub struct CreateHostRequest {
    /// Pre-assigned id.
    pub host_id: HostId,
    /// Requested name.
    pub host_name: HostName,
    /// Build parameters.
    pub build: BuildConfig,
}

impl CreateHostRequest {
    /// The certified data this request will write to the host.
    #[must_use]
    pub fn certified_data(&self) -> CertifiedHostData {
        let mut certified = CertifiedHostData::new(
            self.host_id,
            self.host_name.clone(),
            self.build.activity_config.clone(),
        );
        certified.user_tags.clone_from(&self.build.user_tags);
        certified
    }
}

/// One host as a provider instance currently sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderHost {
    /// Host id.
    pub id: HostId,
    /// Host name.
    pub name: HostName,
    /// Observed lifecycle state.
    pub state: HostState,
    /// Certified data, if it could be read.
    pub certified: Option<CertifiedHostData>,
    /// Backing resource, if one currently exists.
    pub resource: Option<ResourceDescriptor>,
    /// Creation failure, if creation failed.
    pub failure: Option<FailureRecord>,
}

impl ProviderHost {
    /// A host built from its certified data.
    #[must_use]
    pub fn from_certified(certified: CertifiedHostData, state: HostState) -> Self {
        Self {
            id: certified.host_id,
            name: certified.host_name.clone(),
            state,
            certified: Some(certified),
            resource: None,
            failure: None,
        }
    }

    /// Attach a backing resource.
    #[must_use]
    pub fn with_resource(mut self, resource: ResourceDescriptor) -> Self {
        self.resource = Some(resource);
        self
    }
}
