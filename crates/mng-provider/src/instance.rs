//! The provider abstraction: backends build instances, instances own hosts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mng_core::{HostId, SnapshotId};
use mng_store::{FileStore, SnapshotRecord};
use serde::Serialize;

use crate::access::HostAccess;
use crate::error::{ProviderError, Result};
use crate::types::{CreateHostRequest, ProviderCapabilities, ProviderHost};

/// A configured provider instance.
///
/// Only the instance that created a host may mutate its backing resource.
/// Operations a backend cannot perform default to
/// [`ProviderError::Unsupported`]; callers check [`Self::capabilities`]
/// first.
#[async_trait]
pub trait ProviderInstance: Send + Sync {
    /// Instance name from configuration.
    fn name(&self) -> &str;

    /// Name of the backend that built this instance.
    fn backend_name(&self) -> &'static str;

    /// What this instance can do.
    fn capabilities(&self) -> ProviderCapabilities;

    /// List every managed host this instance owns.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn discover_hosts(&self) -> Result<Vec<ProviderHost>>;

    /// Look up one host.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn get_host(&self, host_id: &HostId) -> Result<Option<ProviderHost>> {
        Ok(self
            .discover_hosts()
            .await?
            .into_iter()
            .find(|host| &host.id == host_id))
    }

    /// Allocate and bootstrap a new host.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::CreateFailed` carrying the build log on failure.
    async fn create_host(&self, request: &CreateHostRequest) -> Result<ProviderHost>;

    /// Stop a host natively, keeping its backing resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be stopped.
    async fn stop_host(&self, host_id: &HostId, timeout: Duration) -> Result<()> {
        let _ = (host_id, timeout);
        Err(ProviderError::unsupported(self.name(), "stop_host"))
    }

    /// Resume a paused host in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be resumed.
    async fn resume_host(&self, host_id: &HostId) -> Result<()> {
        let _ = host_id;
        Err(ProviderError::unsupported(self.name(), "resume_host"))
    }

    /// Bring a stopped host back, optionally from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be started.
    async fn start_host(
        &self,
        host_id: &HostId,
        snapshot: Option<&SnapshotId>,
    ) -> Result<ProviderHost>;

    /// Release the backing resource while keeping the host's identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource cannot be released.
    async fn terminate_host(&self, host_id: &HostId) -> Result<()>;

    /// Release everything the instance holds for a host.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be destroyed.
    async fn destroy_host(&self, host_id: &HostId, delete_snapshots: bool) -> Result<()>;

    /// Capture a crash-consistent snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the capture fails.
    async fn create_snapshot(&self, host_id: &HostId, name: &str) -> Result<SnapshotRecord> {
        let _ = (host_id, name);
        Err(ProviderError::unsupported(self.name(), "create_snapshot"))
    }

    /// List snapshots of a host in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    async fn list_snapshots(&self, host_id: &HostId) -> Result<Vec<SnapshotRecord>> {
        let _ = host_id;
        Ok(Vec::new())
    }

    /// Remove a snapshot from the listing; returns whether backing storage
    /// was deleted too.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be removed.
    async fn delete_snapshot(&self, host_id: &HostId, snapshot_id: &SnapshotId) -> Result<bool> {
        let _ = (host_id, snapshot_id);
        Err(ProviderError::unsupported(self.name(), "delete_snapshot"))
    }

    /// A handle for reading, writing, and executing on a live host.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is unknown or not live.
    async fn host_access(&self, host_id: &HostId) -> Result<Arc<dyn HostAccess>>;
}

/// Kind of a backend configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Free text.
    String,
    /// Unsigned integer.
    Integer,
    /// `true` / `false`.
    Bool,
    /// Filesystem path.
    Path,
}

/// One typed field of a backend's settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfigField {
    /// Key in the instance settings table.
    pub name: &'static str,
    /// Value type.
    pub kind: FieldKind,
    /// Whether the field must be present.
    pub required: bool,
    /// Help text.
    pub description: &'static str,
}

/// Shared services handed to every backend at build time.
#[derive(Debug, Clone)]
pub struct BackendContext {
    /// Durable Record Store for backends that cannot enumerate hosts natively.
    pub store: Arc<FileStore>,
    /// Reserved name prefix marking managed resources.
    pub prefix: String,
    /// Default host data root inside sandboxes.
    pub host_dir: String,
}

/// A factory for provider instances.
pub trait ProviderBackend: Send + Sync {
    /// Unique backend name referenced by configuration.
    fn name(&self) -> &'static str;

    /// One-line description.
    fn description(&self) -> &'static str;

    /// Settings accepted by [`Self::build`].
    fn config_schema(&self) -> &'static [ConfigField];

    /// Build a named instance from its settings.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` if the settings are invalid.
    fn build(
        &self,
        instance_name: &str,
        settings: &serde_json::Value,
        ctx: &BackendContext,
    ) -> Result<Arc<dyn ProviderInstance>>;
}

/// Ordered table of known backends, populated once at startup.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn ProviderBackend>>,
}

impl BackendRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in backends: local, docker, ssh, cloud.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::local::LocalBackend));
        registry.register(Arc::new(crate::docker::DockerBackend));
        registry.register(Arc::new(crate::ssh::SshBackend));
        registry.register(Arc::new(crate::cloud::CloudBackend));
        registry
    }

    /// Add a backend; a later registration with the same name replaces it.
    pub fn register(&mut self, backend: Arc<dyn ProviderBackend>) {
        self.backends.retain(|b| b.name() != backend.name());
        self.backends.push(backend);
    }

    /// Look up a backend by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ProviderBackend>> {
        self.backends.iter().find(|b| b.name() == name)
    }

    /// Registered backend names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

/// Deserialize typed settings, treating a missing table as empty.
pub(crate) fn parse_settings<T: serde::de::DeserializeOwned>(
    instance_name: &str,
    settings: &serde_json::Value,
) -> Result<T> {
    let value = if settings.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        settings.clone()
    };
    serde_json::from_value(value).map_err(|e| ProviderError::config(instance_name, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_order() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["local", "docker", "ssh", "cloud"]);
        assert!(registry.get("docker").is_some());
        assert!(registry.get("k8s").is_none());
    }

    #[test]
    fn every_builtin_documents_its_settings() {
        let registry = BackendRegistry::with_builtin();
        for name in registry.names() {
            let backend = registry.get(name).unwrap();
            assert!(!backend.description().is_empty());
            for field in backend.config_schema() {
                assert!(!field.description.is_empty(), "{name}.{}", field.name);
            }
        }
    }

    #[test]
    fn null_settings_parse_as_empty() {
        #[derive(serde::Deserialize)]
        struct Settings {
            #[serde(default)]
            image: Option<String>,
        }
        let parsed: Settings = parse_settings("x", &serde_json::Value::Null).unwrap();
        assert!(parsed.image.is_none());
        let err = parse_settings::<Settings>("x", &serde_json::json!({"image": 3}));
        assert!(err.is_err());
    }
}
