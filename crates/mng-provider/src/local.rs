//! The local machine as a single, permanent host.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use mng_core::{HostId, HostName, HostState, SnapshotId};
use serde::Deserialize;

use crate::access::{HostAccess, LocalAccess};
use crate::bootstrap::{read_certified, shutdown_script, write_host_files};
use crate::error::{ProviderError, Result};
use crate::instance::{
    parse_settings, BackendContext, ConfigField, FieldKind, ProviderBackend, ProviderInstance,
};
use crate::types::{
    BuildConfig, CreateHostRequest, ProviderCapabilities, ProviderHost, ResourceDescriptor,
};

const BACKEND: &str = "local";

#[derive(Debug, Deserialize)]
struct LocalSettings {
    host_dir: PathBuf,
    #[serde(default = "LocalSettings::default_host_name")]
    host_name: String,
}

impl LocalSettings {
    fn default_host_name() -> String {
        "localhost".to_string()
    }
}

/// Backend for the machine mng itself runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

impl ProviderBackend for LocalBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn description(&self) -> &'static str {
        "The local machine as a single host; no snapshots, never stopped or destroyed"
    }

    fn config_schema(&self) -> &'static [ConfigField] {
        &[
            ConfigField {
                name: "host_dir",
                kind: FieldKind::Path,
                required: true,
                description: "Directory used as the local host data root",
            },
            ConfigField {
                name: "host_name",
                kind: FieldKind::String,
                required: false,
                description: "Name reported for the local host (default: localhost)",
            },
        ]
    }

    fn build(
        &self,
        instance_name: &str,
        settings: &serde_json::Value,
        _ctx: &BackendContext,
    ) -> Result<Arc<dyn ProviderInstance>> {
        let settings: LocalSettings = parse_settings(instance_name, settings)?;
        let host_name = HostName::new(settings.host_name)
            .map_err(|e| ProviderError::config(instance_name, e.to_string()))?;
        Ok(Arc::new(LocalProvider::new(
            instance_name,
            settings.host_dir,
            host_name,
        )))
    }
}

/// The local host provider.
///
/// The host's identity is created lazily the first time it is discovered and
/// then read back from `data.json` on every call.
#[derive(Debug)]
pub struct LocalProvider {
    instance_name: String,
    access: Arc<LocalAccess>,
    host_name: HostName,
}

impl LocalProvider {
    /// Create a provider rooted at `host_dir`.
    #[must_use]
    pub fn new(instance_name: &str, host_dir: impl Into<PathBuf>, host_name: HostName) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            access: Arc::new(LocalAccess::new(host_dir)),
            host_name,
        }
    }

    async fn ensure_host(&self) -> Result<ProviderHost> {
        let certified = match read_certified(self.access.as_ref()).await? {
            Some(certified) => certified,
            None => {
                let request = CreateHostRequest {
                    host_id: HostId::generate(),
                    host_name: self.host_name.clone(),
                    build: BuildConfig::default(),
                };
                let certified = request.certified_data();
                write_host_files(
                    self.access.as_ref(),
                    &certified,
                    &shutdown_script("# the local host is never stopped by the idle watcher\nexit 0"),
                )
                .await?;
                tracing::info!(
                    host_id = %certified.host_id,
                    host_dir = %self.access.root().display(),
                    "Initialized local host"
                );
                certified
            }
        };

        let backend_ref = self.access.root().to_string_lossy().into_owned();
        Ok(ProviderHost::from_certified(certified, HostState::Running)
            .with_resource(ResourceDescriptor::new(backend_ref)))
    }

    async fn check_id(&self, host_id: &HostId) -> Result<ProviderHost> {
        let host = self.ensure_host().await?;
        if &host.id == host_id {
            Ok(host)
        } else {
            Err(ProviderError::not_found(&self.instance_name, host_id))
        }
    }
}

#[async_trait]
impl ProviderInstance for LocalProvider {
    fn name(&self) -> &str {
        &self.instance_name
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            can_destroy: false,
            ..ProviderCapabilities::minimal()
        }
    }

    async fn discover_hosts(&self) -> Result<Vec<ProviderHost>> {
        Ok(vec![self.ensure_host().await?])
    }

    async fn create_host(&self, _request: &CreateHostRequest) -> Result<ProviderHost> {
        Err(ProviderError::unsupported(&self.instance_name, "create_host"))
    }

    async fn start_host(
        &self,
        host_id: &HostId,
        snapshot: Option<&SnapshotId>,
    ) -> Result<ProviderHost> {
        if snapshot.is_some() {
            return Err(ProviderError::unsupported(&self.instance_name, "start_host from snapshot"));
        }
        self.check_id(host_id).await
    }

    async fn terminate_host(&self, _host_id: &HostId) -> Result<()> {
        Err(ProviderError::unsupported(&self.instance_name, "terminate_host"))
    }

    async fn destroy_host(&self, _host_id: &HostId, _delete_snapshots: bool) -> Result<()> {
        Err(ProviderError::unsupported(&self.instance_name, "destroy_host"))
    }

    async fn host_access(&self, host_id: &HostId) -> Result<Arc<dyn HostAccess>> {
        self.check_id(host_id).await?;
        Ok(self.access.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider() -> (LocalProvider, TempDir) {
        let dir = TempDir::new().unwrap();
        let provider = LocalProvider::new("local", dir.path(), "laptop".parse().unwrap());
        (provider, dir)
    }

    #[tokio::test]
    async fn identity_is_stable_across_discoveries() {
        let (provider, dir) = provider();
        let first = provider.discover_hosts().await.unwrap();
        let second = provider.discover_hosts().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[0].state, HostState::Running);
        assert!(dir.path().join("data.json").exists());
    }

    #[tokio::test]
    async fn local_host_cannot_be_destroyed() {
        let (provider, _dir) = provider();
        let host = provider.discover_hosts().await.unwrap().remove(0);
        assert!(!provider.capabilities().can_destroy);
        let err = provider.destroy_host(&host.id, false).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let (provider, _dir) = provider();
        let err = provider.host_access(&HostId::generate()).await.err().unwrap();
        assert!(err.is_not_found());
    }
}
