//! Pre-existing machines reached over SSH.
//!
//! The machine itself cannot say which mng hosts it carries, so the Durable
//! Record Store is the source of discovery. Each host gets its own data root
//! under `<base_dir>/hosts/<host_id>`. There is no native shutdown and no
//! snapshotting; terminating a host kills its managed sessions.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mng_core::layout::{AGENTS_DIR, WATCHER_PROGRAM};
use mng_core::{ActivitySource, HostId, HostState, SnapshotId};
use mng_store::{DurableRecord, FileStore, SshInfo, Store};
use serde::Deserialize;

use crate::access::{shell_quote, CommandAccess, HostAccess, Transport};
use crate::bootstrap::{ensure_watcher, shutdown_script, touch_marker, write_host_files};
use crate::error::{ProviderError, Result};
use crate::instance::{
    parse_settings, BackendContext, ConfigField, FieldKind, ProviderBackend, ProviderInstance,
};
use crate::types::{CreateHostRequest, ProviderCapabilities, ProviderHost, ResourceDescriptor};

const BACKEND: &str = "ssh";

#[derive(Debug, Deserialize)]
struct SshSettings {
    address: String,
    user: String,
    #[serde(default = "SshSettings::default_port")]
    port: u16,
    #[serde(default)]
    key_path: Option<PathBuf>,
    #[serde(default)]
    base_dir: Option<String>,
}

impl SshSettings {
    const fn default_port() -> u16 {
        22
    }
}

/// Backend for machines reachable over SSH.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshBackend;

impl ProviderBackend for SshBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn description(&self) -> &'static str {
        "Existing machines over SSH; store-backed discovery, no snapshots or native shutdown"
    }

    fn config_schema(&self) -> &'static [ConfigField] {
        &[
            ConfigField {
                name: "address",
                kind: FieldKind::String,
                required: true,
                description: "Hostname or IP address of the machine",
            },
            ConfigField {
                name: "user",
                kind: FieldKind::String,
                required: true,
                description: "Login user",
            },
            ConfigField {
                name: "port",
                kind: FieldKind::Integer,
                required: false,
                description: "SSH port (default: 22)",
            },
            ConfigField {
                name: "key_path",
                kind: FieldKind::Path,
                required: false,
                description: "Private key file; the ssh agent is used when absent",
            },
            ConfigField {
                name: "base_dir",
                kind: FieldKind::Path,
                required: false,
                description: "Directory on the machine holding per-host data roots",
            },
        ]
    }

    fn build(
        &self,
        instance_name: &str,
        settings: &serde_json::Value,
        ctx: &BackendContext,
    ) -> Result<Arc<dyn ProviderInstance>> {
        let settings: SshSettings = parse_settings(instance_name, settings)?;
        if settings.address.trim().is_empty() {
            return Err(ProviderError::config(instance_name, "address must not be empty"));
        }
        Ok(Arc::new(SshProvider {
            instance_name: instance_name.to_string(),
            ssh: SshInfo {
                address: settings.address,
                port: settings.port,
                user: settings.user,
                key_path: settings.key_path,
            },
            base_dir: settings.base_dir.unwrap_or_else(|| ctx.host_dir.clone()),
            prefix: ctx.prefix.clone(),
            store: ctx.store.clone(),
        }))
    }
}

/// Script that kills the tmux session of every agent under `root`.
fn kill_sessions_script(prefix: &str, root: &str) -> String {
    format!(
        "for f in {agents}/*/data.json; do \
           [ -f \"$f\" ] || continue; \
           n=$(sed -n 's/.*\"name\": *\"\\([^\"]*\\)\".*/\\1/p' \"$f\" | head -n1); \
           [ -n \"$n\" ] && tmux kill-session -t \"={prefix}$n\" 2>/dev/null; \
         done; true",
        agents = shell_quote(&format!("{root}/{AGENTS_DIR}")),
        prefix = prefix.replace('"', ""),
    )
}

/// Provider instance for one SSH machine.
#[derive(Debug)]
pub struct SshProvider {
    instance_name: String,
    ssh: SshInfo,
    base_dir: String,
    prefix: String,
    store: Arc<FileStore>,
}

impl SshProvider {
    fn host_root(&self, host_id: &HostId) -> String {
        format!("{}/hosts/{host_id}", self.base_dir.trim_end_matches('/'))
    }

    fn access_for(&self, host_id: &HostId) -> Arc<dyn HostAccess> {
        Arc::new(CommandAccess::new(
            Transport::Ssh(self.ssh.clone()),
            self.host_root(host_id),
        ))
    }

    fn record(&self, host_id: &HostId) -> Result<DurableRecord> {
        self.store
            .get_record(host_id)?
            .filter(|r| r.provider_instance_name == self.instance_name)
            .ok_or_else(|| ProviderError::not_found(&self.instance_name, host_id))
    }

    fn to_host(&self, record: DurableRecord) -> ProviderHost {
        let state = record.state;
        ProviderHost::from_certified(record.certified, state)
            .with_resource(ResourceDescriptor::new(self.ssh.destination()))
    }
}

#[async_trait]
impl ProviderInstance for SshProvider {
    fn name(&self) -> &str {
        &self.instance_name
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::minimal()
    }

    async fn discover_hosts(&self) -> Result<Vec<ProviderHost>> {
        Ok(self
            .store
            .list_records_by_instance(&self.instance_name)?
            .into_iter()
            .filter(|r| r.failure.is_none())
            .map(|r| self.to_host(r))
            .collect())
    }

    async fn get_host(&self, host_id: &HostId) -> Result<Option<ProviderHost>> {
        Ok(self
            .store
            .get_record(host_id)?
            .filter(|r| r.provider_instance_name == self.instance_name && r.failure.is_none())
            .map(|r| self.to_host(r)))
    }

    async fn create_host(&self, request: &CreateHostRequest) -> Result<ProviderHost> {
        let certified = request.certified_data();
        let access = self.access_for(&request.host_id);
        let hook = shutdown_script(&kill_sessions_script(&self.prefix, access.host_dir()));

        if let Err(e) = write_host_files(access.as_ref(), &certified, &hook).await {
            return Err(ProviderError::CreateFailed {
                instance: self.instance_name.clone(),
                host_name: request.host_name.to_string(),
                reason: format!("bootstrapping {} failed", self.ssh.destination()),
                build_log: e.to_string(),
            });
        }
        ensure_watcher(access.as_ref(), WATCHER_PROGRAM).await;

        let mut record = DurableRecord::new(certified, &self.instance_name, HostState::Running);
        record.ssh = Some(self.ssh.clone());
        record.backend_ref = Some(self.ssh.destination());
        self.store.put_record(&record)?;

        tracing::info!(
            host_id = %request.host_id,
            destination = %self.ssh.destination(),
            "Created ssh host"
        );
        Ok(self.to_host(record))
    }

    async fn start_host(
        &self,
        host_id: &HostId,
        snapshot: Option<&SnapshotId>,
    ) -> Result<ProviderHost> {
        if snapshot.is_some() {
            return Err(ProviderError::unsupported(&self.instance_name, "start_host from snapshot"));
        }
        let mut record = self.record(host_id)?;
        let access = self.access_for(host_id);
        touch_marker(access.as_ref(), ActivitySource::Boot).await?;
        ensure_watcher(access.as_ref(), WATCHER_PROGRAM).await;
        record.state = HostState::Running;
        record.updated_at = Utc::now();
        self.store.put_record(&record)?;
        Ok(self.to_host(record))
    }

    async fn terminate_host(&self, host_id: &HostId) -> Result<()> {
        let record = self.record(host_id)?;
        let access = self.access_for(host_id);
        let output = access
            .run(&kill_sessions_script(&self.prefix, access.host_dir()), None)
            .await?;
        if !output.success() {
            tracing::warn!(host_id = %host_id, stderr = %output.stderr, "Killing sessions reported an error");
        }
        self.store.update_state(record.host_id(), HostState::Stopped)?;
        Ok(())
    }

    async fn destroy_host(&self, host_id: &HostId, _delete_snapshots: bool) -> Result<()> {
        let access = self.access_for(host_id);
        let root = shell_quote(access.host_dir());
        let script = format!("{}; rm -rf {root}", kill_sessions_script(&self.prefix, access.host_dir()));
        match access.run(&script, None).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                tracing::warn!(host_id = %host_id, stderr = %output.stderr, "Removing host data root failed");
            }
            Err(e) => tracing::warn!(host_id = %host_id, error = %e, "Machine unreachable during destroy"),
        }
        match self.store.delete_record(host_id) {
            Ok(()) | Err(mng_store::StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn host_access(&self, host_id: &HostId) -> Result<Arc<dyn HostAccess>> {
        self.record(host_id)?;
        Ok(self.access_for(host_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mng_core::ActivityConfig;
    use mng_store::{CertifiedHostData, LockConfig};
    use tempfile::TempDir;

    fn provider() -> (SshProvider, TempDir) {
        let dir = TempDir::new().unwrap();
        let ctx = BackendContext {
            store: Arc::new(FileStore::open(dir.path(), LockConfig::default()).unwrap()),
            prefix: "mng-".into(),
            host_dir: "/srv/mng".into(),
        };
        let settings = serde_json::json!({"address": "10.0.0.5", "user": "ubuntu"});
        let settings: SshSettings = parse_settings("ssh", &settings).unwrap();
        let provider = SshProvider {
            instance_name: "ssh".into(),
            ssh: SshInfo {
                address: settings.address,
                port: settings.port,
                user: settings.user,
                key_path: None,
            },
            base_dir: ctx.host_dir.clone(),
            prefix: ctx.prefix.clone(),
            store: ctx.store,
        };
        (provider, dir)
    }

    #[tokio::test]
    async fn discovery_comes_from_records() {
        let (provider, _dir) = provider();
        let certified = CertifiedHostData::new(
            HostId::generate(),
            "remote".parse().unwrap(),
            ActivityConfig::default(),
        );
        let host_id = certified.host_id;
        provider
            .store
            .put_record(&DurableRecord::new(certified, "ssh", HostState::Stopped))
            .unwrap();
        provider
            .store
            .put_record(&DurableRecord::new(
                CertifiedHostData::new(HostId::generate(), "other".parse().unwrap(), ActivityConfig::default()),
                "another-instance",
                HostState::Running,
            ))
            .unwrap();

        let hosts = provider.discover_hosts().await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].id, host_id);
        assert_eq!(hosts[0].state, HostState::Stopped);
        assert_eq!(
            hosts[0].resource.as_ref().unwrap().backend_ref,
            "ubuntu@10.0.0.5"
        );
    }

    #[test]
    fn per_host_roots() {
        let (provider, _dir) = provider();
        let id = HostId::from_bytes([7u8; 16]);
        assert_eq!(provider.host_root(&id), format!("/srv/mng/hosts/{id}"));
        assert!(!provider.capabilities().supports_snapshots);
    }

    #[test]
    fn kill_script_targets_prefixed_sessions() {
        let script = kill_sessions_script("mng-", "/srv/mng/hosts/h");
        assert!(script.contains("'/srv/mng/hosts/h/agents'/*/data.json"));
        assert!(script.contains("tmux kill-session -t \"=mng-$n\""));
    }

    #[test]
    fn missing_address_is_config_error() {
        let dir = TempDir::new().unwrap();
        let ctx = BackendContext {
            store: Arc::new(FileStore::open(dir.path(), LockConfig::default()).unwrap()),
            prefix: "mng-".into(),
            host_dir: "/mng".into(),
        };
        let err = SshBackend
            .build("ssh", &serde_json::json!({"user": "root"}), &ctx)
            .err()
            .unwrap();
        assert!(err.category().requires_user_fix());
    }
}
