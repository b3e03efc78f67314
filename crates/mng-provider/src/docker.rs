//! Docker containers as hosts, driven through the `docker` CLI.
//!
//! Managed containers carry the reserved name prefix and the `mng.managed`,
//! `mng.host_id`, and `mng.instance` labels; anything else is ignored.
//! Snapshots are `docker commit` images labelled with the host id. Certified
//! data is mirrored into the Durable Record Store so a host whose container
//! was removed stays discoverable and restorable from its snapshots.
//!
//! The container's main process exits with [`IDLE_EXIT_CODE`] when the idle
//! hook signals it, and an exited container with that code is reported as
//! PAUSED rather than STOPPED; resuming it is a plain `docker start`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mng_core::layout::WATCHER_PROGRAM;
use mng_core::{ActivitySource, HostId, HostState, SnapshotId};
use mng_store::{CertifiedHostData, DurableRecord, SnapshotRecord, Store};
use serde::Deserialize;

use crate::access::{ensure_success, run_process, CommandAccess, HostAccess, Transport};
use crate::bootstrap::{
    ensure_watcher, read_certified, shutdown_script, touch_marker, write_host_files,
};
use crate::error::{ProviderError, Result};
use crate::instance::{
    parse_settings, BackendContext, ConfigField, FieldKind, ProviderBackend, ProviderInstance,
};
use crate::types::{CreateHostRequest, ProviderCapabilities, ProviderHost, ResourceDescriptor};

const BACKEND: &str = "docker";

/// Label marking a managed container or snapshot image.
pub const LABEL_MANAGED: &str = "mng.managed";
/// Label carrying the host id.
pub const LABEL_HOST_ID: &str = "mng.host_id";
/// Label carrying the host name.
pub const LABEL_HOST_NAME: &str = "mng.host_name";
/// Label carrying the owning instance name.
pub const LABEL_INSTANCE: &str = "mng.instance";
/// Label carrying a snapshot's human name.
pub const LABEL_SNAPSHOT_NAME: &str = "mng.snapshot_name";

/// Exit status of a container whose idle hook fired.
pub const IDLE_EXIT_CODE: i32 = 75;

/// Main process of every managed container: idle on `USR1`, plain stop on `TERM`.
const CONTAINER_MAIN: &str =
    "trap 'exit 75' USR1; trap 'exit 0' TERM; while :; do sleep 3600 & wait $!; done";

/// Shutdown hook body; `--init` forwards the signal to the main process.
const IDLE_HOOK: &str = "kill -USR1 1";

#[derive(Debug, Deserialize)]
struct DockerSettings {
    #[serde(default = "DockerSettings::default_image")]
    image: String,
    #[serde(default = "DockerSettings::default_binary")]
    docker_binary: String,
    #[serde(default)]
    host_dir: Option<String>,
    #[serde(default)]
    network: Option<String>,
}

impl DockerSettings {
    fn default_image() -> String {
        "debian:bookworm-slim".to_string()
    }

    fn default_binary() -> String {
        "docker".to_string()
    }
}

/// Backend for local Docker containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerBackend;

impl ProviderBackend for DockerBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn description(&self) -> &'static str {
        "Docker containers with native stop/start and commit-based snapshots"
    }

    fn config_schema(&self) -> &'static [ConfigField] {
        &[
            ConfigField {
                name: "image",
                kind: FieldKind::String,
                required: false,
                description: "Default base image for new hosts",
            },
            ConfigField {
                name: "docker_binary",
                kind: FieldKind::Path,
                required: false,
                description: "docker (or compatible) executable",
            },
            ConfigField {
                name: "host_dir",
                kind: FieldKind::Path,
                required: false,
                description: "Host data root inside containers",
            },
            ConfigField {
                name: "network",
                kind: FieldKind::String,
                required: false,
                description: "Docker network to attach new containers to",
            },
        ]
    }

    fn build(
        &self,
        instance_name: &str,
        settings: &serde_json::Value,
        ctx: &BackendContext,
    ) -> Result<Arc<dyn ProviderInstance>> {
        let settings: DockerSettings = parse_settings(instance_name, settings)?;
        Ok(Arc::new(DockerProvider {
            instance_name: instance_name.to_string(),
            host_dir: settings.host_dir.unwrap_or_else(|| ctx.host_dir.clone()),
            prefix: ctx.prefix.clone(),
            image: settings.image,
            network: settings.network,
            binary: settings.docker_binary,
            store: ctx.store.clone(),
        }))
    }
}

/// One row of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

impl PsRow {
    fn host_state(&self) -> HostState {
        map_state(&self.state, &self.status)
    }

    /// Frozen with `docker pause` rather than exited after an idle hook.
    fn is_frozen(&self) -> bool {
        self.state == "paused"
    }

    fn labels(&self) -> BTreeMap<&str, &str> {
        self.labels
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect()
    }
}

/// Map a docker container state and status line to a host state.
fn map_state(state: &str, status: &str) -> HostState {
    match state {
        "running" => HostState::Running,
        "paused" => HostState::Paused,
        "exited" if exit_code(status) == Some(IDLE_EXIT_CODE) => HostState::Paused,
        "created" | "restarting" => HostState::Starting,
        "removing" => HostState::Stopping,
        "dead" => HostState::Crashed,
        _ => HostState::Stopped,
    }
}

/// Exit code from a status such as `Exited (75) 3 minutes ago`.
fn exit_code(status: &str) -> Option<i32> {
    let rest = status.strip_prefix("Exited (")?;
    rest.split_once(')')?.0.parse().ok()
}

fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Provider instance for Docker.
#[derive(Debug)]
pub struct DockerProvider {
    instance_name: String,
    host_dir: String,
    prefix: String,
    image: String,
    network: Option<String>,
    binary: String,
    store: Arc<mng_store::FileStore>,
}

impl DockerProvider {
    async fn docker(&self, args: Vec<String>) -> Result<String> {
        let output = run_process(&self.binary, &args, None, None).await?;
        ensure_success(&self.binary, &args.join(" "), output).map(|o| o.stdout_lossy())
    }

    fn container_name(&self, certified: &CertifiedHostData) -> String {
        format!("{}{}", self.prefix, certified.host_name)
    }

    fn access_for(&self, container: &str) -> Arc<dyn HostAccess> {
        Arc::new(CommandAccess::new(
            Transport::Docker {
                binary: self.binary.clone(),
                container: container.to_string(),
            },
            self.host_dir.clone(),
        ))
    }

    async fn list_containers(&self, host_id: Option<&HostId>) -> Result<Vec<PsRow>> {
        let mut args = argv(&["ps", "-a", "--no-trunc", "--format", "{{json .}}"]);
        args.push("--filter".into());
        args.push(format!("label={LABEL_MANAGED}=true"));
        args.push("--filter".into());
        args.push(format!("label={LABEL_INSTANCE}={}", self.instance_name));
        if let Some(host_id) = host_id {
            args.push("--filter".into());
            args.push(format!("label={LABEL_HOST_ID}={host_id}"));
        }

        let stdout = self.docker(args).await?;
        let mut rows = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let row: PsRow = serde_json::from_str(line)?;
            if row.names.trim_start_matches('/').starts_with(&self.prefix) {
                rows.push(row);
            } else {
                tracing::debug!(container = %row.names, "Ignoring container without mng prefix");
            }
        }
        Ok(rows)
    }

    async fn container_for(&self, host_id: &HostId) -> Result<Option<PsRow>> {
        Ok(self.list_containers(Some(host_id)).await?.into_iter().next())
    }

    fn record(&self, host_id: &HostId) -> Result<DurableRecord> {
        self.store
            .get_record(host_id)?
            .filter(|r| r.provider_instance_name == self.instance_name)
            .ok_or_else(|| ProviderError::not_found(&self.instance_name, host_id))
    }

    async fn host_from_row(&self, row: &PsRow) -> Result<Option<ProviderHost>> {
        let labels = row.labels();
        let Some(host_id) = labels.get(LABEL_HOST_ID).and_then(|v| v.parse::<HostId>().ok()) else {
            return Ok(None);
        };
        let state = row.host_state();

        let certified = match self.store.get_record(&host_id)? {
            Some(record) => Some(record.certified),
            None if state == HostState::Running => {
                read_certified(self.access_for(&row.id).as_ref()).await?
            }
            None => None,
        };

        let host = match certified {
            Some(certified) => ProviderHost::from_certified(certified, state),
            None => {
                let Some(name) = labels
                    .get(LABEL_HOST_NAME)
                    .and_then(|v| v.parse::<mng_core::HostName>().ok())
                else {
                    return Ok(None);
                };
                ProviderHost {
                    id: host_id,
                    name,
                    state,
                    certified: None,
                    resource: None,
                    failure: None,
                }
            }
        };

        Ok(Some(host.with_resource(ResourceDescriptor {
            image: Some(row.image.clone()),
            ..ResourceDescriptor::new(row.id.clone())
        })))
    }

    async fn run_container(
        &self,
        certified: &CertifiedHostData,
        image: &str,
        request: Option<&CreateHostRequest>,
    ) -> Result<String> {
        let mut args = argv(&["run", "-d", "--init"]);
        args.push("--name".into());
        args.push(self.container_name(certified));
        for (key, value) in [
            (LABEL_MANAGED, "true".to_string()),
            (LABEL_HOST_ID, certified.host_id.to_string()),
            (LABEL_HOST_NAME, certified.host_name.to_string()),
            (LABEL_INSTANCE, self.instance_name.clone()),
        ] {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        if let Some(network) = &self.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        if let Some(build) = request.map(|r| &r.build) {
            if let Some(cpu) = build.cpu_millicores {
                args.push("--cpus".into());
                args.push(format!("{:.3}", f64::from(cpu) / 1000.0));
            }
            if let Some(memory) = build.memory_mb {
                args.push("--memory".into());
                args.push(format!("{memory}m"));
            }
        }
        args.push(image.to_string());
        args.extend(argv(&["sh", "-c", CONTAINER_MAIN]));

        Ok(self.docker(args).await?.trim().to_string())
    }

    fn save_state(&self, host_id: &HostId, state: HostState) -> Result<()> {
        match self.store.update_state(host_id, state) {
            Ok(()) | Err(mng_store::StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ProviderInstance for DockerProvider {
    fn name(&self) -> &str {
        &self.instance_name
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_shutdown_hosts: true,
            supports_snapshots: true,
            supports_snapshot_deletion: true,
            supports_resume: true,
            can_destroy: true,
        }
    }

    async fn discover_hosts(&self) -> Result<Vec<ProviderHost>> {
        let mut hosts = Vec::new();
        for row in self.list_containers(None).await? {
            if let Some(host) = self.host_from_row(&row).await? {
                hosts.push(host);
            }
        }

        // Hosts whose container was removed but whose identity and snapshots remain.
        for record in self.store.list_records_by_instance(&self.instance_name)? {
            if record.failure.is_some() || hosts.iter().any(|h| &h.id == record.host_id()) {
                continue;
            }
            hosts.push(ProviderHost::from_certified(record.certified, HostState::Stopped));
        }

        tracing::debug!(instance = %self.instance_name, count = hosts.len(), "Discovered docker hosts");
        Ok(hosts)
    }

    async fn get_host(&self, host_id: &HostId) -> Result<Option<ProviderHost>> {
        if let Some(row) = self.container_for(host_id).await? {
            return self.host_from_row(&row).await;
        }
        Ok(self
            .store
            .get_record(host_id)?
            .filter(|r| r.provider_instance_name == self.instance_name && r.failure.is_none())
            .map(|r| ProviderHost::from_certified(r.certified, HostState::Stopped)))
    }

    async fn create_host(&self, request: &CreateHostRequest) -> Result<ProviderHost> {
        let certified = request.certified_data();
        let image = request.build.image.clone().unwrap_or_else(|| self.image.clone());
        let create_failed = |reason: String, build_log: String| ProviderError::CreateFailed {
            instance: self.instance_name.clone(),
            host_name: request.host_name.to_string(),
            reason,
            build_log,
        };

        let container_id = match self.run_container(&certified, &image, Some(request)).await {
            Ok(id) => id,
            Err(ProviderError::Command { stderr, .. }) => {
                return Err(create_failed("docker run failed".into(), stderr));
            }
            Err(e) => return Err(e),
        };

        let access = self.access_for(&container_id);
        if let Err(e) = write_host_files(access.as_ref(), &certified, &shutdown_script(IDLE_HOOK)).await {
            let _ = self.docker(argv(&["rm", "-f", &container_id])).await;
            return Err(create_failed("bootstrapping host files failed".into(), e.to_string()));
        }
        ensure_watcher(access.as_ref(), WATCHER_PROGRAM).await;

        let mut record = DurableRecord::new(certified.clone(), &self.instance_name, HostState::Running);
        record.backend_ref = Some(container_id.clone());
        self.store.put_record(&record)?;

        tracing::info!(
            host_id = %certified.host_id,
            container = %container_id,
            image = %image,
            "Created docker host"
        );
        Ok(ProviderHost::from_certified(certified, HostState::Running).with_resource(
            ResourceDescriptor {
                image: Some(image),
                cpu_millicores: request.build.cpu_millicores,
                memory_mb: request.build.memory_mb,
                backend_ref: container_id,
            },
        ))
    }

    async fn stop_host(&self, host_id: &HostId, timeout: Duration) -> Result<()> {
        let row = self
            .container_for(host_id)
            .await?
            .ok_or_else(|| ProviderError::not_found(&self.instance_name, host_id))?;
        let secs = timeout.as_secs().to_string();
        self.docker(argv(&["stop", "-t", &secs, &row.id])).await?;
        self.save_state(host_id, HostState::Stopped)?;
        tracing::info!(host_id = %host_id, container = %row.id, "Stopped docker host");
        Ok(())
    }

    async fn resume_host(&self, host_id: &HostId) -> Result<()> {
        let row = self
            .container_for(host_id)
            .await?
            .ok_or_else(|| ProviderError::not_found(&self.instance_name, host_id))?;
        if row.is_frozen() {
            self.docker(argv(&["unpause", &row.id])).await?;
        } else if row.host_state() != HostState::Running {
            self.docker(argv(&["start", &row.id])).await?;
            let access = self.access_for(&row.id);
            touch_marker(access.as_ref(), ActivitySource::Boot).await?;
            ensure_watcher(access.as_ref(), WATCHER_PROGRAM).await;
        }
        self.save_state(host_id, HostState::Running)?;
        tracing::info!(host_id = %host_id, container = %row.id, "Resumed docker host");
        Ok(())
    }

    async fn start_host(
        &self,
        host_id: &HostId,
        snapshot: Option<&SnapshotId>,
    ) -> Result<ProviderHost> {
        let existing = self.container_for(host_id).await?;

        let restore_from = match (snapshot, &existing) {
            (Some(id), _) => Some(id.clone()),
            (None, Some(_)) => None,
            (None, None) => {
                let record = self.record(host_id)?;
                let latest = record.snapshots.last().map(|s| s.id.clone());
                Some(latest.ok_or_else(|| ProviderError::not_found(&self.instance_name, host_id))?)
            }
        };

        let container = match restore_from {
            None => {
                let Some(row) = existing else {
                    return Err(ProviderError::not_found(&self.instance_name, host_id));
                };
                if row.is_frozen() {
                    self.docker(argv(&["unpause", &row.id])).await?;
                } else if row.host_state() != HostState::Running {
                    self.docker(argv(&["start", &row.id])).await?;
                }
                row.id
            }
            Some(snapshot_id) => {
                let record = self.record(host_id)?;
                if record.snapshot(&snapshot_id).is_none() {
                    return Err(ProviderError::Config {
                        instance: self.instance_name.clone(),
                        message: format!("snapshot {snapshot_id} does not belong to host {host_id}"),
                    });
                }
                if let Some(row) = existing {
                    self.docker(argv(&["rm", "-f", &row.id])).await?;
                }
                let id = self
                    .run_container(&record.certified, snapshot_id.as_str(), None)
                    .await?;
                tracing::info!(host_id = %host_id, snapshot_id = %snapshot_id, "Restored docker host from snapshot");
                id
            }
        };

        let access = self.access_for(&container);
        touch_marker(access.as_ref(), ActivitySource::Boot).await?;
        ensure_watcher(access.as_ref(), WATCHER_PROGRAM).await;
        if let Ok(mut record) = self.record(host_id) {
            record.state = HostState::Running;
            record.backend_ref = Some(container.clone());
            record.updated_at = Utc::now();
            self.store.put_record(&record)?;
        }

        let row = self
            .container_for(host_id)
            .await?
            .ok_or_else(|| ProviderError::not_found(&self.instance_name, host_id))?;
        self.host_from_row(&row)
            .await?
            .ok_or_else(|| ProviderError::not_found(&self.instance_name, host_id))
    }

    async fn terminate_host(&self, host_id: &HostId) -> Result<()> {
        if let Some(row) = self.container_for(host_id).await? {
            self.docker(argv(&["rm", "-f", &row.id])).await?;
        }
        self.save_state(host_id, HostState::Stopped)
    }

    async fn destroy_host(&self, host_id: &HostId, delete_snapshots: bool) -> Result<()> {
        if let Some(row) = self.container_for(host_id).await? {
            self.docker(argv(&["rm", "-f", &row.id])).await?;
        }
        if let Some(record) = self.store.get_record(host_id)? {
            if delete_snapshots {
                for snapshot in &record.snapshots {
                    if let Err(e) = self.docker(argv(&["rmi", snapshot.id.as_str()])).await {
                        tracing::warn!(host_id = %host_id, snapshot_id = %snapshot.id, error = %e, "Failed to remove snapshot image");
                    }
                }
            }
            self.store.delete_record(host_id)?;
        }
        tracing::info!(host_id = %host_id, delete_snapshots, "Destroyed docker host");
        Ok(())
    }

    async fn create_snapshot(&self, host_id: &HostId, name: &str) -> Result<SnapshotRecord> {
        let row = self
            .container_for(host_id)
            .await?
            .ok_or_else(|| ProviderError::not_found(&self.instance_name, host_id))?;
        let mut record = self.record(host_id)?;

        let repository = format!("{}snapshot-{}", self.prefix, host_id.to_hex());
        let tag = format!("{repository}:{}", Utc::now().format("%Y%m%d%H%M%S%3f"));
        let stdout = self
            .docker(vec![
                "commit".into(),
                "--change".into(),
                format!("LABEL {LABEL_MANAGED}=true"),
                "--change".into(),
                format!("LABEL {LABEL_HOST_ID}={host_id}"),
                "--change".into(),
                format!("LABEL {LABEL_SNAPSHOT_NAME}={name}"),
                row.id.clone(),
                tag,
            ])
            .await?;

        let snapshot = SnapshotRecord {
            id: SnapshotId::new(stdout.trim()),
            name: name.to_string(),
            host_id: *host_id,
            created_at: Utc::now(),
        };
        record.snapshots.push(snapshot.clone());
        record.updated_at = Utc::now();
        self.store.put_record(&record)?;
        tracing::info!(host_id = %host_id, snapshot_id = %snapshot.id, "Committed docker snapshot");
        Ok(snapshot)
    }

    async fn list_snapshots(&self, host_id: &HostId) -> Result<Vec<SnapshotRecord>> {
        Ok(self.record(host_id)?.snapshots)
    }

    async fn delete_snapshot(&self, host_id: &HostId, snapshot_id: &SnapshotId) -> Result<bool> {
        let mut record = self.record(host_id)?;
        record.snapshots.retain(|s| &s.id != snapshot_id);
        record.updated_at = Utc::now();
        self.store.put_record(&record)?;

        match self.docker(argv(&["rmi", snapshot_id.as_str()])).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(host_id = %host_id, snapshot_id = %snapshot_id, error = %e, "Snapshot image not removed");
                Ok(false)
            }
        }
    }

    async fn host_access(&self, host_id: &HostId) -> Result<Arc<dyn HostAccess>> {
        let row = self
            .container_for(host_id)
            .await?
            .ok_or_else(|| ProviderError::not_found(&self.instance_name, host_id))?;
        Ok(self.access_for(&row.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_row_labels_parse() {
        let host_id = HostId::generate();
        let line = format!(
            r#"{{"ID":"abc","Names":"mng-dev","State":"paused","Image":"debian","Labels":"mng.managed=true,mng.host_id={host_id},mng.instance=docker"}}"#
        );
        let row: PsRow = serde_json::from_str(&line).unwrap();
        let labels = row.labels();
        assert_eq!(labels.get(LABEL_HOST_ID), Some(&host_id.to_string().as_str()));
        assert_eq!(row.host_state(), HostState::Paused);
        assert!(row.is_frozen());
    }

    #[test]
    fn container_states_map_to_host_states() {
        assert_eq!(map_state("running", "Up 2 hours"), HostState::Running);
        assert_eq!(map_state("exited", "Exited (0) 5 seconds ago"), HostState::Stopped);
        assert_eq!(map_state("exited", "Exited (137) 1 minute ago"), HostState::Stopped);
        assert_eq!(map_state("exited", ""), HostState::Stopped);
        assert_eq!(map_state("dead", ""), HostState::Crashed);
        assert_eq!(map_state("created", "Created"), HostState::Starting);
    }

    #[test]
    fn idle_exit_reports_paused() {
        let line = r#"{"ID":"abc","Names":"mng-dev","State":"exited","Status":"Exited (75) 3 minutes ago","Labels":""}"#;
        let row: PsRow = serde_json::from_str(line).unwrap();
        assert_eq!(row.host_state(), HostState::Paused);
        assert!(!row.is_frozen());
        assert_eq!(exit_code("Exited (75) 3 minutes ago"), Some(IDLE_EXIT_CODE));
        assert_eq!(exit_code("Up 3 minutes"), None);
    }

    #[tokio::test]
    async fn idle_hook_makes_the_main_process_exit_with_the_idle_code() {
        let mut main = tokio::process::Command::new("sh")
            .args(["-c", CONTAINER_MAIN])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = main.id().unwrap().to_string();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let hook = IDLE_HOOK.replace(" 1", &format!(" {pid}"));
        let sent = tokio::process::Command::new("sh")
            .args(["-c", &hook])
            .status()
            .await
            .unwrap();
        assert!(sent.success());

        let status = tokio::time::timeout(Duration::from_secs(5), main.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.code(), Some(IDLE_EXIT_CODE));
    }

    #[test]
    fn build_uses_context_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = BackendContext {
            store: Arc::new(
                mng_store::FileStore::open(dir.path(), mng_store::LockConfig::default()).unwrap(),
            ),
            prefix: "mng-".into(),
            host_dir: "/mng".into(),
        };
        let instance = DockerBackend
            .build("docker", &serde_json::json!({"image": "ubuntu:24.04"}), &ctx)
            .unwrap();
        assert_eq!(instance.name(), "docker");
        assert!(instance.capabilities().supports_snapshots);
        assert!(instance.capabilities().supports_shutdown_hosts);
    }
}
