//! Cloud sandbox VMs behind a generic REST API.
//!
//! Sandboxes are tagged with `mng.managed`, `mng.host_id`, and
//! `mng.instance`. A terminated sandbox is gone from the API, so every host is
//! mirrored into the Durable Record Store and a host without a live sandbox is
//! reported as stopped. There is no native shutdown: stopping terminates the
//! sandbox after an optional snapshot, and starting restores from a snapshot.
//!
//! Endpoints (relative to `base_url`):
//!
//! | method | path                          | purpose              |
//! |--------|-------------------------------|----------------------|
//! | POST   | `/v1/sandboxes`               | create               |
//! | GET    | `/v1/sandboxes?tag=k=v`       | list by tag          |
//! | GET    | `/v1/sandboxes/{id}`          | inspect              |
//! | DELETE | `/v1/sandboxes/{id}`          | terminate            |
//! | POST   | `/v1/sandboxes/{id}/resume`   | resume from pause    |
//! | POST   | `/v1/sandboxes/{id}/exec`     | run a command        |
//! | POST   | `/v1/sandboxes/{id}/snapshots`| capture a snapshot   |
//! | DELETE | `/v1/snapshots/{id}`          | delete snapshot data |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mng_core::layout::WATCHER_PROGRAM;
use mng_core::{ActivitySource, HostId, HostName, HostState, SnapshotId};
use mng_store::{DurableRecord, FileStore, SnapshotRecord, Store};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::access::{ExecOutput, HostAccess};
use crate::bootstrap::{ensure_watcher, shutdown_script, touch_marker, write_host_files};
use crate::error::{ProviderError, Result};
use crate::instance::{
    parse_settings, BackendContext, ConfigField, FieldKind, ProviderBackend, ProviderInstance,
};
use crate::types::{CreateHostRequest, ProviderCapabilities, ProviderHost, ResourceDescriptor};

const BACKEND: &str = "cloud";

const TAG_MANAGED: &str = "mng.managed";
const TAG_HOST_ID: &str = "mng.host_id";
const TAG_HOST_NAME: &str = "mng.host_name";
const TAG_INSTANCE: &str = "mng.instance";

#[derive(Debug, Clone, Deserialize)]
struct CloudSettings {
    base_url: String,
    #[serde(default)]
    api_token: Option<String>,
    #[serde(default = "CloudSettings::default_image")]
    image: String,
    #[serde(default = "CloudSettings::default_snapshot_deletion")]
    supports_snapshot_deletion: bool,
    #[serde(default = "CloudSettings::default_ready_timeout")]
    ready_timeout_seconds: u64,
    #[serde(default = "CloudSettings::default_request_timeout")]
    request_timeout_seconds: u64,
    #[serde(default)]
    host_dir: Option<String>,
}

impl CloudSettings {
    fn default_image() -> String {
        "debian:bookworm-slim".to_string()
    }

    const fn default_snapshot_deletion() -> bool {
        true
    }

    const fn default_ready_timeout() -> u64 {
        300
    }

    const fn default_request_timeout() -> u64 {
        60
    }
}

/// Backend for REST-managed cloud sandboxes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloudBackend;

impl ProviderBackend for CloudBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn description(&self) -> &'static str {
        "Cloud sandbox VMs over a REST API; snapshots, store-backed discovery"
    }

    fn config_schema(&self) -> &'static [ConfigField] {
        &[
            ConfigField {
                name: "base_url",
                kind: FieldKind::String,
                required: true,
                description: "Base URL of the sandbox API",
            },
            ConfigField {
                name: "api_token",
                kind: FieldKind::String,
                required: false,
                description: "Bearer token; MNG_CLOUD_API_TOKEN is used when absent",
            },
            ConfigField {
                name: "image",
                kind: FieldKind::String,
                required: false,
                description: "Default sandbox image",
            },
            ConfigField {
                name: "supports_snapshot_deletion",
                kind: FieldKind::Bool,
                required: false,
                description: "Whether snapshot storage can be deleted explicitly",
            },
            ConfigField {
                name: "ready_timeout_seconds",
                kind: FieldKind::Integer,
                required: false,
                description: "How long to wait for a new sandbox to run",
            },
            ConfigField {
                name: "request_timeout_seconds",
                kind: FieldKind::Integer,
                required: false,
                description: "Per-request HTTP timeout",
            },
            ConfigField {
                name: "host_dir",
                kind: FieldKind::Path,
                required: false,
                description: "Host data root inside sandboxes",
            },
        ]
    }

    fn build(
        &self,
        instance_name: &str,
        settings: &serde_json::Value,
        ctx: &BackendContext,
    ) -> Result<Arc<dyn ProviderInstance>> {
        let mut settings: CloudSettings = parse_settings(instance_name, settings)?;
        if settings.api_token.is_none() {
            settings.api_token = std::env::var("MNG_CLOUD_API_TOKEN").ok();
        }
        Ok(Arc::new(CloudProvider::new(instance_name, settings, ctx)?))
    }
}

/// A sandbox as returned by the API.
#[derive(Debug, Clone, Deserialize)]
struct Sandbox {
    id: String,
    status: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SandboxList {
    sandboxes: Vec<Sandbox>,
}

#[derive(Debug, Serialize)]
struct CreateSandbox<'a> {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cpu_millicores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_mb: Option<u32>,
    tags: BTreeMap<&'static str, String>,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    command: [&'a str; 3],
    #[serde(skip_serializing_if = "Option::is_none")]
    stdin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    exit_code: Option<i32>,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    id: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

/// Map a sandbox status to a host state.
fn map_status(status: &str) -> HostState {
    match status {
        "creating" | "pending" | "starting" => HostState::Starting,
        "running" => HostState::Running,
        "paused" | "suspended" => HostState::Paused,
        "stopping" | "terminating" => HostState::Stopping,
        "error" | "failed" => HostState::Crashed,
        _ => HostState::Stopped,
    }
}

/// Thin typed client for the sandbox API.
#[derive(Debug, Clone)]
struct CloudClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl CloudClient {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    fn auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn create(&self, body: &CreateSandbox<'_>) -> Result<Sandbox> {
        let response = self
            .auth(self.http.post(self.url("/v1/sandboxes")))
            .json(body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list(&self, instance: &str) -> Result<Vec<Sandbox>> {
        let response = self
            .auth(self.http.get(self.url("/v1/sandboxes")))
            .query(&[("tag", format!("{TAG_INSTANCE}={instance}"))])
            .send()
            .await?;
        let list: SandboxList = Self::check(response).await?.json().await?;
        Ok(list.sandboxes)
    }

    async fn get(&self, id: &str) -> Result<Option<Sandbox>> {
        let response = self
            .auth(self.http.get(self.url(&format!("/v1/sandboxes/{id}"))))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check(response).await?.json().await?))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let response = self
            .auth(self.http.delete(self.url(&format!("/v1/sandboxes/{id}"))))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await.map(|_| ())
    }

    async fn resume(&self, id: &str) -> Result<()> {
        let response = self
            .auth(self.http.post(self.url(&format!("/v1/sandboxes/{id}/resume"))))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn exec(&self, id: &str, script: &str, stdin: Option<&[u8]>) -> Result<ExecOutput> {
        let body = ExecRequest {
            command: ["sh", "-c", script],
            stdin: stdin.map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
        };
        let response = self
            .auth(self.http.post(self.url(&format!("/v1/sandboxes/{id}/exec"))))
            .json(&body)
            .send()
            .await?;
        let output: ExecResponse = Self::check(response).await?.json().await?;
        Ok(ExecOutput {
            exit_code: output.exit_code,
            stdout: output.stdout.into_bytes(),
            stderr: output.stderr,
        })
    }

    async fn snapshot(&self, id: &str, name: &str) -> Result<SnapshotResponse> {
        let response = self
            .auth(self.http.post(self.url(&format!("/v1/sandboxes/{id}/snapshots"))))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn delete_snapshot(&self, id: &str) -> Result<()> {
        let response = self
            .auth(self.http.delete(self.url(&format!("/v1/snapshots/{id}"))))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await.map(|_| ())
    }
}

/// Host access through the sandbox exec endpoint.
struct CloudAccess {
    client: CloudClient,
    sandbox_id: String,
    host_dir: String,
}

#[async_trait]
impl HostAccess for CloudAccess {
    fn host_dir(&self) -> &str {
        &self.host_dir
    }

    async fn run(&self, script: &str, stdin: Option<&[u8]>) -> Result<ExecOutput> {
        self.client.exec(&self.sandbox_id, script, stdin).await
    }
}

/// Provider instance for one sandbox API account.
#[derive(Debug)]
pub struct CloudProvider {
    instance_name: String,
    client: CloudClient,
    settings: CloudSettings,
    host_dir: String,
    prefix: String,
    store: Arc<FileStore>,
}

impl CloudProvider {
    fn new(instance_name: &str, settings: CloudSettings, ctx: &BackendContext) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .build()
            .map_err(|e| ProviderError::config(instance_name, format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            instance_name: instance_name.to_string(),
            client: CloudClient {
                http,
                base_url: settings.base_url.clone(),
                token: settings.api_token.clone(),
            },
            host_dir: settings.host_dir.clone().unwrap_or_else(|| ctx.host_dir.clone()),
            settings,
            prefix: ctx.prefix.clone(),
            store: ctx.store.clone(),
        })
    }

    fn record(&self, host_id: &HostId) -> Result<DurableRecord> {
        self.store
            .get_record(host_id)?
            .filter(|r| r.provider_instance_name == self.instance_name)
            .ok_or_else(|| ProviderError::not_found(&self.instance_name, host_id))
    }

    fn access_for(&self, sandbox_id: &str) -> Arc<dyn HostAccess> {
        Arc::new(CloudAccess {
            client: self.client.clone(),
            sandbox_id: sandbox_id.to_string(),
            host_dir: self.host_dir.clone(),
        })
    }

    fn tags(&self, host_id: &HostId, host_name: &HostName) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            (TAG_MANAGED, "true".to_string()),
            (TAG_HOST_ID, host_id.to_string()),
            (TAG_HOST_NAME, host_name.to_string()),
            (TAG_INSTANCE, self.instance_name.clone()),
        ])
    }

    fn hook_body(&self, sandbox_id: &str) -> String {
        format!(
            "curl -fsS -X POST -H \"Authorization: Bearer ${{MNG_CLOUD_API_TOKEN:-}}\" \"{}/v1/sandboxes/{sandbox_id}/pause\"",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    /// The live sandbox of a host, if its recorded handle still exists.
    async fn live_sandbox(&self, record: &DurableRecord) -> Result<Option<Sandbox>> {
        match &record.backend_ref {
            Some(id) => self.client.get(id).await,
            None => Ok(None),
        }
    }

    async fn wait_until_running(&self, sandbox: Sandbox) -> Result<Sandbox> {
        let timeout = Duration::from_secs(self.settings.ready_timeout_seconds);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut current = sandbox;
        loop {
            match map_status(&current.status) {
                HostState::Running => return Ok(current),
                HostState::Crashed => {
                    return Err(ProviderError::Api {
                        status: 500,
                        message: format!("sandbox {} entered status {}", current.id, current.status),
                    })
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProviderError::Timeout {
                    operation: format!("sandbox {} to start", current.id),
                    after: timeout,
                });
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            current = self
                .client
                .get(&current.id)
                .await?
                .ok_or_else(|| ProviderError::Api {
                    status: 404,
                    message: format!("sandbox {} vanished while starting", current.id),
                })?;
        }
    }

    fn host_from(&self, record: &DurableRecord, sandbox: Option<&Sandbox>) -> ProviderHost {
        let state = sandbox.map_or(HostState::Stopped, |s| map_status(&s.status));
        let host = ProviderHost::from_certified(record.certified.clone(), state);
        match sandbox {
            Some(s) => host.with_resource(ResourceDescriptor {
                image: s.image.clone(),
                ..ResourceDescriptor::new(s.id.clone())
            }),
            None => host,
        }
    }

    async fn launch(
        &self,
        record: &DurableRecord,
        image: Option<&str>,
        snapshot: Option<&SnapshotId>,
        request: Option<&CreateHostRequest>,
    ) -> Result<Sandbox> {
        let body = CreateSandbox {
            name: format!("{}{}", self.prefix, record.host_name()),
            image,
            snapshot_id: snapshot.map(SnapshotId::as_str),
            cpu_millicores: request.and_then(|r| r.build.cpu_millicores),
            memory_mb: request.and_then(|r| r.build.memory_mb),
            tags: self.tags(record.host_id(), record.host_name()),
        };
        let sandbox = self.client.create(&body).await?;
        self.wait_until_running(sandbox).await
    }
}

#[async_trait]
impl ProviderInstance for CloudProvider {
    fn name(&self) -> &str {
        &self.instance_name
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_shutdown_hosts: false,
            supports_snapshots: true,
            supports_snapshot_deletion: self.settings.supports_snapshot_deletion,
            supports_resume: true,
            can_destroy: true,
        }
    }

    async fn discover_hosts(&self) -> Result<Vec<ProviderHost>> {
        let live = self.client.list(&self.instance_name).await?;
        let by_host: BTreeMap<HostId, &Sandbox> = live
            .iter()
            .filter(|s| s.tags.get(TAG_MANAGED).is_some_and(|v| v == "true"))
            .filter_map(|s| {
                let id = s.tags.get(TAG_HOST_ID)?.parse::<HostId>().ok()?;
                Some((id, s))
            })
            .collect();

        let mut hosts = Vec::new();
        for record in self.store.list_records_by_instance(&self.instance_name)? {
            if record.failure.is_some() {
                continue;
            }
            let sandbox = by_host
                .get(record.host_id())
                .copied()
                .filter(|s| record.backend_ref.as_deref() == Some(s.id.as_str()));
            hosts.push(self.host_from(&record, sandbox));
        }

        // Sandboxes created from another machine's store.
        for (host_id, sandbox) in &by_host {
            if hosts.iter().any(|h| &h.id == host_id) {
                continue;
            }
            let Some(name) = sandbox.tags.get(TAG_HOST_NAME).and_then(|n| n.parse::<HostName>().ok()) else {
                continue;
            };
            hosts.push(ProviderHost {
                id: *host_id,
                name,
                state: map_status(&sandbox.status),
                certified: None,
                resource: Some(ResourceDescriptor::new(sandbox.id.clone())),
                failure: None,
            });
        }

        tracing::debug!(instance = %self.instance_name, count = hosts.len(), "Discovered cloud hosts");
        Ok(hosts)
    }

    async fn get_host(&self, host_id: &HostId) -> Result<Option<ProviderHost>> {
        let Some(record) = self
            .store
            .get_record(host_id)?
            .filter(|r| r.provider_instance_name == self.instance_name && r.failure.is_none())
        else {
            return Ok(None);
        };
        let sandbox = self.live_sandbox(&record).await?;
        Ok(Some(self.host_from(&record, sandbox.as_ref())))
    }

    async fn create_host(&self, request: &CreateHostRequest) -> Result<ProviderHost> {
        let certified = request.certified_data();
        let mut record = DurableRecord::new(certified.clone(), &self.instance_name, HostState::Building);
        let image = request.build.image.as_deref().unwrap_or(&self.settings.image);

        let sandbox = match self.launch(&record, Some(image), None, Some(request)).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                return Err(ProviderError::CreateFailed {
                    instance: self.instance_name.clone(),
                    host_name: request.host_name.to_string(),
                    reason: "sandbox allocation failed".into(),
                    build_log: e.to_string(),
                })
            }
        };

        let access = self.access_for(&sandbox.id);
        let hook = shutdown_script(&self.hook_body(&sandbox.id));
        if let Err(e) = write_host_files(access.as_ref(), &certified, &hook).await {
            if let Err(cleanup) = self.client.delete(&sandbox.id).await {
                tracing::warn!(sandbox = %sandbox.id, error = %cleanup, "Failed to release sandbox after bootstrap error");
            }
            return Err(ProviderError::CreateFailed {
                instance: self.instance_name.clone(),
                host_name: request.host_name.to_string(),
                reason: "bootstrapping host files failed".into(),
                build_log: e.to_string(),
            });
        }
        ensure_watcher(access.as_ref(), WATCHER_PROGRAM).await;

        record.backend_ref = Some(sandbox.id.clone());
        record.state = HostState::Running;
        record.updated_at = Utc::now();
        self.store.put_record(&record)?;

        tracing::info!(host_id = %certified.host_id, sandbox = %sandbox.id, "Created cloud host");
        Ok(ProviderHost::from_certified(certified, HostState::Running).with_resource(
            ResourceDescriptor {
                image: Some(image.to_string()),
                cpu_millicores: request.build.cpu_millicores,
                memory_mb: request.build.memory_mb,
                backend_ref: sandbox.id,
            },
        ))
    }

    async fn resume_host(&self, host_id: &HostId) -> Result<()> {
        let record = self.record(host_id)?;
        let id = record
            .backend_ref
            .as_deref()
            .ok_or_else(|| ProviderError::not_found(&self.instance_name, host_id))?;
        self.client.resume(id).await
    }

    async fn start_host(
        &self,
        host_id: &HostId,
        snapshot: Option<&SnapshotId>,
    ) -> Result<ProviderHost> {
        let mut record = self.record(host_id)?;

        if snapshot.is_none() {
            if let Some(sandbox) = self.live_sandbox(&record).await? {
                match map_status(&sandbox.status) {
                    HostState::Running => return Ok(self.host_from(&record, Some(&sandbox))),
                    HostState::Paused => {
                        self.client.resume(&sandbox.id).await?;
                        let sandbox = self.wait_until_running(sandbox).await?;
                        return Ok(self.host_from(&record, Some(&sandbox)));
                    }
                    _ => {}
                }
            }
        }

        let snapshot_id = match snapshot {
            Some(id) => {
                if record.snapshot(id).is_none() {
                    return Err(ProviderError::config(
                        &self.instance_name,
                        format!("snapshot {id} does not belong to host {host_id}"),
                    ));
                }
                id.clone()
            }
            None => record
                .snapshots
                .last()
                .map(|s| s.id.clone())
                .ok_or_else(|| {
                    ProviderError::config(
                        &self.instance_name,
                        format!("host {host_id} has no live sandbox and no snapshot to restore"),
                    )
                })?,
        };

        if let Some(old) = record.backend_ref.take() {
            self.client.delete(&old).await?;
        }
        let sandbox = self.launch(&record, None, Some(&snapshot_id), None).await?;
        let access = self.access_for(&sandbox.id);
        // The restored filesystem carries the old sandbox id in its hook.
        access
            .write_file(
                mng_core::layout::SHUTDOWN_HOOK,
                shutdown_script(&self.hook_body(&sandbox.id)).as_bytes(),
                true,
            )
            .await?;
        touch_marker(access.as_ref(), ActivitySource::Boot).await?;
        ensure_watcher(access.as_ref(), WATCHER_PROGRAM).await;

        record.backend_ref = Some(sandbox.id.clone());
        record.state = HostState::Running;
        record.updated_at = Utc::now();
        self.store.put_record(&record)?;
        tracing::info!(host_id = %host_id, snapshot_id = %snapshot_id, sandbox = %sandbox.id, "Restored cloud host");
        Ok(self.host_from(&record, Some(&sandbox)))
    }

    async fn terminate_host(&self, host_id: &HostId) -> Result<()> {
        let mut record = self.record(host_id)?;
        if let Some(id) = record.backend_ref.take() {
            self.client.delete(&id).await?;
        }
        record.state = HostState::Stopped;
        record.updated_at = Utc::now();
        self.store.put_record(&record)?;
        Ok(())
    }

    async fn destroy_host(&self, host_id: &HostId, delete_snapshots: bool) -> Result<()> {
        let Ok(record) = self.record(host_id) else {
            return Ok(());
        };
        if let Some(id) = &record.backend_ref {
            self.client.delete(id).await?;
        }
        if delete_snapshots && self.settings.supports_snapshot_deletion {
            for snapshot in &record.snapshots {
                if let Err(e) = self.client.delete_snapshot(snapshot.id.as_str()).await {
                    tracing::warn!(host_id = %host_id, snapshot_id = %snapshot.id, error = %e, "Failed to delete snapshot");
                }
            }
        }
        self.store.delete_record(host_id)?;
        tracing::info!(host_id = %host_id, delete_snapshots, "Destroyed cloud host");
        Ok(())
    }

    async fn create_snapshot(&self, host_id: &HostId, name: &str) -> Result<SnapshotRecord> {
        let mut record = self.record(host_id)?;
        let id = record
            .backend_ref
            .clone()
            .ok_or_else(|| ProviderError::not_found(&self.instance_name, host_id))?;
        let response = self.client.snapshot(&id, name).await?;

        let snapshot = SnapshotRecord {
            id: SnapshotId::new(response.id),
            name: name.to_string(),
            host_id: *host_id,
            created_at: response.created_at.unwrap_or_else(Utc::now),
        };
        record.snapshots.push(snapshot.clone());
        record.updated_at = Utc::now();
        self.store.put_record(&record)?;
        tracing::info!(host_id = %host_id, snapshot_id = %snapshot.id, "Captured cloud snapshot");
        Ok(snapshot)
    }

    async fn list_snapshots(&self, host_id: &HostId) -> Result<Vec<SnapshotRecord>> {
        let mut snapshots = self.record(host_id)?.snapshots;
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }

    async fn delete_snapshot(&self, host_id: &HostId, snapshot_id: &SnapshotId) -> Result<bool> {
        let mut record = self.record(host_id)?;
        record.snapshots.retain(|s| &s.id != snapshot_id);
        record.updated_at = Utc::now();
        self.store.put_record(&record)?;

        if !self.settings.supports_snapshot_deletion {
            return Ok(false);
        }
        self.client.delete_snapshot(snapshot_id.as_str()).await?;
        Ok(true)
    }

    async fn host_access(&self, host_id: &HostId) -> Result<Arc<dyn HostAccess>> {
        let record = self.record(host_id)?;
        let id = record
            .backend_ref
            .as_deref()
            .ok_or_else(|| ProviderError::not_found(&self.instance_name, host_id))?;
        Ok(self.access_for(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mng_core::{ActivityConfig, IdleMode};
    use mng_store::{CertifiedHostData, LockConfig};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn provider(server: &MockServer) -> (CloudProvider, TempDir) {
        let dir = TempDir::new().unwrap();
        let ctx = BackendContext {
            store: Arc::new(FileStore::open(dir.path(), LockConfig::default()).unwrap()),
            prefix: "mng-".into(),
            host_dir: "/mng".into(),
        };
        let settings: CloudSettings = parse_settings(
            "cloud",
            &serde_json::json!({"base_url": server.uri(), "api_token": "secret"}),
        )
        .unwrap();
        (CloudProvider::new("cloud", settings, &ctx).unwrap(), dir)
    }

    fn request() -> CreateHostRequest {
        CreateHostRequest {
            host_id: HostId::generate(),
            host_name: "sandbox".parse().unwrap(),
            build: crate::types::BuildConfig {
                activity_config: ActivityConfig::new(IdleMode::Agent, 600),
                ..Default::default()
            },
        }
    }

    async fn mount_exec_ok(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1/sandboxes/[^/]+/exec$"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"exit_code": 0})),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn create_bootstraps_and_records_host() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes"))
            .respond_with(ResponseTemplate::new(201).set_body_json(
                serde_json::json!({"id": "sb-1", "status": "running"}),
            ))
            .expect(1)
            .mount(&server)
            .await;
        mount_exec_ok(&server).await;

        let (provider, _dir) = provider(&server).await;
        let request = request();
        let host = provider.create_host(&request).await.unwrap();

        assert_eq!(host.state, HostState::Running);
        assert_eq!(host.resource.unwrap().backend_ref, "sb-1");
        let record = provider.store.get_record(&request.host_id).unwrap().unwrap();
        assert_eq!(record.backend_ref.as_deref(), Some("sb-1"));
        assert_eq!(record.state, HostState::Running);
    }

    #[tokio::test]
    async fn allocation_failure_carries_build_log() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes"))
            .respond_with(ResponseTemplate::new(400).set_body_string("unknown image"))
            .mount(&server)
            .await;

        let (provider, _dir) = provider(&server).await;
        let err = provider.create_host(&request()).await.unwrap_err();
        match err {
            ProviderError::CreateFailed { build_log, .. } => {
                assert!(build_log.contains("unknown image"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn terminated_hosts_are_discovered_as_stopped() {
        let server = MockServer::start().await;
        let (provider, _dir) = provider(&server).await;

        let live_id = HostId::generate();
        let gone_id = HostId::generate();
        for (host_id, name, sandbox) in [(live_id, "live", Some("sb-live")), (gone_id, "gone", None)] {
            let certified =
                CertifiedHostData::new(host_id, name.parse().unwrap(), ActivityConfig::default());
            let mut record = DurableRecord::new(certified, "cloud", HostState::Running);
            record.backend_ref = sandbox.map(str::to_string);
            provider.store.put_record(&record).unwrap();
        }

        Mock::given(method("GET"))
            .and(path("/v1/sandboxes"))
            .and(query_param("tag", "mng.instance=cloud"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sandboxes": [{
                    "id": "sb-live",
                    "status": "paused",
                    "tags": {"mng.managed": "true", "mng.host_id": live_id.to_string(), "mng.instance": "cloud"}
                }]
            })))
            .mount(&server)
            .await;

        let hosts = provider.discover_hosts().await.unwrap();
        let state_of = |id: HostId| hosts.iter().find(|h| h.id == id).unwrap().state;
        assert_eq!(state_of(live_id), HostState::Paused);
        assert_eq!(state_of(gone_id), HostState::Stopped);
    }

    #[tokio::test]
    async fn snapshot_listing_tracks_record() {
        let server = MockServer::start().await;
        let (provider, _dir) = provider(&server).await;

        let host_id = HostId::generate();
        let certified =
            CertifiedHostData::new(host_id, "snappy".parse().unwrap(), ActivityConfig::default());
        let mut record = DurableRecord::new(certified, "cloud", HostState::Running);
        record.backend_ref = Some("sb-9".into());
        provider.store.put_record(&record).unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sb-9/snapshots"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "snap-1"})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/snapshots/snap-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let snapshot = provider.create_snapshot(&host_id, "before-upgrade").await.unwrap();
        assert_eq!(snapshot.id.as_str(), "snap-1");
        assert_eq!(provider.list_snapshots(&host_id).await.unwrap().len(), 1);

        assert!(provider.delete_snapshot(&host_id, &snapshot.id).await.unwrap());
        assert!(provider.list_snapshots(&host_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_errors_are_retriable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sandboxes"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (provider, _dir) = provider(&server).await;
        let err = provider.discover_hosts().await.unwrap_err();
        assert!(err.is_retriable());
    }
}
