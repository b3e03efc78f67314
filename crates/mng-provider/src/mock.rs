//! Mock provider for testing.
//!
//! Hosts live in directories under a root, so the real host file contract
//! (bootstrap files, markers, agent data) is exercised through `LocalAccess`.
//! Snapshots are directory copies.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mng_core::{ActivitySource, HostId, HostState, SnapshotId};
use mng_store::SnapshotRecord;
use parking_lot::Mutex;

use crate::access::{HostAccess, LocalAccess};
use crate::bootstrap::{launch_watcher, shutdown_script, touch_marker, write_host_files};
use crate::error::{ProviderError, Result};
use crate::instance::ProviderInstance;
use crate::types::{CreateHostRequest, ProviderCapabilities, ProviderHost, ResourceDescriptor};

/// File the mock shutdown hook touches inside the host directory.
pub const SHUTDOWN_SENTINEL: &str = "shutdown_invoked";

struct MockHost {
    certified: mng_store::CertifiedHostData,
    state: HostState,
    snapshots: Vec<SnapshotRecord>,
}

/// A directory-backed provider instance with failure injection.
pub struct MockProvider {
    name: String,
    root: PathBuf,
    capabilities: ProviderCapabilities,
    hosts: Mutex<HashMap<HostId, MockHost>>,
    discovery_error: Mutex<Option<String>>,
    create_error: Mutex<Option<String>>,
    discovery_delay: Mutex<Option<Duration>>,
    watcher_program: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
    snapshot_seq: AtomicU64,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("hosts", &self.hosts.lock().len())
            .finish_non_exhaustive()
    }
}

impl MockProvider {
    /// Create a mock instance storing hosts under `root`.
    #[must_use]
    pub fn new(name: &str, root: impl Into<PathBuf>, capabilities: ProviderCapabilities) -> Self {
        Self {
            name: name.to_string(),
            root: root.into(),
            capabilities,
            hosts: Mutex::new(HashMap::new()),
            discovery_error: Mutex::new(None),
            create_error: Mutex::new(None),
            discovery_delay: Mutex::new(None),
            watcher_program: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            snapshot_seq: AtomicU64::new(0),
        }
    }

    /// Capabilities of a fully featured backend.
    #[must_use]
    pub const fn full_capabilities() -> ProviderCapabilities {
        ProviderCapabilities {
            supports_shutdown_hosts: true,
            supports_snapshots: true,
            supports_snapshot_deletion: true,
            supports_resume: true,
            can_destroy: true,
        }
    }

    /// Make every discovery call fail with a retriable API error.
    pub fn fail_discovery(&self, message: Option<&str>) {
        *self.discovery_error.lock() = message.map(str::to_string);
    }

    /// Make the next `create_host` call fail with the given build log.
    pub fn fail_next_create(&self, build_log: &str) {
        *self.create_error.lock() = Some(build_log.to_string());
    }

    /// Delay every discovery call.
    pub fn set_discovery_delay(&self, delay: Option<Duration>) {
        *self.discovery_delay.lock() = delay;
    }

    /// Launch this program as the idle watcher on create and start.
    pub fn set_watcher_program(&self, program: Option<&str>) {
        *self.watcher_program.lock() = program.map(str::to_string);
    }

    /// Force a host into a state, e.g. `Paused` as the idle hook would.
    pub fn set_state(&self, host_id: &HostId, state: HostState) {
        if let Some(host) = self.hosts.lock().get_mut(host_id) {
            host.state = state;
        }
    }

    /// Current state of a host, if the instance knows it.
    #[must_use]
    pub fn state_of(&self, host_id: &HostId) -> Option<HostState> {
        self.hosts.lock().get(host_id).map(|h| h.state)
    }

    /// Number of hosts the instance knows.
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.hosts.lock().len()
    }

    /// Operation log, one entry per backend call, e.g. `stop host-...`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Directory acting as a host's data root.
    #[must_use]
    pub fn host_dir(&self, host_id: &HostId) -> PathBuf {
        self.root.join("hosts").join(host_id.to_string())
    }

    fn snapshot_dir(&self, snapshot_id: &SnapshotId) -> PathBuf {
        self.root.join("snapshots").join(snapshot_id.as_str())
    }

    fn record_call(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn hook(&self) -> String {
        shutdown_script(&format!("touch \"$HOST_DIR/{SHUTDOWN_SENTINEL}\""))
    }

    async fn boot_watcher(&self, access: &LocalAccess) -> Result<()> {
        let program = self.watcher_program.lock().clone();
        if let Some(program) = program {
            launch_watcher(access, &program).await?;
        }
        Ok(())
    }

    fn state_checked(&self, host_id: &HostId) -> Result<HostState> {
        self.state_of(host_id)
            .ok_or_else(|| ProviderError::not_found(&self.name, host_id))
    }

    fn require(&self, supported: bool, operation: &'static str) -> Result<()> {
        if supported {
            Ok(())
        } else {
            Err(ProviderError::unsupported(&self.name, operation))
        }
    }

    fn to_host(&self, host_id: &HostId, host: &MockHost) -> ProviderHost {
        let dir = self.host_dir(host_id).to_string_lossy().into_owned();
        let provider_host = ProviderHost::from_certified(host.certified.clone(), host.state);
        if host.state == HostState::Stopped && !self.capabilities.supports_shutdown_hosts {
            provider_host
        } else {
            provider_host.with_resource(ResourceDescriptor::new(dir))
        }
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl ProviderInstance for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn discover_hosts(&self) -> Result<Vec<ProviderHost>> {
        self.record_call("discover".into());
        let delay = *self.discovery_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.discovery_error.lock().clone() {
            return Err(ProviderError::Api {
                status: 503,
                message,
            });
        }
        let hosts = self.hosts.lock();
        let mut found: Vec<ProviderHost> = hosts
            .iter()
            .map(|(id, host)| self.to_host(id, host))
            .collect();
        found.sort_by_key(|h| h.id);
        Ok(found)
    }

    async fn create_host(&self, request: &CreateHostRequest) -> Result<ProviderHost> {
        self.record_call(format!("create {}", request.host_id));
        let injected = self.create_error.lock().take();
        if let Some(build_log) = injected {
            return Err(ProviderError::CreateFailed {
                instance: self.name.clone(),
                host_name: request.host_name.to_string(),
                reason: "injected failure".into(),
                build_log,
            });
        }

        let certified = request.certified_data();
        let access = LocalAccess::new(self.host_dir(&request.host_id));
        write_host_files(&access, &certified, &self.hook()).await?;
        self.boot_watcher(&access).await?;

        let host = MockHost {
            certified,
            state: HostState::Running,
            snapshots: Vec::new(),
        };
        let created = self.to_host(&request.host_id, &host);
        self.hosts.lock().insert(request.host_id, host);
        Ok(created)
    }

    async fn stop_host(&self, host_id: &HostId, _timeout: Duration) -> Result<()> {
        self.record_call(format!("stop {host_id}"));
        self.require(self.capabilities.supports_shutdown_hosts, "stop_host")?;
        self.state_checked(host_id)?;
        self.set_state(host_id, HostState::Stopped);
        Ok(())
    }

    async fn resume_host(&self, host_id: &HostId) -> Result<()> {
        self.record_call(format!("resume {host_id}"));
        self.require(self.capabilities.supports_resume, "resume_host")?;
        if self.state_checked(host_id)? == HostState::Paused {
            self.set_state(host_id, HostState::Running);
        }
        Ok(())
    }

    async fn start_host(
        &self,
        host_id: &HostId,
        snapshot: Option<&SnapshotId>,
    ) -> Result<ProviderHost> {
        self.record_call(format!("start {host_id}"));
        self.state_checked(host_id)?;

        // A terminated host has no directory left; it comes back from its
        // latest snapshot, or fresh if it never had one.
        let dir = self.host_dir(host_id);
        let latest = self
            .hosts
            .lock()
            .get(host_id)
            .and_then(|h| h.snapshots.last().map(|s| s.id.clone()));
        let snapshot = match (snapshot, dir.exists()) {
            (Some(id), _) => Some(id.clone()),
            (None, false) => latest,
            (None, true) => None,
        };

        if let Some(snapshot_id) = &snapshot {
            self.require(self.capabilities.supports_snapshots, "start_host from snapshot")?;
            let source = self.snapshot_dir(snapshot_id);
            if !source.exists() {
                return Err(ProviderError::config(
                    &self.name,
                    format!("snapshot {snapshot_id} has no data"),
                ));
            }
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(|e| ProviderError::io(&dir, e))?;
            }
            copy_dir(&source, &dir).map_err(|e| ProviderError::io(&dir, e))?;
        }

        let access = LocalAccess::new(dir.clone());
        if dir.exists() {
            touch_marker(&access, ActivitySource::Boot).await?;
        } else {
            let certified = self
                .hosts
                .lock()
                .get(host_id)
                .map(|h| h.certified.clone())
                .ok_or_else(|| ProviderError::not_found(&self.name, host_id))?;
            write_host_files(&access, &certified, &self.hook()).await?;
        }
        self.boot_watcher(&access).await?;

        let mut hosts = self.hosts.lock();
        let host = hosts
            .get_mut(host_id)
            .ok_or_else(|| ProviderError::not_found(&self.name, host_id))?;
        host.state = HostState::Running;
        Ok(self.to_host(host_id, host))
    }

    async fn terminate_host(&self, host_id: &HostId) -> Result<()> {
        self.record_call(format!("terminate {host_id}"));
        self.state_checked(host_id)?;
        let dir = self.host_dir(host_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| ProviderError::io(&dir, e))?;
        }
        self.set_state(host_id, HostState::Stopped);
        Ok(())
    }

    async fn destroy_host(&self, host_id: &HostId, delete_snapshots: bool) -> Result<()> {
        self.record_call(format!("destroy {host_id}"));
        self.require(self.capabilities.can_destroy, "destroy_host")?;
        let Some(host) = self.hosts.lock().remove(host_id) else {
            return Ok(());
        };
        let dir = self.host_dir(host_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| ProviderError::io(&dir, e))?;
        }
        if delete_snapshots {
            for snapshot in &host.snapshots {
                let path = self.snapshot_dir(&snapshot.id);
                if path.exists() {
                    fs::remove_dir_all(&path).map_err(|e| ProviderError::io(&path, e))?;
                }
            }
        }
        Ok(())
    }

    async fn create_snapshot(&self, host_id: &HostId, name: &str) -> Result<SnapshotRecord> {
        self.record_call(format!("snapshot {host_id}"));
        self.require(self.capabilities.supports_snapshots, "create_snapshot")?;
        self.state_checked(host_id)?;

        let seq = self.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = SnapshotRecord {
            id: SnapshotId::new(format!("{}-snap-{seq}", self.name)),
            name: name.to_string(),
            host_id: *host_id,
            created_at: Utc::now(),
        };
        let target = self.snapshot_dir(&snapshot.id);
        copy_dir(&self.host_dir(host_id), &target).map_err(|e| ProviderError::io(&target, e))?;

        if let Some(host) = self.hosts.lock().get_mut(host_id) {
            host.snapshots.push(snapshot.clone());
        }
        Ok(snapshot)
    }

    async fn list_snapshots(&self, host_id: &HostId) -> Result<Vec<SnapshotRecord>> {
        let hosts = self.hosts.lock();
        let host = hosts
            .get(host_id)
            .ok_or_else(|| ProviderError::not_found(&self.name, host_id))?;
        Ok(host.snapshots.clone())
    }

    async fn delete_snapshot(&self, host_id: &HostId, snapshot_id: &SnapshotId) -> Result<bool> {
        self.record_call(format!("delete-snapshot {snapshot_id}"));
        self.require(self.capabilities.supports_snapshots, "delete_snapshot")?;
        {
            let mut hosts = self.hosts.lock();
            let host = hosts
                .get_mut(host_id)
                .ok_or_else(|| ProviderError::not_found(&self.name, host_id))?;
            host.snapshots.retain(|s| &s.id != snapshot_id);
        }
        if !self.capabilities.supports_snapshot_deletion {
            return Ok(false);
        }
        let path = self.snapshot_dir(snapshot_id);
        if path.exists() {
            fs::remove_dir_all(&path).map_err(|e| ProviderError::io(&path, e))?;
        }
        Ok(true)
    }

    async fn host_access(&self, host_id: &HostId) -> Result<Arc<dyn HostAccess>> {
        self.state_checked(host_id)?;
        Ok(Arc::new(LocalAccess::new(self.host_dir(host_id))))
    }
}
