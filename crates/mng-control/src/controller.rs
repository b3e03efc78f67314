//! Host lifecycle controller.
//!
//! This module provides the `HostLifecycle` trait and the `HostController`
//! implementation that drives hosts through the state machine in
//! [`crate::lifecycle`].
//!
//! Every mutation runs under the host's advisory lock and re-reads the host
//! from its provider instance after the lock is taken, so two invocations
//! racing on one host see each other's effects instead of stale views.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mng_core::{
    layout, ActivityScope, ActivitySource, AgentId, AgentObservedState, CoreError, HostId,
    HostName, HostRef, HostState, SnapshotId,
};
use mng_provider::{
    BuildConfig, CreateHostRequest, HostAccess, ProviderError, ProviderInstance,
};
use mng_store::{AgentRecord, DurableRecord, FailureRecord, HostLockGuard, Store, StoreError};

use crate::context::InvocationContext;
use crate::error::{ControlError, Result};
use crate::hooks::HookPoint;
use crate::lifecycle;
use crate::reconcile::{occupies_name, Reconciler};
use crate::types::{Agent, Host, HostView, NewAgent, StopOutcome};

/// Budget for the stop that `destroy_host` and snapshot restores perform
/// on a live host.
pub const INTERNAL_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Trait defining host lifecycle operations.
///
/// Every operation that fails for one host names it by id and name and
/// carries an error category; see [`ControlError::category`].
#[async_trait]
pub trait HostLifecycle: Send + Sync {
    // =========================================================================
    // Lifecycle Operations
    // =========================================================================

    /// Create a host on a provider instance.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NameTaken` if a live host already uses the name,
    /// including one created concurrently under the same name.
    /// Returns `ControlError::CreateFailed` if the provider failed; a FAILED
    /// record is written first so discovery still reports the host.
    async fn create_host(&self, provider: &str, name: HostName, build: BuildConfig) -> Result<Host>;

    /// Stop a host, optionally snapshotting it first.
    ///
    /// On backends without native shutdown the host is terminated instead
    /// and still reported as STOPPED.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvalidTransition` if the host is mid-build or
    /// mid-start, or was destroyed and no snapshot was requested.
    async fn stop_host(
        &self,
        host: &HostRef,
        create_snapshot: bool,
        timeout: Duration,
    ) -> Result<StopOutcome>;

    /// Start a stopped host, optionally from a snapshot.
    ///
    /// Starting a running host without a snapshot returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::SnapshotNotFound` if the snapshot is not listed
    /// for the host, or `ControlError::InvalidTransition` from a state that
    /// cannot be started.
    async fn start_host(&self, host: &HostRef, snapshot: Option<&SnapshotId>) -> Result<Host>;

    /// Destroy a host irreversibly, stopping it first if needed.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvalidTransition` if the host is already
    /// destroyed.
    async fn destroy_host(&self, host: &HostRef, delete_snapshots: bool) -> Result<()>;

    // =========================================================================
    // Operations on live hosts
    // =========================================================================

    /// Return the host as a running host, resuming it if it was paused.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotLive` if the host is offline for any other
    /// reason.
    async fn ensure_live(&self, host: &HostRef) -> Result<Host>;

    /// Touch an activity marker on a host.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Core` if an agent-scoped source is given
    /// without an agent.
    async fn record_activity(
        &self,
        host: &HostRef,
        source: ActivitySource,
        agent: Option<&AgentId>,
    ) -> Result<()>;

    /// Register a new agent on a host.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::AgentExists` if the name is already used on the
    /// host.
    async fn register_agent(&self, host: &HostRef, agent: NewAgent) -> Result<Agent>;
}

/// The host lifecycle controller.
#[derive(Debug, Clone)]
pub struct HostController {
    ctx: Arc<InvocationContext>,
    reconciler: Reconciler,
}

impl HostController {
    /// Create a controller over an invocation context.
    #[must_use]
    pub fn new(ctx: Arc<InvocationContext>) -> Self {
        let reconciler = Reconciler::new(Arc::clone(&ctx));
        Self { ctx, reconciler }
    }

    /// The reconciler this controller reads through.
    #[must_use]
    pub const fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Take the host's lock and re-read it.
    ///
    /// A host its instance no longer reports is treated as destroyed.
    pub(crate) async fn lock(
        &self,
        reference: &HostRef,
        purpose: &str,
    ) -> Result<(HostLockGuard, HostView, Arc<dyn ProviderInstance>)> {
        let (view, provider) = self.reconciler.resolve(reference).await?;
        let guard = self.ctx.locks().acquire(view.id(), purpose).await?;
        let current = match self.reconciler.refresh(&view).await? {
            Some(current) => current,
            None => {
                let gone = view.with_state(HostState::Destroyed);
                self.ctx.cache_host(gone.clone());
                gone
            }
        };
        Ok((guard, current, provider))
    }

    async fn access_if_live(
        &self,
        view: &HostView,
        provider: &dyn ProviderInstance,
    ) -> Option<Arc<dyn HostAccess>> {
        if !view.state().is_live() {
            return None;
        }
        match provider.host_access(view.id()).await {
            Ok(access) => Some(access),
            Err(e) => {
                tracing::warn!(host_id = %view.id(), error = %e, "Host not accessible for hooks");
                None
            }
        }
    }

    async fn run_hooks(&self, point: HookPoint, view: &HostView, provider: &dyn ProviderInstance) {
        if self.ctx.hooks().is_empty() {
            return;
        }
        let access = self.access_if_live(view, provider).await;
        let failures = self.ctx.hooks().run(point, view, access.as_deref()).await;
        if !failures.is_empty() {
            tracing::debug!(point = %point, failed = failures.len(), "Hooks failed");
        }
    }

    fn on_host(view: &HostView, source: ProviderError) -> ControlError {
        ControlError::host_operation(*view.id(), view.name(), view.provider_instance_name(), source)
    }

    fn unsupported(view: &HostView, operation: &'static str) -> ControlError {
        ControlError::Unsupported {
            host_id: *view.id(),
            host_name: view.name().clone(),
            instance: view.provider_instance_name().to_string(),
            operation,
        }
    }

    fn online(view: HostView) -> Result<Host> {
        match view {
            HostView::Online(host) => Ok(host),
            HostView::Offline(host) => Err(ControlError::NotLive {
                host_id: host.id,
                host_name: host.name,
                state: host.state,
            }),
        }
    }

    /// Stop a host whose lock is held.
    async fn stop_locked(
        &self,
        current: &HostView,
        provider: &dyn ProviderInstance,
        create_snapshot: bool,
        timeout: Duration,
    ) -> Result<HostView> {
        lifecycle::validate_transition(
            current.id(),
            current.name(),
            current.state(),
            HostState::Stopping,
        )?;
        self.run_hooks(HookPoint::BeforeHostStopped, current, provider)
            .await;

        let caps = provider.capabilities();
        if create_snapshot {
            if caps.supports_snapshots && current.state().can_snapshot() {
                let name = format!("stop-{}", Utc::now().format("%Y%m%dT%H%M%SZ"));
                let snapshot = provider
                    .create_snapshot(current.id(), &name)
                    .await
                    .map_err(|e| Self::on_host(current, e))?;
                tracing::info!(host_id = %current.id(), snapshot_id = %snapshot.id, "Snapshot taken before stop");
            } else {
                tracing::warn!(
                    host_id = %current.id(),
                    host_name = %current.name(),
                    state = %current.state(),
                    supports_snapshots = caps.supports_snapshots,
                    "Skipping snapshot before stop"
                );
            }
        }

        let stopped = if caps.supports_shutdown_hosts {
            tokio::time::timeout(timeout, provider.stop_host(current.id(), timeout)).await
        } else {
            tokio::time::timeout(timeout, provider.terminate_host(current.id())).await
        };
        match stopped {
            Ok(result) => result.map_err(|e| Self::on_host(current, e))?,
            Err(_elapsed) => {
                return Err(ControlError::Timeout {
                    host_id: *current.id(),
                    host_name: current.name().clone(),
                    operation: "stop_host",
                })
            }
        }

        let view = current.clone().with_state(HostState::Stopped);
        self.ctx.cache_host(view.clone());
        tracing::info!(
            host_id = %current.id(),
            host_name = %current.name(),
            provider = current.provider_instance_name(),
            native = caps.supports_shutdown_hosts,
            "Stopped host"
        );
        Ok(view)
    }

    fn record_failure(&self, request: &CreateHostRequest, instance: &str, error: &ProviderError) -> Result<HostView> {
        let (reason, build_log) = match error {
            ProviderError::CreateFailed {
                reason, build_log, ..
            } => (reason.clone(), build_log.clone()),
            other => (other.to_string(), String::new()),
        };
        let mut record = DurableRecord::new(request.certified_data(), instance, HostState::Failed);
        record.failure = Some(FailureRecord::new(reason, build_log));
        self.ctx.store().put_record(&record)?;
        Ok(HostView::from_record(&record))
    }

    fn forget_record(&self, host_id: &HostId) -> Result<()> {
        match self.ctx.store().delete_record(host_id) {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn resume(&self, current: &HostView, provider: &dyn ProviderInstance) -> Result<HostView> {
        if provider.capabilities().supports_resume {
            provider
                .resume_host(current.id())
                .await
                .map_err(|e| Self::on_host(current, e))?;
        } else {
            provider
                .start_host(current.id(), None)
                .await
                .map_err(|e| Self::on_host(current, e))?;
        }
        let view = self
            .reconciler
            .refresh(current)
            .await?
            .unwrap_or_else(|| current.clone().with_state(HostState::Destroyed));
        tracing::info!(host_id = %current.id(), host_name = %current.name(), state = %view.state(), "Resumed paused host");
        Ok(view)
    }
}

#[async_trait]
impl HostLifecycle for HostController {
    async fn create_host(&self, provider: &str, name: HostName, build: BuildConfig) -> Result<Host> {
        let instance = self.ctx.provider(provider)?;

        // Held until the host exists, so a concurrent create sees it in discovery.
        let _name_guard = self.ctx.locks().acquire_name(&name, "create").await?;
        let listing = self.reconciler.list_hosts().await;
        if let Some(existing) = listing
            .hosts
            .iter()
            .find(|h| h.name() == &name && occupies_name(h.state()))
        {
            return Err(ControlError::NameTaken {
                name,
                host_id: *existing.id(),
            });
        }
        if !listing.errors.is_empty() {
            tracing::warn!(
                host_name = %name,
                unchecked = listing.errors.len(),
                "Some provider instances could not be checked for name conflicts"
            );
        }

        let request = CreateHostRequest {
            host_id: HostId::generate(),
            host_name: name,
            build,
        };
        let _guard = self.ctx.locks().acquire(&request.host_id, "create").await?;
        tracing::info!(
            host_id = %request.host_id,
            host_name = %request.host_name,
            provider = %provider,
            "Creating host"
        );

        let created = match instance.create_host(&request).await {
            Ok(created) => created,
            Err(e) => {
                let failed = self.record_failure(&request, provider, &e)?;
                self.ctx.cache_host(failed);
                tracing::error!(
                    host_id = %request.host_id,
                    host_name = %request.host_name,
                    provider = %provider,
                    error = %e,
                    "Host creation failed"
                );
                return Err(ControlError::CreateFailed {
                    host_id: request.host_id,
                    host_name: request.host_name,
                    instance: provider.to_string(),
                    reason: e.to_string(),
                    source: e,
                });
            }
        };

        let view = HostView::from_provider(provider, created);
        self.ctx.cache_host(view.clone());
        self.run_hooks(HookPoint::AfterHostCreated, &view, instance.as_ref())
            .await;
        tracing::info!(host_id = %view.id(), host_name = %view.name(), "Created host");
        Self::online(view)
    }

    async fn stop_host(
        &self,
        host: &HostRef,
        create_snapshot: bool,
        timeout: Duration,
    ) -> Result<StopOutcome> {
        let (_guard, current, provider) = self.lock(host, "stop").await?;

        if current.state().is_terminal() {
            if create_snapshot {
                tracing::info!(host_id = %current.id(), "Host already destroyed; nothing to stop");
                return Ok(StopOutcome::AlreadyGone);
            }
            lifecycle::validate_transition(
                current.id(),
                current.name(),
                current.state(),
                HostState::Stopping,
            )?;
        }
        if lifecycle::is_stopped(current.state()) {
            return Ok(StopOutcome::Stopped(current));
        }

        let view = self
            .stop_locked(&current, provider.as_ref(), create_snapshot, timeout)
            .await?;
        Ok(StopOutcome::Stopped(view))
    }

    async fn start_host(&self, host: &HostRef, snapshot: Option<&SnapshotId>) -> Result<Host> {
        let (_guard, mut current, provider) = self.lock(host, "start").await?;
        if current.state().is_terminal() {
            lifecycle::validate_transition(
                current.id(),
                current.name(),
                current.state(),
                HostState::Starting,
            )?;
        }

        if let Some(snapshot_id) = snapshot {
            if !provider.capabilities().supports_snapshots {
                return Err(Self::unsupported(&current, "start_host from snapshot"));
            }
            let listed = provider
                .list_snapshots(current.id())
                .await
                .map_err(|e| Self::on_host(&current, e))?;
            if !listed.iter().any(|s| &s.id == snapshot_id) {
                return Err(ControlError::SnapshotNotFound {
                    snapshot_id: snapshot_id.clone(),
                    host_id: *current.id(),
                    host_name: current.name().clone(),
                });
            }
        }

        match (current.state(), snapshot) {
            (HostState::Running, None) => return Self::online(current),
            (HostState::Paused, None) => {
                let view = self.resume(&current, provider.as_ref()).await?;
                return Self::online(view);
            }
            (HostState::Running | HostState::Paused, Some(_)) => {
                current = self
                    .stop_locked(&current, provider.as_ref(), false, INTERNAL_STOP_TIMEOUT)
                    .await?;
            }
            _ => {}
        }
        lifecycle::validate_transition(
            current.id(),
            current.name(),
            current.state(),
            HostState::Starting,
        )?;

        tracing::info!(
            host_id = %current.id(),
            host_name = %current.name(),
            snapshot = snapshot.map(SnapshotId::as_str),
            "Starting host"
        );
        let started = provider
            .start_host(current.id(), snapshot)
            .await
            .map_err(|e| Self::on_host(&current, e))?;
        let view = HostView::from_provider(current.provider_instance_name(), started);
        self.ctx.cache_host(view.clone());
        self.run_hooks(HookPoint::AfterHostStarted, &view, provider.as_ref())
            .await;
        Self::online(view)
    }

    async fn destroy_host(&self, host: &HostRef, delete_snapshots: bool) -> Result<()> {
        let (_guard, current, provider) = self.lock(host, "destroy").await?;
        lifecycle::validate_transition(
            current.id(),
            current.name(),
            current.state(),
            HostState::Destroyed,
        )?;
        if !provider.capabilities().can_destroy {
            return Err(Self::unsupported(&current, "destroy_host"));
        }

        self.run_hooks(HookPoint::BeforeHostDestroyed, &current, provider.as_ref())
            .await;
        if lifecycle::needs_stop_before_destroy(current.state()) {
            self.stop_locked(&current, provider.as_ref(), false, INTERNAL_STOP_TIMEOUT)
                .await?;
        }

        provider
            .destroy_host(current.id(), delete_snapshots)
            .await
            .map_err(|e| Self::on_host(&current, e))?;
        self.forget_record(current.id())?;
        self.ctx
            .cache_host(current.clone().with_state(HostState::Destroyed));

        tracing::info!(
            host_id = %current.id(),
            host_name = %current.name(),
            delete_snapshots,
            "Destroyed host"
        );
        Ok(())
    }

    async fn ensure_live(&self, host: &HostRef) -> Result<Host> {
        let view = self.reconciler.get_host(host).await?;
        match view.state() {
            HostState::Running => Self::online(view),
            HostState::Paused => {
                let (_guard, current, provider) = self.lock(host, "resume").await?;
                if current.state() == HostState::Paused {
                    Self::online(self.resume(&current, provider.as_ref()).await?)
                } else {
                    Self::online(current)
                }
            }
            _ => Self::online(view),
        }
    }

    async fn record_activity(
        &self,
        host: &HostRef,
        source: ActivitySource,
        agent: Option<&AgentId>,
    ) -> Result<()> {
        let path = match (source.scope(), agent) {
            (ActivityScope::Host, _) => layout::host_marker(source),
            (ActivityScope::Agent, Some(agent_id)) => layout::agent_marker(agent_id, source),
            (ActivityScope::Agent, None) => {
                return Err(CoreError::InvalidValue(format!(
                    "activity source {source} is agent-scoped and needs an agent id"
                ))
                .into())
            }
        };

        let live = self.ensure_live(host).await?;
        let provider = self.ctx.provider_for_host(&live)?;
        let on_host = |e: ProviderError| {
            ControlError::host_operation(live.id, &live.name, &live.provider_instance_name, e)
        };
        let access = provider.host_access(&live.id).await.map_err(on_host)?;
        access
            .write_file(&path, Utc::now().to_rfc3339().as_bytes(), false)
            .await
            .map_err(on_host)?;
        tracing::trace!(host_id = %live.id, source = %source, "Recorded activity");
        Ok(())
    }

    async fn register_agent(&self, host: &HostRef, agent: NewAgent) -> Result<Agent> {
        let live = self.ensure_live(host).await?;
        let _guard = self.ctx.locks().acquire(&live.id, "register-agent").await?;

        let existing = self.reconciler.list_agents(&live).await?;
        if existing.iter().any(|a| a.name == agent.name) {
            return Err(ControlError::AgentExists {
                agent: agent.name,
                host_id: live.id,
                host_name: live.name,
            });
        }

        let record = AgentRecord {
            id: AgentId::generate(),
            name: agent.name,
            agent_type: agent.agent_type,
            work_dir: agent.work_dir,
            host_id: live.id,
            create_time: Utc::now(),
            permissions: agent.permissions,
            labels: agent.labels,
        };

        let provider = self.ctx.provider_for_host(&live)?;
        let on_host = |e: ProviderError| {
            ControlError::host_operation(live.id, &live.name, &live.provider_instance_name, e)
        };
        let access = provider.host_access(&live.id).await.map_err(on_host)?;
        let data = serde_json::to_vec_pretty(&record).map_err(CoreError::from)?;
        access
            .write_file(&layout::agent_data(&record.id), &data, false)
            .await
            .map_err(on_host)?;
        access
            .write_file(
                &layout::agent_marker(&record.id, ActivitySource::Create),
                record.create_time.to_rfc3339().as_bytes(),
                false,
            )
            .await
            .map_err(on_host)?;

        if self.ctx.store().get_record(&live.id)?.is_some() {
            self.ctx.store().put_agent(&record)?;
        }

        tracing::info!(
            host_id = %live.id,
            agent_id = %record.id,
            agent_name = %record.name,
            "Registered agent"
        );
        Ok(Agent::from_record(record, AgentObservedState::Stopped))
    }
}
