//! Snapshot management.
//!
//! Snapshots are crash-consistent: a capture is equivalent to a hard power
//! cycle, and writes in flight at that instant may be missing. Callers that
//! need more flush their own state before calling [`SnapshotManager::create_snapshot`].
//!
//! Store-backed provider instances keep the snapshot list of their durable
//! records in step with these calls; the manager holds the host's lock
//! around every capture and deletion so those writes never interleave.

use chrono::Utc;
use mng_core::{HostRef, HostState, SnapshotId};
use mng_provider::ProviderError;
use mng_store::SnapshotRecord;

use crate::controller::{HostController, HostLifecycle};
use crate::error::{ControlError, Result};
use crate::types::HostView;

/// Captures, lists, and deletes host snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    controller: HostController,
}

impl SnapshotManager {
    /// Create a manager that locks and resolves hosts through `controller`.
    #[must_use]
    pub const fn new(controller: HostController) -> Self {
        Self { controller }
    }

    fn on_host(view: &HostView, source: ProviderError) -> ControlError {
        ControlError::host_operation(*view.id(), view.name(), view.provider_instance_name(), source)
    }

    /// Capture a snapshot of a running host and wait until it is durable.
    ///
    /// A paused host is resumed first. Without a name one is derived from
    /// the current time.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Unsupported` if the host's provider instance
    /// cannot snapshot, or `ControlError::NotLive` if the host is not running.
    pub async fn create_snapshot(&self, host: &HostRef, name: Option<String>) -> Result<SnapshotId> {
        self.controller.ensure_live(host).await?;
        let (_guard, current, provider) = self.controller.lock(host, "snapshot").await?;

        if !provider.capabilities().supports_snapshots {
            return Err(ControlError::Unsupported {
                host_id: *current.id(),
                host_name: current.name().clone(),
                instance: current.provider_instance_name().to_string(),
                operation: "create_snapshot",
            });
        }
        if !current.state().can_snapshot() {
            return Err(ControlError::NotLive {
                host_id: *current.id(),
                host_name: current.name().clone(),
                state: current.state(),
            });
        }

        let name = name.unwrap_or_else(|| format!("snapshot-{}", Utc::now().format("%Y%m%dT%H%M%SZ")));
        let snapshot = provider
            .create_snapshot(current.id(), &name)
            .await
            .map_err(|e| Self::on_host(&current, e))?;

        tracing::info!(
            host_id = %current.id(),
            host_name = %current.name(),
            snapshot_id = %snapshot.id,
            snapshot_name = %snapshot.name,
            "Created snapshot"
        );
        Ok(snapshot.id)
    }

    /// Snapshots of a host in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be found or its instance fails.
    pub async fn list_snapshots(&self, host: &HostRef) -> Result<Vec<SnapshotRecord>> {
        let view = self.controller.reconciler().get_host(host).await?;
        if view.state().is_terminal() {
            return Ok(Vec::new());
        }
        let provider = self.controller.reconciler().context().provider_for_view(&view)?;
        let mut snapshots = provider
            .list_snapshots(view.id())
            .await
            .map_err(|e| Self::on_host(&view, e))?;
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(snapshots)
    }

    /// Remove a snapshot from the host's listing.
    ///
    /// Returns whether the backing storage was deleted too; instances
    /// without explicit deletion leave that to their retention policy.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::SnapshotNotFound` if the snapshot is not listed
    /// for the host.
    pub async fn delete_snapshot(&self, host: &HostRef, snapshot_id: &SnapshotId) -> Result<bool> {
        let (_guard, current, provider) = self.controller.lock(host, "delete-snapshot").await?;
        if current.state() == HostState::Destroyed {
            return Err(ControlError::SnapshotNotFound {
                snapshot_id: snapshot_id.clone(),
                host_id: *current.id(),
                host_name: current.name().clone(),
            });
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

        let storage_deleted = provider
            .delete_snapshot(current.id(), snapshot_id)
            .await
            .map_err(|e| Self::on_host(&current, e))?;
        tracing::info!(
            host_id = %current.id(),
            snapshot_id = %snapshot_id,
            storage_deleted,
            "Deleted snapshot"
        );
        Ok(storage_deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::config::MngConfig;
    use crate::context::InvocationContext;
    use mng_provider::{BuildConfig, MockProvider, ProviderCapabilities, ProviderInstance};
    use mng_store::FileStore;
    use tempfile::TempDir;

    async fn setup(capabilities: ProviderCapabilities) -> (SnapshotManager, HostRef, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path().join("store"), Default::default()).unwrap());
        let mock: Arc<dyn ProviderInstance> =
            Arc::new(MockProvider::new("mock", dir.path().join("mock"), capabilities));
        let ctx = Arc::new(InvocationContext::new(MngConfig::default(), store, vec![mock]).unwrap());
        let controller = HostController::new(ctx);
        let host = controller
            .create_host("mock", "snappy".parse().unwrap(), BuildConfig::default())
            .await
            .unwrap();
        (SnapshotManager::new(controller), HostRef::Id(host.id), dir)
    }

    #[tokio::test]
    async fn snapshots_list_in_creation_order() {
        let (manager, host, _dir) = setup(MockProvider::full_capabilities()).await;
        let first = manager.create_snapshot(&host, Some("first".into())).await.unwrap();
        let second = manager.create_snapshot(&host, None).await.unwrap();

        let listed = manager.list_snapshots(&host).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec![first.clone(), second]);
        assert_eq!(listed[0].name, "first");

        assert!(manager.delete_snapshot(&host, &first).await.unwrap());
        assert_eq!(manager.list_snapshots(&host).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_unknown_snapshot_fails() {
        let (manager, host, _dir) = setup(MockProvider::full_capabilities()).await;
        let err = manager
            .delete_snapshot(&host, &SnapshotId::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::SnapshotNotFound { .. }));
    }

    #[tokio::test]
    async fn retention_only_backends_keep_storage() {
        let caps = ProviderCapabilities {
            supports_snapshot_deletion: false,
            ..MockProvider::full_capabilities()
        };
        let (manager, host, _dir) = setup(caps).await;
        let id = manager.create_snapshot(&host, None).await.unwrap();

        assert!(!manager.delete_snapshot(&host, &id).await.unwrap());
        assert!(manager.list_snapshots(&host).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_requires_capability() {
        let (manager, host, _dir) = setup(ProviderCapabilities::minimal()).await;
        let err = manager.create_snapshot(&host, None).await.unwrap_err();
        assert!(matches!(err, ControlError::Unsupported { operation: "create_snapshot", .. }));
        assert!(err.requires_user_fix());
    }
}
