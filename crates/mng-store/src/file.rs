//! File-backed storage implementation.
//!
//! Layout under the store root:
//!
//! ```text
//! hosts/<host_id>.json                   durable record
//! hosts/<host_id>/agents/<agent_id>.json agent records
//! locks/<host_id>.lock                   advisory locks
//! ```
//!
//! Writes go through a temp file in the same directory followed by an atomic
//! rename, so lock-free readers never observe a torn record.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use mng_core::{AgentId, HostId, HostState};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{Result, StoreError};
use crate::lock::{HostLocks, LockConfig};
use crate::types::{AgentRecord, DurableRecord};
use crate::Store;

const HOSTS_DIR: &str = "hosts";
const AGENTS_DIR: &str = "agents";
const LOCKS_DIR: &str = "locks";

/// Directory-backed [`Store`].
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    locks: HostLocks,
}

impl FileStore {
    /// Open or create a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory layout cannot be created.
    pub fn open(root: impl Into<PathBuf>, lock_config: LockConfig) -> Result<Self> {
        let root = root.into();
        let hosts = root.join(HOSTS_DIR);
        fs::create_dir_all(&hosts).map_err(|e| StoreError::io(&hosts, e))?;
        let locks = HostLocks::new(root.join(LOCKS_DIR), lock_config);
        tracing::debug!(root = %root.display(), "Opened durable record store");
        Ok(Self { root, locks })
    }

    /// The store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-host locks living alongside the records.
    #[must_use]
    pub const fn locks(&self) -> &HostLocks {
        &self.locks
    }

    fn record_path(&self, host_id: &HostId) -> PathBuf {
        self.root.join(HOSTS_DIR).join(format!("{host_id}.json"))
    }

    fn host_dir(&self, host_id: &HostId) -> PathBuf {
        self.root.join(HOSTS_DIR).join(host_id.to_string())
    }

    fn agents_dir(&self, host_id: &HostId) -> PathBuf {
        self.host_dir(host_id).join(AGENTS_DIR)
    }

    fn agent_path(&self, host_id: &HostId, agent_id: &AgentId) -> PathBuf {
        self.agents_dir(host_id).join(format!("{agent_id}.json"))
    }

    /// Serialize `value` to `path` atomically.
    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::io(path, ErrorKind::InvalidInput.into()))?;
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let body = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialization {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
        tmp.write_all(&body)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
        Ok(())
    }

    /// Read and deserialize `path`, returning `None` if it does not exist.
    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StoreError::Serialization {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    /// Deserialize every `*.json` file directly inside `dir`.
    ///
    /// Malformed files are logged and skipped so one bad record cannot hide
    /// every other host from discovery.
    fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let mut out = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read_json(&path) {
                Ok(Some(value)) => out.push(value),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        Ok(out)
    }
}

impl Store for FileStore {
    fn put_record(&self, record: &DurableRecord) -> Result<()> {
        let path = self.record_path(record.host_id());
        Self::write_json(&path, record)?;
        tracing::debug!(
            host_id = %record.host_id(),
            host_name = %record.host_name(),
            state = %record.state,
            "Wrote durable record"
        );
        Ok(())
    }

    fn get_record(&self, host_id: &HostId) -> Result<Option<DurableRecord>> {
        Self::read_json(&self.record_path(host_id))
    }

    fn delete_record(&self, host_id: &HostId) -> Result<()> {
        let path = self.record_path(host_id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound(*host_id)),
            Err(e) => return Err(StoreError::io(&path, e)),
        }

        let host_dir = self.host_dir(host_id);
        match fs::remove_dir_all(&host_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&host_dir, e)),
        }
        tracing::debug!(host_id = %host_id, "Deleted durable record");
        Ok(())
    }

    fn list_records(&self) -> Result<Vec<DurableRecord>> {
        let mut records: Vec<DurableRecord> = Self::read_all(&self.root.join(HOSTS_DIR))?;
        records.sort_by(|a, b| {
            a.certified
                .created_at
                .cmp(&b.certified.created_at)
                .then_with(|| a.host_id().cmp(b.host_id()))
        });
        Ok(records)
    }

    fn update_state(&self, host_id: &HostId, state: HostState) -> Result<()> {
        let mut record = self
            .get_record(host_id)?
            .ok_or(StoreError::NotFound(*host_id))?;
        record.state = state;
        record.updated_at = chrono::Utc::now();
        self.put_record(&record)
    }

    fn put_agent(&self, agent: &AgentRecord) -> Result<()> {
        Self::write_json(&self.agent_path(&agent.host_id, &agent.id), agent)
    }

    fn list_agents(&self, host_id: &HostId) -> Result<Vec<AgentRecord>> {
        let mut agents: Vec<AgentRecord> = Self::read_all(&self.agents_dir(host_id))?;
        agents.sort_by(|a, b| a.create_time.cmp(&b.create_time).then_with(|| a.id.cmp(&b.id)));
        Ok(agents)
    }

    fn delete_agent(&self, host_id: &HostId, agent_id: &AgentId) -> Result<()> {
        let path = self.agent_path(host_id, agent_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(*host_id)),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CertifiedHostData, SnapshotRecord};
    use chrono::{Duration, Utc};
    use mng_core::{ActivityConfig, SnapshotId};
    use tempfile::TempDir;

    fn create_test_store() -> (FileStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), LockConfig::default()).unwrap();
        (store, dir)
    }

    fn create_test_record(name: &str, instance: &str) -> DurableRecord {
        let certified = CertifiedHostData::new(
            HostId::generate(),
            name.parse().unwrap(),
            ActivityConfig::default(),
        );
        DurableRecord::new(certified, instance, HostState::Running)
    }

    fn create_test_agent(host_id: HostId, name: &str) -> AgentRecord {
        AgentRecord {
            id: AgentId::generate(),
            name: name.parse().unwrap(),
            agent_type: "shell".to_string(),
            work_dir: PathBuf::from("/work"),
            host_id,
            create_time: Utc::now(),
            permissions: Vec::new(),
            labels: std::collections::BTreeMap::new(),
        }
    }

    #[test]
    fn record_crud() {
        let (store, _dir) = create_test_store();
        let mut record = create_test_record("dev", "ssh");

        store.put_record(&record).unwrap();
        assert_eq!(store.get_record(record.host_id()).unwrap().unwrap(), record);

        record.snapshots.push(SnapshotRecord {
            id: SnapshotId::new("snap-1"),
            name: "first".to_string(),
            host_id: *record.host_id(),
            created_at: Utc::now(),
        });
        store.put_record(&record).unwrap();
        let stored = store.get_record(record.host_id()).unwrap().unwrap();
        assert_eq!(stored.snapshots.len(), 1);

        store.update_state(record.host_id(), HostState::Stopped).unwrap();
        let stored = store.get_record(record.host_id()).unwrap().unwrap();
        assert_eq!(stored.state, HostState::Stopped);

        store.delete_record(record.host_id()).unwrap();
        assert!(store.get_record(record.host_id()).unwrap().is_none());
    }

    #[test]
    fn delete_missing_record_is_not_found() {
        let (store, _dir) = create_test_store();
        let err = store.delete_record(&HostId::generate()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn list_is_ordered_by_creation() {
        let (store, _dir) = create_test_store();
        let mut older = create_test_record("older", "ssh");
        older.certified.created_at = Utc::now() - Duration::hours(1);
        let newer = create_test_record("newer", "cloud");

        store.put_record(&newer).unwrap();
        store.put_record(&older).unwrap();

        let names: Vec<_> = store
            .list_records()
            .unwrap()
            .into_iter()
            .map(|r| r.certified.host_name.to_string())
            .collect();
        assert_eq!(names, vec!["older", "newer"]);

        let ssh_only = store.list_records_by_instance("ssh").unwrap();
        assert_eq!(ssh_only.len(), 1);
    }

    #[test]
    fn malformed_records_are_skipped() {
        let (store, dir) = create_test_store();
        store.put_record(&create_test_record("good", "ssh")).unwrap();
        fs::write(dir.path().join("hosts/garbage.json"), b"{not json").unwrap();

        assert_eq!(store.list_records().unwrap().len(), 1);
    }

    #[test]
    fn agents_are_removed_with_their_host() {
        let (store, _dir) = create_test_store();
        let record = create_test_record("dev", "ssh");
        store.put_record(&record).unwrap();

        let agent = create_test_agent(*record.host_id(), "worker");
        store.put_agent(&agent).unwrap();
        assert_eq!(store.list_agents(record.host_id()).unwrap(), vec![agent]);

        store.delete_record(record.host_id()).unwrap();
        assert!(store.list_agents(record.host_id()).unwrap().is_empty());
    }
}
