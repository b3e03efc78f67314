//! Durable Record Store for mng.
//!
//! Some backends cannot answer "what hosts exist" on their own after a
//! restart (plain SSH machines, cloud sandboxes that vanish when terminated).
//! For those, the provider mirrors each host's certified data, connection
//! details, and snapshot list into a record file keyed by `HostId`.
//!
//! Reads are lock-free. Every write must happen while holding the host's
//! advisory lock from [`HostLocks`].
//!
//! # Example
//!
//! ```no_run
//! use mng_store::{FileStore, LockConfig, Store};
//!
//! let store = FileStore::open("/tmp/mng-store", LockConfig::default()).unwrap();
//! for record in store.list_records().unwrap() {
//!     println!("{} {}", record.host_id(), record.state);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod file;
pub mod lock;
pub mod types;

pub use error::{LockError, Result, StoreError};
pub use file::FileStore;
pub use lock::{HostLockGuard, HostLocks, LockConfig};
pub use types::{
    AgentRecord, CertifiedHostData, DurableRecord, FailureRecord, SnapshotRecord, SshInfo,
};

use mng_core::{AgentId, HostId, HostState};

/// The storage trait defining all record operations.
///
/// This trait abstracts the storage layer so providers and tests can swap the
/// backing directory or implementation.
pub trait Store: Send + Sync {
    // =========================================================================
    // Host Records
    // =========================================================================

    /// Insert or replace a host record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn put_record(&self, record: &DurableRecord) -> Result<()>;

    /// Get a host record by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read.
    fn get_record(&self, host_id: &HostId) -> Result<Option<DurableRecord>>;

    /// Delete a host record together with its agent records.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the record doesn't exist.
    fn delete_record(&self, host_id: &HostId) -> Result<()>;

    /// List every host record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the record directory cannot be read.
    fn list_records(&self) -> Result<Vec<DurableRecord>>;

    /// List host records owned by one provider instance, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the record directory cannot be read.
    fn list_records_by_instance(&self, instance: &str) -> Result<Vec<DurableRecord>> {
        Ok(self
            .list_records()?
            .into_iter()
            .filter(|r| r.provider_instance_name == instance)
            .collect())
    }

    /// Update only the last-known state of a host.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the record doesn't exist.
    fn update_state(&self, host_id: &HostId, state: HostState) -> Result<()>;

    // =========================================================================
    // Agent Records
    // =========================================================================

    /// Insert or replace an agent record under its host.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn put_agent(&self, agent: &AgentRecord) -> Result<()>;

    /// List agent records of a host, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent directory cannot be read.
    fn list_agents(&self, host_id: &HostId) -> Result<Vec<AgentRecord>>;

    /// Delete one agent record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the record doesn't exist.
    fn delete_agent(&self, host_id: &HostId, agent_id: &AgentId) -> Result<()>;
}
