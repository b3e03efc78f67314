//! Advisory per-host file locks.
//!
//! A lock is a file at `<dir>/<host_id>.lock` created with `O_EXCL`
//! semantics. Creation additionally takes a lock on the host name,
//! `<dir>/name-<host_name>.lock`, held across the uniqueness check. Its content records the holder so a lock left behind by a
//! crashed invocation can be broken once it is older than the stale window.
//! Breaking renames the file to a private tombstone first, so two
//! invocations breaking the same stale lock cannot remove a fresh holder's.
//! Acquisition polls until a bounded wait elapses and then fails with a
//! retriable [`LockError::Timeout`].

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mng_core::{HostId, HostName};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LockError;

/// Timing parameters for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// Maximum time to wait for a contended lock.
    pub wait: Duration,
    /// Age after which an existing lock is considered abandoned.
    pub stale_after: Duration,
    /// Delay between acquisition attempts.
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(30),
            stale_after: Duration::from_secs(600),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    token: Uuid,
    pid: u32,
    purpose: String,
    acquired_at: DateTime<Utc>,
}

/// Hands out per-host locks rooted at one directory.
#[derive(Debug, Clone)]
pub struct HostLocks {
    dir: PathBuf,
    config: LockConfig,
}

impl HostLocks {
    /// Create a lock manager storing lock files in `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, config: LockConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
        }
    }

    /// The lock timing configuration.
    #[must_use]
    pub const fn config(&self) -> &LockConfig {
        &self.config
    }

    fn path_for(&self, host_id: &HostId) -> PathBuf {
        self.dir.join(format!("{host_id}.lock"))
    }

    fn name_path_for(&self, host_name: &HostName) -> PathBuf {
        self.dir.join(format!("name-{host_name}.lock"))
    }

    /// Acquire the lock for `host_id`, waiting up to the configured bound.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Timeout` if the lock is still held when the wait
    /// elapses, or `LockError::Io` if the lock directory is unusable.
    pub async fn acquire(&self, host_id: &HostId, purpose: &str) -> Result<HostLockGuard, LockError> {
        let path = self.path_for(host_id);
        self.acquire_path(&path, &host_id.to_string(), purpose, |waited| LockError::Timeout {
            host_id: *host_id,
            waited,
        })
        .await
    }

    /// Acquire the lock reserving `host_name` while a host is created under it.
    ///
    /// # Errors
    ///
    /// Returns `LockError::NameTimeout` if another creation holds the name
    /// when the wait elapses, or `LockError::Io` if the lock directory is
    /// unusable.
    pub async fn acquire_name(
        &self,
        host_name: &HostName,
        purpose: &str,
    ) -> Result<HostLockGuard, LockError> {
        let path = self.name_path_for(host_name);
        self.acquire_path(&path, &format!("name {host_name}"), purpose, |waited| {
            LockError::NameTimeout {
                host_name: host_name.clone(),
                waited,
            }
        })
        .await
    }

    async fn acquire_path(
        &self,
        path: &Path,
        subject: &str,
        purpose: &str,
        timed_out: impl FnOnce(Duration) -> LockError + Send,
    ) -> Result<HostLockGuard, LockError> {
        let started = tokio::time::Instant::now();
        loop {
            if let Some(guard) = self.try_acquire_path(path, subject, purpose)? {
                return Ok(guard);
            }

            let waited = started.elapsed();
            if waited >= self.config.wait {
                tracing::warn!(lock = subject, ?waited, "Timed out waiting for host lock");
                return Err(timed_out(waited));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Try once to acquire the lock for `host_id`.
    ///
    /// Returns `Ok(None)` if another holder has it and the lock is not stale.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Io` if the lock file cannot be created or inspected.
    pub fn try_acquire(
        &self,
        host_id: &HostId,
        purpose: &str,
    ) -> Result<Option<HostLockGuard>, LockError> {
        self.try_acquire_path(&self.path_for(host_id), &host_id.to_string(), purpose)
    }

    fn try_acquire_path(
        &self,
        path: &Path,
        subject: &str,
        purpose: &str,
    ) -> Result<Option<HostLockGuard>, LockError> {
        fs::create_dir_all(&self.dir).map_err(|source| LockError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = path.to_path_buf();
        let info = LockInfo {
            token: Uuid::new_v4(),
            pid: std::process::id(),
            purpose: purpose.to_string(),
            acquired_at: Utc::now(),
        };

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                serde_json::to_vec(&info)
                    .map_err(std::io::Error::from)
                    .and_then(|body| file.write_all(&body))
                    .and_then(|()| file.sync_all())
                    .map_err(|source| LockError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing::debug!(lock = subject, purpose, "Acquired host lock");
                Ok(Some(HostLockGuard {
                    path,
                    token: info.token,
                    subject: subject.to_string(),
                }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if self.break_if_stale(&path)? {
                    return self.try_acquire_path(&path, subject, purpose);
                }
                Ok(None)
            }
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    /// Remove the lock at `path` if its holder is older than the stale window.
    fn break_if_stale(&self, path: &Path) -> Result<bool, LockError> {
        let Some(age) = lock_age(path)? else {
            // Holder released it between our create attempt and now.
            return Ok(true);
        };
        if age < self.config.stale_after {
            return Ok(false);
        }

        let holder = read_info(path);
        let broken = retire(path, holder.as_ref())?;
        if broken {
            tracing::warn!(
                path = %path.display(),
                ?age,
                holder_pid = holder.as_ref().map(|h| h.pid),
                holder_purpose = holder.as_ref().map(|h| h.purpose.as_str()),
                "Broke stale host lock"
            );
        }
        Ok(broken)
    }
}

/// Move the lock at `path` aside and delete it if it still belongs to
/// `expected`, the holder judged stale.
///
/// If the file was replaced by a new holder after it was judged stale, the
/// new holder's file is linked back into place and `false` is returned.
fn retire(path: &Path, expected: Option<&LockInfo>) -> Result<bool, LockError> {
    let tombstone = path.with_extension(format!("stale-{}", Uuid::new_v4()));
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    let moved = read_info(&tombstone);
    let same_holder = match (expected, moved.as_ref()) {
        (Some(expected), Some(moved)) => expected.token == moved.token,
        (None, None) => true,
        _ => false,
    };
    if !same_holder {
        match fs::hard_link(&tombstone, path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::warn!(path = %path.display(), "Lock was re-taken while restoring a live holder");
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
    if let Err(e) = fs::remove_file(&tombstone) {
        tracing::debug!(path = %tombstone.display(), error = %e, "Failed to remove lock tombstone");
    }
    Ok(same_holder)
}

/// Age of a lock file, preferring the recorded acquisition time over mtime.
fn lock_age(path: &Path) -> Result<Option<Duration>, LockError> {
    if let Some(info) = read_info(path) {
        let age = Utc::now().signed_duration_since(info.acquired_at);
        return Ok(Some(age.to_std().unwrap_or(Duration::ZERO)));
    }

    match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => Ok(Some(modified.elapsed().unwrap_or(Duration::ZERO))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn read_info(path: &Path) -> Option<LockInfo> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Holds a per-host lock until dropped.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct HostLockGuard {
    path: PathBuf,
    token: Uuid,
    subject: String,
}

impl HostLockGuard {
    /// What this guard protects: a host id, or `name <host_name>`.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl Drop for HostLockGuard {
    fn drop(&mut self) {
        // Only remove the file if it is still ours; it may have been broken as stale.
        if read_info(&self.path).is_some_and(|info| info.token != self.token) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(lock = %self.subject, "Released host lock"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(lock = %self.subject, error = %e, "Failed to release host lock");
            }
        }
    }
}
