//! The activity ledger: marker files whose modification times record liveness.
//!
//! Writers touch a marker; readers take the newest modification time across every
//! marker file relevant to a source. This is the only state the idle watcher
//! consumes besides its config record.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::activity::{ActivityConfig, ActivitySource};
use crate::error::{CoreError, Result};
use crate::ids::AgentId;
use crate::layout::{self, HostLayout};

/// Newest marker time per source, as observed in one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityObservations {
    latest: BTreeMap<ActivitySource, DateTime<Utc>>,
    boot: Option<DateTime<Utc>>,
}

impl ActivityObservations {
    /// Build observations directly, mostly useful in tests.
    #[must_use]
    pub fn from_parts(
        latest: impl IntoIterator<Item = (ActivitySource, DateTime<Utc>)>,
        boot: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            latest: latest.into_iter().collect(),
            boot,
        }
    }

    /// Newest time across all observed sources, if any marker exists.
    #[must_use]
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.latest.values().max().copied()
    }

    /// Newest time for one source.
    #[must_use]
    pub fn for_source(&self, source: ActivitySource) -> Option<DateTime<Utc>> {
        self.latest.get(&source).copied()
    }

    /// Modification time of the boot marker, used for the max-age check.
    #[must_use]
    pub const fn boot(&self) -> Option<DateTime<Utc>> {
        self.boot
    }
}

/// Reads and writes marker files under a locally visible host data root.
#[derive(Debug, Clone)]
pub struct ActivityLedger {
    layout: HostLayout,
}

impl ActivityLedger {
    /// Create a ledger over the given layout.
    #[must_use]
    pub const fn new(layout: HostLayout) -> Self {
        Self { layout }
    }

    /// The underlying layout.
    #[must_use]
    pub const fn layout(&self) -> &HostLayout {
        &self.layout
    }

    /// Record activity for a source.
    ///
    /// Agent-scoped sources require `agent`. The marker's content is the RFC 3339
    /// timestamp; only its modification time is authoritative.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is agent-scoped and no agent was given, or if
    /// the marker cannot be written.
    pub fn record(&self, source: ActivitySource, agent: Option<&AgentId>) -> Result<()> {
        if source.scope() == crate::activity::ActivityScope::Agent && agent.is_none() {
            return Err(CoreError::InvalidValue(format!(
                "activity source {source} is agent-scoped and needs an agent id"
            )));
        }

        let path = self.layout.marker(source, agent);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
        }

        let mut file = fs::File::create(&path).map_err(|e| CoreError::io(&path, e))?;
        file.write_all(Utc::now().to_rfc3339().as_bytes())
            .map_err(|e| CoreError::io(&path, e))?;

        tracing::trace!(source = %source, path = %path.display(), "Recorded activity");
        Ok(())
    }

    /// Newest modification time for one source across every matching file.
    ///
    /// # Errors
    ///
    /// Returns an error if the glob pattern is invalid or a matched file cannot be
    /// inspected. Files that vanish between matching and inspection are skipped.
    pub fn latest_for(&self, source: ActivitySource) -> Result<Option<DateTime<Utc>>> {
        // The root is literal; only the marker part may contain wildcards.
        let root = glob::Pattern::escape(&self.layout.root().to_string_lossy());
        let pattern = format!(
            "{}/{}",
            root.trim_end_matches('/'),
            layout::marker_pattern(source)
        );

        let mut newest: Option<SystemTime> = None;
        for entry in glob::glob(&pattern)? {
            let Ok(path) = entry else { continue };
            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CoreError::io(path, e)),
            };
            newest = Some(newest.map_or(modified, |current| current.max(modified)));
        }

        Ok(newest.map(DateTime::<Utc>::from))
    }

    /// Observe every source relevant to `config`, plus the boot marker.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Self::latest_for`].
    pub fn observe(&self, config: &ActivityConfig) -> Result<ActivityObservations> {
        let mut latest = BTreeMap::new();
        for source in config.relevant_sources() {
            if let Some(time) = self.latest_for(source)? {
                latest.insert(source, time);
            }
        }
        let boot = self.latest_for(ActivitySource::Boot)?;
        Ok(ActivityObservations { latest, boot })
    }

    /// Read the activity config record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or malformed.
    pub fn read_config(&self) -> Result<ActivityConfig> {
        let path = self.layout.activity_config();
        let raw = fs::read(&path).map_err(|e| CoreError::io(&path, e))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::IdleMode;
    use tempfile::TempDir;

    fn ledger() -> (ActivityLedger, TempDir) {
        let dir = TempDir::new().unwrap();
        (ActivityLedger::new(HostLayout::new(dir.path())), dir)
    }

    #[test]
    fn empty_ledger_has_no_observations() {
        let (ledger, _dir) = ledger();
        let obs = ledger
            .observe(&ActivityConfig::new(IdleMode::Io, 60))
            .unwrap();
        assert_eq!(obs.latest(), None);
        assert_eq!(obs.boot(), None);
    }

    #[test]
    fn agent_markers_are_globbed() {
        let (ledger, _dir) = ledger();
        let a = AgentId::generate();
        let b = AgentId::generate();
        ledger.record(ActivitySource::Agent, Some(&a)).unwrap();
        ledger.record(ActivitySource::Agent, Some(&b)).unwrap();

        let latest = ledger.latest_for(ActivitySource::Agent).unwrap();
        assert!(latest.is_some());
        assert!(ledger.latest_for(ActivitySource::User).unwrap().is_none());
    }

    #[test]
    fn root_with_glob_characters_is_matched_literally() {
        let dir = TempDir::new().unwrap();
        let ledger = ActivityLedger::new(HostLayout::new(dir.path().join("host[1]")));
        let agent = AgentId::generate();
        ledger.record(ActivitySource::Boot, None).unwrap();
        ledger.record(ActivitySource::Agent, Some(&agent)).unwrap();

        assert!(ledger.latest_for(ActivitySource::Boot).unwrap().is_some());
        assert!(ledger.latest_for(ActivitySource::Agent).unwrap().is_some());
        let obs = ledger
            .observe(&ActivityConfig::new(IdleMode::Agent, 60))
            .unwrap();
        assert!(obs.boot().is_some());
        assert!(obs.for_source(ActivitySource::Agent).is_some());
    }

    #[test]
    fn agent_scoped_source_requires_agent() {
        let (ledger, _dir) = ledger();
        assert!(ledger.record(ActivitySource::User, None).is_err());
        assert!(ledger.record(ActivitySource::Boot, None).is_ok());
    }

    #[test]
    fn observe_ignores_irrelevant_sources() {
        let (ledger, _dir) = ledger();
        let agent = AgentId::generate();
        ledger.record(ActivitySource::User, Some(&agent)).unwrap();

        let obs = ledger
            .observe(&ActivityConfig::new(IdleMode::Agent, 60))
            .unwrap();
        assert_eq!(obs.latest(), None);

        let obs = ledger.observe(&ActivityConfig::new(IdleMode::User, 60)).unwrap();
        assert!(obs.for_source(ActivitySource::User).is_some());
    }

    #[test]
    fn read_config_roundtrip() {
        let (ledger, dir) = ledger();
        let config = ActivityConfig::new(IdleMode::Ssh, 120).with_max_host_age(3600);
        fs::write(
            dir.path().join("activity_config.json"),
            serde_json::to_vec(&config).unwrap(),
        )
        .unwrap();
        assert_eq!(ledger.read_config().unwrap(), config);
    }
}
