//! The fixed host-side file layout.
//!
//! Providers generate these files at host creation and the idle watcher reads
//! them. Every path here is part of the external contract, so the relative
//! forms are exposed as plain strings usable over any host access channel.

use std::path::{Path, PathBuf};

use crate::activity::{ActivityScope, ActivitySource};
use crate::ids::AgentId;

/// Default host data root inside a sandbox.
pub const DEFAULT_HOST_DIR: &str = "/mng";

/// Certified host data, written once at creation.
pub const HOST_DATA_FILE: &str = "data.json";

/// Serialized `ActivityConfig` read by the idle watcher.
pub const ACTIVITY_CONFIG_FILE: &str = "activity_config.json";

/// Executable invoked by the idle watcher when the host should shut down.
pub const SHUTDOWN_HOOK: &str = "commands/shutdown.sh";

/// Append-only log of idle watcher decisions.
pub const WATCHER_LOG: &str = "logs/idle_watcher.log";

/// Program name of the idle watcher, resolved on the host's `PATH`.
pub const WATCHER_PROGRAM: &str = "mng-idle-watcher";

/// Pid of the running idle watcher, written when a provider launches it.
pub const WATCHER_PID: &str = "logs/idle_watcher.pid";

/// Captured stdout and stderr of the idle watcher process.
pub const WATCHER_OUTPUT: &str = "logs/idle_watcher.out";

/// Directory holding per-agent state.
pub const AGENTS_DIR: &str = "agents";

/// Host-relative path of a host-scoped marker.
#[must_use]
pub fn host_marker(source: ActivitySource) -> String {
    format!("activity/{}", source.as_str())
}

/// Host-relative path of an agent-scoped marker.
#[must_use]
pub fn agent_marker(agent_id: &AgentId, source: ActivitySource) -> String {
    format!("{AGENTS_DIR}/{agent_id}/activity/{}", source.as_str())
}

/// Host-relative glob matching a source's marker across every agent.
#[must_use]
pub fn agent_marker_glob(source: ActivitySource) -> String {
    format!("{AGENTS_DIR}/*/activity/{}", source.as_str())
}

/// Host-relative glob covering every marker file of a source.
#[must_use]
pub fn marker_pattern(source: ActivitySource) -> String {
    match source.scope() {
        ActivityScope::Host => host_marker(source),
        ActivityScope::Agent => agent_marker_glob(source),
    }
}

/// Host-relative directory of an agent.
#[must_use]
pub fn agent_dir(agent_id: &AgentId) -> String {
    format!("{AGENTS_DIR}/{agent_id}")
}

/// Host-relative path of an agent's certified data.
#[must_use]
pub fn agent_data(agent_id: &AgentId) -> String {
    format!("{AGENTS_DIR}/{agent_id}/data.json")
}

/// Host-relative path of an agent's self-reported status.
#[must_use]
pub fn agent_status(agent_id: &AgentId) -> String {
    format!("{AGENTS_DIR}/{agent_id}/status")
}

/// A host data root on a filesystem the current process can see directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    /// Create a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The host data root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a host-relative path.
    #[must_use]
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Absolute path of the activity config record.
    #[must_use]
    pub fn activity_config(&self) -> PathBuf {
        self.path(ACTIVITY_CONFIG_FILE)
    }

    /// Absolute path of the shutdown hook.
    #[must_use]
    pub fn shutdown_hook(&self) -> PathBuf {
        self.path(SHUTDOWN_HOOK)
    }

    /// Absolute path of the watcher log.
    #[must_use]
    pub fn watcher_log(&self) -> PathBuf {
        self.path(WATCHER_LOG)
    }

    /// Absolute marker path (or glob) for a source.
    ///
    /// Host-scoped sources resolve to a single file; agent-scoped sources resolve
    /// to a glob over every agent unless `agent` narrows it.
    #[must_use]
    pub fn marker(&self, source: ActivitySource, agent: Option<&AgentId>) -> PathBuf {
        match (source.scope(), agent) {
            (ActivityScope::Host, _) => self.path(&host_marker(source)),
            (ActivityScope::Agent, Some(agent_id)) => self.path(&agent_marker(agent_id, source)),
            (ActivityScope::Agent, None) => self.path(&agent_marker_glob(source)),
        }
    }
}

impl Default for HostLayout {
    fn default() -> Self {
        Self::new(DEFAULT_HOST_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths() {
        let agent = AgentId::from_bytes([1u8; 16]);
        assert_eq!(host_marker(ActivitySource::Boot), "activity/boot");
        assert_eq!(
            agent_marker(&agent, ActivitySource::Agent),
            format!("agents/{agent}/activity/agent")
        );
        assert_eq!(agent_marker_glob(ActivitySource::User), "agents/*/activity/user");
    }

    #[test]
    fn marker_resolution_by_scope() {
        let layout = HostLayout::new("/tmp/h");
        assert_eq!(
            layout.marker(ActivitySource::Ssh, None),
            PathBuf::from("/tmp/h/activity/ssh")
        );
        assert_eq!(
            layout.marker(ActivitySource::Start, None),
            PathBuf::from("/tmp/h/agents/*/activity/start")
        );
    }

    #[test]
    fn default_root() {
        assert_eq!(HostLayout::default().shutdown_hook(), PathBuf::from("/mng/commands/shutdown.sh"));
    }
}
