//! Host lifecycle states and computed agent states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states for a host.
///
/// `Destroyed` is terminal. `Paused` is only ever entered by the idle watcher's
/// shutdown hook on backends with native stop/resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostState {
    /// Backing resource is being allocated and built.
    Building,
    /// A stopped host is being brought back.
    Starting,
    /// Host is live and reachable.
    Running,
    /// Shutdown in progress.
    Stopping,
    /// Backing resource released or halted; identity and snapshots remain.
    Stopped,
    /// Suspended by the idle watcher; resumed transparently on next use.
    Paused,
    /// Backing resource died without a requested stop.
    Crashed,
    /// Creation failed; a failure record is kept for discovery.
    Failed,
    /// Irreversibly gone.
    Destroyed,
}

impl HostState {
    /// All states in declaration order.
    pub const ALL: [Self; 9] = [
        Self::Building,
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Paused,
        Self::Crashed,
        Self::Failed,
        Self::Destroyed,
    ];

    /// Wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Building => "BUILDING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Paused => "PAUSED",
            Self::Crashed => "CRASHED",
            Self::Failed => "FAILED",
            Self::Destroyed => "DESTROYED",
        }
    }

    /// Returns true for the irreversible `Destroyed` state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Returns true if the host can be reached right now.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if a snapshot may be captured in this state.
    #[must_use]
    pub const fn can_snapshot(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the host has no live backing resource but still exists.
    #[must_use]
    pub const fn is_offline(self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Paused | Self::Crashed | Self::Failed
        )
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of an agent.
///
/// Never stored: computed on each query from whether the managing session is
/// alive plus the agent's self-reported status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentObservedState {
    /// Session is gone and the agent did not report completion.
    Stopped,
    /// Session is alive and working.
    Running,
    /// Session is alive and the agent reported it is waiting for input.
    Waiting,
    /// The agent reported it was replaced by another agent.
    Replaced,
    /// The agent reported it finished its task.
    Done,
}

impl AgentObservedState {
    /// Compute the observed state.
    ///
    /// `status` is the trimmed content of the agent's status file, if any.
    /// `replaced` wins regardless of session state; `waiting` only counts while
    /// the session is alive; `done` only counts once the session is gone.
    #[must_use]
    pub fn observe(session_alive: bool, status: Option<&str>) -> Self {
        let status = status.map(str::trim);
        match (session_alive, status) {
            (_, Some("replaced")) => Self::Replaced,
            (true, Some("waiting")) => Self::Waiting,
            (true, _) => Self::Running,
            (false, Some("done")) => Self::Done,
            (false, _) => Self::Stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_destroyed_is_terminal() {
        for state in HostState::ALL {
            assert_eq!(state.is_terminal(), state == HostState::Destroyed);
        }
    }

    #[test]
    fn serde_uses_upper_case() {
        let json = serde_json::to_string(&HostState::Paused).unwrap();
        assert_eq!(json, "\"PAUSED\"");
        let parsed: HostState = serde_json::from_str("\"STOPPED\"").unwrap();
        assert_eq!(parsed, HostState::Stopped);
    }

    #[test]
    fn agent_state_observation() {
        use AgentObservedState::*;

        assert_eq!(AgentObservedState::observe(true, None), Running);
        assert_eq!(AgentObservedState::observe(true, Some("waiting\n")), Waiting);
        assert_eq!(AgentObservedState::observe(true, Some("done")), Running);
        assert_eq!(AgentObservedState::observe(false, Some("done")), Done);
        assert_eq!(AgentObservedState::observe(false, Some("waiting")), Stopped);
        assert_eq!(AgentObservedState::observe(false, None), Stopped);
        assert_eq!(AgentObservedState::observe(true, Some("replaced")), Replaced);
    }
}
