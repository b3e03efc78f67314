//! Activity sources, idle modes, and the certified activity configuration.
//!
//! The mode-to-source table is fixed. A host's `ActivityConfig` is written once
//! at creation and read by the idle watcher on every tick.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Where an activity marker lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityScope {
    /// One marker file for the whole host.
    Host,
    /// One marker file per agent.
    Agent,
}

/// An origin of a liveness signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySource {
    /// Host finished booting.
    Boot,
    /// An SSH connection to the host was observed.
    Ssh,
    /// An agent was created.
    Create,
    /// An agent was started.
    Start,
    /// A user sent input to an agent.
    User,
    /// An agent produced output.
    Agent,
    /// An agent's process is still alive.
    Process,
}

impl ActivitySource {
    /// All sources in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Boot,
        Self::Ssh,
        Self::Create,
        Self::Start,
        Self::User,
        Self::Agent,
        Self::Process,
    ];

    /// Marker file name for this source.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Ssh => "ssh",
            Self::Create => "create",
            Self::Start => "start",
            Self::User => "user",
            Self::Agent => "agent",
            Self::Process => "process",
        }
    }

    /// Whether this source is recorded per host or per agent.
    #[must_use]
    pub const fn scope(self) -> ActivityScope {
        match self {
            Self::Boot | Self::Ssh => ActivityScope::Host,
            Self::Create | Self::Start | Self::User | Self::Agent | Self::Process => {
                ActivityScope::Agent
            }
        }
    }
}

impl fmt::Display for ActivitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivitySource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| CoreError::InvalidValue(format!("unknown activity source {s:?}")))
    }
}

/// Which activity keeps a host alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdleMode {
    /// Any user or agent input/output.
    #[default]
    Io,
    /// User input only.
    User,
    /// Agent output only.
    Agent,
    /// SSH connections only.
    Ssh,
    /// Agent processes being alive.
    Run,
    /// The explicit `activity_sources` list.
    Custom,
    /// Never idle.
    Disabled,
}

impl IdleMode {
    /// Sources watched by this mode. `Custom` yields nothing here; its sources come
    /// from the config record.
    #[must_use]
    pub const fn sources(self) -> &'static [ActivitySource] {
        use ActivitySource::{Agent, Boot, Create, Process, Ssh, Start, User};

        match self {
            Self::Io => &[User, Agent, Ssh, Create, Start, Boot],
            Self::User => &[User, Ssh, Create, Start, Boot],
            Self::Agent => &[Agent, Create, Start, Boot],
            Self::Ssh => &[Ssh, Create, Start, Boot],
            Self::Run => &[Process, Create, Start, Boot],
            Self::Custom | Self::Disabled => &[],
        }
    }
}

impl FromStr for IdleMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "io" => Ok(Self::Io),
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            "ssh" => Ok(Self::Ssh),
            "run" => Ok(Self::Run),
            "custom" => Ok(Self::Custom),
            "disabled" => Ok(Self::Disabled),
            other => Err(CoreError::InvalidValue(format!("unknown idle mode {other:?}"))),
        }
    }
}

/// Certified idle-detection configuration for a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityConfig {
    /// Which activity keeps the host alive.
    #[serde(default)]
    pub idle_mode: IdleMode,
    /// Seconds without relevant activity before the host is idle.
    #[serde(default = "ActivityConfig::default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// Sources used when `idle_mode` is `custom`.
    #[serde(default)]
    pub activity_sources: Vec<ActivitySource>,
    /// Hard cap on host age, measured from the boot marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_host_age_seconds: Option<u64>,
}

impl ActivityConfig {
    const fn default_idle_timeout() -> u64 {
        900
    }

    /// Create a config with the given mode and timeout and no age cap.
    #[must_use]
    pub fn new(idle_mode: IdleMode, idle_timeout_seconds: u64) -> Self {
        Self {
            idle_mode,
            idle_timeout_seconds,
            activity_sources: Vec::new(),
            max_host_age_seconds: None,
        }
    }

    /// Set the maximum host age.
    #[must_use]
    pub const fn with_max_host_age(mut self, seconds: u64) -> Self {
        self.max_host_age_seconds = Some(seconds);
        self
    }

    /// Sources the watcher must consult for this config.
    #[must_use]
    pub fn relevant_sources(&self) -> Vec<ActivitySource> {
        match self.idle_mode {
            IdleMode::Custom => {
                let mut sources = self.activity_sources.clone();
                sources.sort();
                sources.dedup();
                sources
            }
            mode => mode.sources().to_vec(),
        }
    }

    /// Returns true if this config can never trigger an idle shutdown.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.idle_mode == IdleMode::Disabled
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self::new(IdleMode::default(), Self::default_idle_timeout())
    }
}
