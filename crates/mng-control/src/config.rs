//! Configuration for an mng invocation.
//!
//! Loaded from a TOML file, then overridden from the environment. Provider
//! instances are declared as `[providers.<name>]` tables whose `backend` key
//! selects the backend and whose remaining keys are that backend's settings:
//!
//! ```toml
//! prefix = "mng-"
//! store_root = "/var/lib/mng"
//!
//! [providers.docker]
//! backend = "docker"
//! image = "debian:bookworm-slim"
//!
//! [providers.build-box]
//! backend = "ssh"
//! address = "10.0.0.5"
//! user = "dev"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mng_store::LockConfig;
use serde::Deserialize;

use crate::error::{ControlError, Result};

/// One configured provider instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderConfig {
    /// Backend name, e.g. `docker`.
    pub backend: String,
    /// Backend-specific settings.
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl ProviderConfig {
    /// Settings as a JSON value for `ProviderBackend::build`.
    #[must_use]
    pub fn settings_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.settings.clone())
    }
}

/// Configuration for one invocation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MngConfig {
    /// Prefix carried by every managed resource name.
    #[serde(default = "MngConfig::default_prefix")]
    pub prefix: String,

    /// Root of the Durable Record Store and lock directory.
    #[serde(default = "MngConfig::default_store_root")]
    pub store_root: PathBuf,

    /// Host data root inside sandboxes.
    #[serde(default = "MngConfig::default_host_dir")]
    pub host_dir: String,

    /// Maximum provider instances queried at once.
    #[serde(default = "MngConfig::default_discovery_concurrency")]
    pub discovery_concurrency: usize,

    /// Per-instance discovery timeout in seconds.
    #[serde(default = "MngConfig::default_discovery_timeout")]
    pub discovery_timeout_seconds: u64,

    /// How long to wait for a per-host lock, in seconds.
    #[serde(default = "MngConfig::default_lock_wait")]
    pub lock_wait_seconds: u64,

    /// Age after which a held lock is considered abandoned, in seconds.
    #[serde(default = "MngConfig::default_lock_stale")]
    pub lock_stale_seconds: u64,

    /// Provider instances by name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl MngConfig {
    fn default_prefix() -> String {
        "mng-".to_string()
    }

    fn default_store_root() -> PathBuf {
        std::env::var_os("HOME")
            .map_or_else(|| PathBuf::from(".mng"), |home| PathBuf::from(home).join(".mng"))
    }

    fn default_host_dir() -> String {
        mng_core::layout::DEFAULT_HOST_DIR.to_string()
    }

    const fn default_discovery_concurrency() -> usize {
        8
    }

    const fn default_discovery_timeout() -> u64 {
        30
    }

    const fn default_lock_wait() -> u64 {
        30
    }

    const fn default_lock_stale() -> u64 {
        600
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML or does not match
    /// the schema, or if the result fails validation.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// override produces an invalid configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ControlError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, with no providers configured.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply `MNG_*` overrides from `lookup`. Unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("MNG_STORE_ROOT") {
            self.store_root = PathBuf::from(val);
        }
        if let Some(val) = lookup("MNG_HOST_DIR") {
            self.host_dir = val;
        }
        if let Some(val) = lookup("MNG_PREFIX") {
            self.prefix = val;
        }
        if let Some(n) = lookup("MNG_DISCOVERY_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
            self.discovery_timeout_seconds = n;
        }
        if let Some(n) = lookup("MNG_LOCK_WAIT_SECONDS").and_then(|v| v.parse().ok()) {
            self.lock_wait_seconds = n;
        }
    }

    /// Check invariants the rest of the control layer relies on.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(ControlError::Config("prefix must not be empty".into()));
        }
        if self.discovery_concurrency == 0 {
            return Err(ControlError::Config(
                "discovery_concurrency must be at least 1".into(),
            ));
        }
        if self.discovery_timeout_seconds == 0 {
            return Err(ControlError::Config(
                "discovery_timeout_seconds must be at least 1".into(),
            ));
        }
        if let Some((name, _)) = self.providers.iter().find(|(_, p)| p.backend.is_empty()) {
            return Err(ControlError::Config(format!(
                "provider {name} has no backend"
            )));
        }
        Ok(())
    }

    /// Per-instance discovery timeout.
    #[must_use]
    pub const fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_seconds)
    }

    /// Lock settings derived from this config.
    #[must_use]
    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            wait: Duration::from_secs(self.lock_wait_seconds),
            stale_after: Duration::from_secs(self.lock_stale_seconds),
            ..LockConfig::default()
        }
    }
}

impl Default for MngConfig {
    fn default() -> Self {
        Self {
            prefix: Self::default_prefix(),
            store_root: Self::default_store_root(),
            host_dir: Self::default_host_dir(),
            discovery_concurrency: Self::default_discovery_concurrency(),
            discovery_timeout_seconds: Self::default_discovery_timeout(),
            lock_wait_seconds: Self::default_lock_wait(),
            lock_stale_seconds: Self::default_lock_stale(),
            providers: BTreeMap::new(),
        }
    }
}
