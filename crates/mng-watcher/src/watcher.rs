//! The polling loop that runs on each host.

use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mng_core::{ActivityLedger, HostLayout};
use tokio::process::Command;

use crate::decision::{decide, Decision};
use crate::error::{Result, WatcherError};

/// Default seconds between ticks.
pub const DEFAULT_INTERVAL_SECONDS: u64 = 60;

/// Polls the activity ledger and runs the shutdown hook once the host is idle.
#[derive(Debug, Clone)]
pub struct IdleWatcher {
    ledger: ActivityLedger,
    interval: Duration,
}

impl IdleWatcher {
    /// Create a watcher over `layout`, ticking every `interval`.
    #[must_use]
    pub const fn new(layout: HostLayout, interval: Duration) -> Self {
        Self {
            ledger: ActivityLedger::new(layout),
            interval,
        }
    }

    /// The host data root being watched.
    #[must_use]
    pub const fn layout(&self) -> &HostLayout {
        self.ledger.layout()
    }

    /// Evaluate the host once at `now`.
    ///
    /// The config record is re-read every tick so edits apply without a
    /// restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the config record or a marker cannot be read.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Decision> {
        let config = self.ledger.read_config()?;
        let observations = self.ledger.observe(&config)?;
        let decision = decide(&config, &observations, now);

        tracing::debug!(
            mode = ?config.idle_mode,
            timeout = config.idle_timeout_seconds,
            latest = ?observations.latest(),
            decision = decision.reason(),
            "Evaluated host activity"
        );
        Ok(decision)
    }

    /// Poll until the host should shut down, then run the shutdown hook.
    ///
    /// Tick failures are logged and polling continues. The hook runs exactly
    /// once, and the decision that triggered it is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown hook is missing, cannot be spawned, or
    /// exits unsuccessfully.
    pub async fn run(&self) -> Result<Decision> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let decision = loop {
            ticker.tick().await;
            match self.tick(Utc::now()) {
                Ok(decision) if decision.is_shutdown() => break decision,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, category = ?e.category(), "Watcher tick failed");
                }
            }
        };

        tracing::info!(reason = decision.reason(), "Host should shut down");
        if let Err(e) = self.log_decision(decision, Utc::now()) {
            tracing::warn!(error = %e, "Failed to append watcher log");
        }
        self.shutdown(decision).await?;
        Ok(decision)
    }

    fn log_decision(&self, decision: Decision, now: DateTime<Utc>) -> Result<()> {
        let path = self.layout().watcher_log();
        let log_err = |source: std::io::Error| WatcherError::Log {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(log_err)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(log_err)?;
        writeln!(file, "{} shutdown reason={}", now.to_rfc3339(), decision.reason())
            .map_err(log_err)?;
        Ok(())
    }

    async fn shutdown(&self, decision: Decision) -> Result<()> {
        let hook = self.layout().shutdown_hook();
        if !hook.is_file() {
            return Err(WatcherError::HookMissing { path: hook });
        }

        let status = Command::new(&hook)
            .arg(decision.reason())
            .current_dir(self.layout().root())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| WatcherError::HookSpawn {
                path: hook.clone(),
                source,
            })?;

        if !status.success() {
            return Err(WatcherError::HookFailed {
                path: hook,
                code: status.code(),
            });
        }

        tracing::info!(hook = %hook.display(), "Shutdown hook completed");
        Ok(())
    }
}
