//! The idle decision, as a pure function of config, observations, and time.

use chrono::{DateTime, TimeDelta, Utc};
use mng_core::{ActivityConfig, ActivityObservations};

/// What one watcher tick concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Idle detection is disabled for this host.
    Disabled,
    /// No relevant marker exists yet, so the host is not idle.
    NoActivityYet,
    /// Recent activity; the host becomes idle at `idle_deadline`.
    Active {
        /// When the host turns idle without further activity.
        idle_deadline: DateTime<Utc>,
    },
    /// No relevant activity for the whole idle timeout.
    Idle,
    /// The host outlived `max_host_age_seconds`.
    MaxAgeExceeded,
}

impl Decision {
    /// Returns true if the shutdown hook must run.
    #[must_use]
    pub const fn is_shutdown(self) -> bool {
        matches!(self, Self::Idle | Self::MaxAgeExceeded)
    }

    /// Reason handed to the shutdown hook and written to the watcher log.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::NoActivityYet => "no-activity-yet",
            Self::Active { .. } => "active",
            Self::Idle => "idle",
            Self::MaxAgeExceeded => "max-age",
        }
    }
}

fn plus_seconds(start: DateTime<Utc>, seconds: u64) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(seconds).ok()?;
    start.checked_add_signed(TimeDelta::try_seconds(seconds)?)
}

/// Decide whether a host should shut down.
///
/// The age cap is checked first and applies in every idle mode, `disabled`
/// included. A host with no relevant marker is never idle.
#[must_use]
pub fn decide(
    config: &ActivityConfig,
    observations: &ActivityObservations,
    now: DateTime<Utc>,
) -> Decision {
    if let (Some(max_age), Some(booted)) = (config.max_host_age_seconds, observations.boot()) {
        if plus_seconds(booted, max_age).is_some_and(|limit| now >= limit) {
            return Decision::MaxAgeExceeded;
        }
    }

    if config.is_disabled() {
        return Decision::Disabled;
    }

    let Some(latest) = observations.latest() else {
        return Decision::NoActivityYet;
    };
    match plus_seconds(latest, config.idle_timeout_seconds) {
        Some(idle_deadline) if now < idle_deadline => Decision::Active { idle_deadline },
        Some(_) => Decision::Idle,
        None => Decision::Active {
            idle_deadline: DateTime::<Utc>::MAX_UTC,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mng_core::{ActivitySource, IdleMode};

    fn at(seconds_ago: i64, now: DateTime<Utc>) -> DateTime<Utc> {
        now - TimeDelta::seconds(seconds_ago)
    }

    #[test]
    fn recent_agent_output_keeps_host_active() {
        let now = Utc::now();
        let config = ActivityConfig::new(IdleMode::Agent, 60);
        let obs = ActivityObservations::from_parts([(ActivitySource::Agent, at(45, now))], None);

        assert_eq!(
            decide(&config, &obs, now),
            Decision::Active {
                idle_deadline: at(45, now) + TimeDelta::seconds(60)
            }
        );
        assert_eq!(decide(&config, &obs, now + TimeDelta::seconds(15)), Decision::Idle);
    }

    #[test]
    fn no_markers_is_never_idle() {
        let now = Utc::now();
        let config = ActivityConfig::new(IdleMode::Io, 1);
        let obs = ActivityObservations::default();
        assert_eq!(decide(&config, &obs, now), Decision::NoActivityYet);
        assert_eq!(
            decide(&config, &obs, now + TimeDelta::days(365)),
            Decision::NoActivityYet
        );
    }

    #[test]
    fn age_cap_overrides_recent_activity() {
        let now = Utc::now();
        let config = ActivityConfig::new(IdleMode::Io, 600).with_max_host_age(3600);
        let obs = ActivityObservations::from_parts(
            [(ActivitySource::User, at(5, now))],
            Some(at(3601, now)),
        );
        assert_eq!(decide(&config, &obs, now), Decision::MaxAgeExceeded);
    }

    #[test]
    fn age_cap_applies_when_idle_detection_is_disabled() {
        let now = Utc::now();
        let config = ActivityConfig::new(IdleMode::Disabled, 60);
        let young = ActivityObservations::from_parts([], Some(at(10, now)));
        assert_eq!(decide(&config, &young, now), Decision::Disabled);

        let config = config.with_max_host_age(5);
        assert_eq!(decide(&config, &young, now), Decision::MaxAgeExceeded);
    }

    #[test]
    fn age_and_idle_both_crossed_reports_age() {
        let now = Utc::now();
        let config = ActivityConfig::new(IdleMode::Io, 60).with_max_host_age(120);
        let obs = ActivityObservations::from_parts(
            [(ActivitySource::Boot, at(500, now))],
            Some(at(500, now)),
        );
        assert_eq!(decide(&config, &obs, now), Decision::MaxAgeExceeded);
    }

    #[test]
    fn huge_timeouts_do_not_overflow() {
        let now = Utc::now();
        let config = ActivityConfig::new(IdleMode::Io, u64::MAX).with_max_host_age(u64::MAX);
        let obs = ActivityObservations::from_parts([(ActivitySource::Boot, now)], Some(now));
        assert!(!decide(&config, &obs, now).is_shutdown());
    }
}
