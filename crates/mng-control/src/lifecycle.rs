//! Host lifecycle state machine.
//!
//! This module defines the valid state transitions for hosts and provides
//! validation logic used by the lifecycle controller before every mutation.
//!
//! # State Machine
//!
//! ```text
//!     ┌──────────┐  failure   ┌──────────┐
//!     │ Building │───────────▶│  Failed  │
//!     └────┬─────┘            └──────────┘
//!          │ ready
//!          ▼
//!     ┌──────────┐  idle hook  ┌──────────┐
//!     │ Running  │────────────▶│  Paused  │
//!     └────┬─────┘◀────────────└────┬─────┘
//!          │          resume        │
//!          ▼ stop                   │ stop
//!     ┌──────────┐                  │
//!     │ Stopping │◀─────────────────┘
//!     └────┬─────┘
//!          ▼
//!     ┌──────────┐  start   ┌──────────┐  ready
//!     │ Stopped  │─────────▶│ Starting │────────▶ Running
//!     └──────────┘          └────┬─────┘
//!                                │ failure
//!                                ▼
//!                              Failed
//!
//!     any non-terminal state ──destroy──▶ Destroyed (terminal)
//! ```
//!
//! `Crashed` is observed, never requested: a running, starting, or stopping
//! host can crash, and a crashed host can be started again or cleaned up.

use mng_core::{HostId, HostName, HostState};

use crate::error::{ControlError, Result};

/// Validates a state transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `ControlError::InvalidTransition` if the transition is not allowed.
pub fn validate_transition(
    host_id: &HostId,
    host_name: &HostName,
    from: HostState,
    to: HostState,
) -> Result<HostState> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(ControlError::InvalidTransition {
            host_id: *host_id,
            host_name: host_name.clone(),
            from,
            to,
        })
    }
}

/// Check if a state transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: HostState, to: HostState) -> bool {
    use HostState::{
        Building, Crashed, Destroyed, Failed, Paused, Running, Starting, Stopped, Stopping,
    };

    match (from, to) {
        (Destroyed, _) => false,
        (_, Destroyed) => true,
        _ => matches!(
            (from, to),
            (Building, Running | Failed)
                | (Starting, Running | Failed | Crashed)
                | (Running, Stopping | Paused | Crashed)
                | (Stopping, Stopped | Crashed)
                | (Stopped | Crashed, Starting)
                | (Paused, Running | Stopping)
                | (Crashed, Stopping | Stopped)
        ),
    }
}

/// Returns the list of valid target states from the given state.
#[must_use]
pub fn valid_transitions_from(state: HostState) -> Vec<HostState> {
    HostState::ALL
        .into_iter()
        .filter(|&to| is_valid_transition(state, to))
        .collect()
}

/// Returns true if `stop_host` has nothing to do in this state.
#[must_use]
pub const fn is_stopped(state: HostState) -> bool {
    matches!(state, HostState::Stopped | HostState::Failed)
}

/// Returns true if `destroy_host` stops the host before releasing it.
#[must_use]
pub const fn needs_stop_before_destroy(state: HostState) -> bool {
    is_valid_transition(state, HostState::Stopping)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        use HostState::*;

        assert!(is_valid_transition(Building, Running));
        assert!(is_valid_transition(Building, Failed));
        assert!(is_valid_transition(Running, Stopping));
        assert!(is_valid_transition(Stopping, Stopped));
        assert!(is_valid_transition(Stopped, Starting));
        assert!(is_valid_transition(Starting, Running));
        assert!(is_valid_transition(Running, Paused));
        assert!(is_valid_transition(Paused, Running));
        assert!(is_valid_transition(Failed, Destroyed));
    }

    #[test]
    fn invalid_transitions() {
        use HostState::*;

        assert!(!is_valid_transition(Stopped, Running));
        assert!(!is_valid_transition(Failed, Starting));
        assert!(!is_valid_transition(Building, Stopping));
        assert!(!is_valid_transition(Stopped, Paused));
        assert!(!is_valid_transition(Paused, Failed));
    }

    #[test]
    fn drawn_edges_are_valid() {
        use HostState::*;

        let drawn = [
            (Building, Failed),
            (Building, Running),
            (Running, Paused),
            (Paused, Running),
            (Running, Stopping),
            (Paused, Stopping),
            (Stopping, Stopped),
            (Stopped, Starting),
            (Starting, Running),
            (Starting, Failed),
        ];
        for (from, to) in drawn {
            assert!(is_valid_transition(from, to), "{from} -> {to}");
        }
        assert_eq!(valid_transitions_from(Paused), vec![Running, Stopping, Destroyed]);
    }

    #[test]
    fn destroyed_is_terminal() {
        for to in HostState::ALL {
            assert!(!is_valid_transition(HostState::Destroyed, to));
        }
        assert!(valid_transitions_from(HostState::Destroyed).is_empty());
    }

    #[test]
    fn every_live_state_can_be_destroyed() {
        for from in HostState::ALL {
            if from != HostState::Destroyed {
                assert!(is_valid_transition(from, HostState::Destroyed), "{from}");
            }
        }
    }

    #[test]
    fn destroy_stops_only_hosts_with_a_resource() {
        use HostState::*;

        assert!(needs_stop_before_destroy(Running));
        assert!(needs_stop_before_destroy(Paused));
        assert!(needs_stop_before_destroy(Crashed));
        assert!(!needs_stop_before_destroy(Stopped));
        assert!(!needs_stop_before_destroy(Failed));
        assert!(!needs_stop_before_destroy(Starting));
    }

    #[test]
    fn validate_transition_err() {
        let host_id = HostId::from_bytes([1u8; 16]);
        let name: HostName = "box".parse().unwrap();
        let result = validate_transition(&host_id, &name, HostState::Destroyed, HostState::Starting);

        match result {
            Err(ControlError::InvalidTransition { from, to, .. }) => {
                assert_eq!(from, HostState::Destroyed);
                assert_eq!(to, HostState::Starting);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }
}
