//! Daemon loop state machine: Idle → Capturing → Extracting → Matching → Idle.
//! A failed capture or extraction drops straight back to Idle; shutdown moves
//! any state to Stopped.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DaemonState {
    Idle,
    Capturing,
    Extracting,
    Matching,
    Stopped,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonState::Idle => write!(f, "Idle"),
            DaemonState::Capturing => write!(f, "Capturing"),
            DaemonState::Extracting => write!(f, "Extracting"),
            DaemonState::Matching => write!(f, "Matching"),
            DaemonState::Stopped => write!(f, "Stopped"),
        }
    }
}

impl DaemonState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: DaemonState) -> bool {
        matches!(
            (self, next),
            (DaemonState::Idle, DaemonState::Capturing)
                | (DaemonState::Capturing, DaemonState::Extracting)
                | (DaemonState::Capturing, DaemonState::Idle) // capture failed
                | (DaemonState::Extracting, DaemonState::Matching)
                | (DaemonState::Extracting, DaemonState::Idle) // nothing recognized
                | (DaemonState::Matching, DaemonState::Idle)
        ) || (next == DaemonState::Stopped && self != DaemonState::Stopped)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: DaemonState,
    pub to: DaemonState,
}

/// Current loop state plus a watch channel for observers.
pub struct StateMachine {
    state: RwLock<DaemonState>,
    state_tx: watch::Sender<DaemonState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(DaemonState::Idle);
        Self {
            state: RwLock::new(DaemonState::Idle),
            state_tx,
        }
    }

    pub fn current(&self) -> DaemonState {
        *self.state.read()
    }

    /// Attempt a state transition.
    pub fn transition(&self, next: DaemonState) -> Result<DaemonState, InvalidTransition> {
        let mut state = self.state.write();
        let current = *state;
        if !current.can_transition_to(next) {
            let err = InvalidTransition { from: current, to: next };
            warn!(error = %err, "state_transition_rejected");
            return Err(err);
        }
        *state = next;
        self.state_tx.send_replace(next);
        if next == DaemonState::Stopped {
            info!(from = %current, "daemon stopped");
        } else {
            debug!(from = %current, to = %next, "state_transition");
        }
        Ok(next)
    }

    /// Return to Idle from wherever the tick bailed out.
    pub fn reset_to_idle(&self) {
        let mut state = self.state.write();
        if *state != DaemonState::Idle && *state != DaemonState::Stopped {
            debug!(from = %*state, "reset_to_idle");
            *state = DaemonState::Idle;
            self.state_tx.send_replace(DaemonState::Idle);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.state_tx.subscribe()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let sm = StateMachine::new();
        for next in [
            DaemonState::Capturing,
            DaemonState::Extracting,
            DaemonState::Matching,
            DaemonState::Idle,
        ] {
            assert_eq!(sm.transition(next).unwrap(), next);
        }
        assert_eq!(sm.current(), DaemonState::Idle);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let sm = StateMachine::new();
        let err = sm.transition(DaemonState::Matching).unwrap_err();
        assert_eq!(err.from, DaemonState::Idle);
        assert_eq!(sm.current(), DaemonState::Idle);

        sm.transition(DaemonState::Capturing).unwrap();
        assert!(sm.transition(DaemonState::Matching).is_err());
        assert!(sm.transition(DaemonState::Idle).is_ok());
    }

    #[test]
    fn test_stopped_is_terminal() {
        let sm = StateMachine::new();
        sm.transition(DaemonState::Capturing).unwrap();
        sm.transition(DaemonState::Stopped).unwrap();
        assert!(sm.transition(DaemonState::Idle).is_err());
        assert!(sm.transition(DaemonState::Stopped).is_err());
        sm.reset_to_idle();
        assert_eq!(sm.current(), DaemonState::Stopped);
    }

    #[test]
    fn test_subscribers_see_transitions() {
        let sm = StateMachine::new();
        let rx = sm.subscribe();
        sm.transition(DaemonState::Capturing).unwrap();
        assert_eq!(*rx.borrow(), DaemonState::Capturing);
        sm.reset_to_idle();
        assert_eq!(*rx.borrow(), DaemonState::Idle);
    }
}
