//! Worker lifecycle state machine.
//!
//! ```text
//! Installing ──ok──▶ Waiting ──activate──▶ Activating ──ok──▶ Active
//!      │                ▲                      │
//!    fail               └─────────fail─────────┘
//!      ▼
//! Redundant  (also reached from any state when superseded)
//! ```

use std::fmt;

use crate::error::WorkerError;

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Priming the cache with the core asset manifest.
  Installing,
  /// Installed, waiting to take over from the active version.
  Waiting,
  /// Retiring old namespaces and claiming clients.
  Activating,
  /// Intercepting requests.
  Active,
  /// Failed to install or replaced by a newer version.
  Redundant,
}

impl WorkerState {
  /// Only an active worker answers intercepted requests.
  pub fn can_intercept(self) -> bool {
    self == WorkerState::Active
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      WorkerState::Installing => "installing",
      WorkerState::Waiting => "waiting",
      WorkerState::Activating => "activating",
      WorkerState::Active => "active",
      WorkerState::Redundant => "redundant",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  Installed,
  InstallFailed,
  Activate,
  Activated,
  ActivateFailed,
  Superseded,
}

impl LifecycleEvent {
  fn action(self) -> &'static str {
    match self {
      LifecycleEvent::Installed | LifecycleEvent::InstallFailed => "finish installing",
      LifecycleEvent::Activate => "activate",
      LifecycleEvent::Activated | LifecycleEvent::ActivateFailed => "finish activating",
      LifecycleEvent::Superseded => "supersede",
    }
  }
}

/// Next state for `event`, or `InvalidTransition` if it does not apply.
pub fn transition(state: WorkerState, event: LifecycleEvent) -> Result<WorkerState, WorkerError> {
  use LifecycleEvent as E;
  use WorkerState as S;

  match (state, event) {
    (S::Installing, E::Installed) => Ok(S::Waiting),
    (S::Installing, E::InstallFailed) => Ok(S::Redundant),
    (S::Waiting, E::Activate) => Ok(S::Activating),
    (S::Activating, E::Activated) => Ok(S::Active),
    (S::Activating, E::ActivateFailed) => Ok(S::Waiting),
    (_, E::Superseded) => Ok(S::Redundant),
    (state, event) => Err(WorkerError::InvalidTransition {
      state,
      action: event.action(),
    }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_happy_path() {
    let mut state = WorkerState::Installing;
    for event in [
      LifecycleEvent::Installed,
      LifecycleEvent::Activate,
      LifecycleEvent::Activated,
    ] {
      state = transition(state, event).unwrap();
    }
    assert_eq!(state, WorkerState::Active);
    assert!(state.can_intercept());
  }

  #[test]
  fn test_failed_install_is_redundant() {
    let state = transition(WorkerState::Installing, LifecycleEvent::InstallFailed).unwrap();
    assert_eq!(state, WorkerState::Redundant);
    assert!(transition(state, LifecycleEvent::Activate).is_err());
  }

  #[test]
  fn test_failed_activation_returns_to_waiting() {
    let state = transition(WorkerState::Activating, LifecycleEvent::ActivateFailed).unwrap();
    assert_eq!(state, WorkerState::Waiting);
  }

  #[test]
  fn test_cannot_activate_before_install() {
    let err = transition(WorkerState::Installing, LifecycleEvent::Activate).unwrap_err();
    assert!(matches!(
      err,
      WorkerError::InvalidTransition {
        state: WorkerState::Installing,
        ..
      }
    ));
  }

  #[test]
  fn test_only_active_intercepts() {
    for state in [
      WorkerState::Installing,
      WorkerState::Waiting,
      WorkerState::Activating,
      WorkerState::Redundant,
    ] {
      assert!(!state.can_intercept());
    }
  }

  #[test]
  fn test_any_state_can_be_superseded() {
    for state in [WorkerState::Waiting, WorkerState::Active, WorkerState::Redundant] {
      assert_eq!(
        transition(state, LifecycleEvent::Superseded).unwrap(),
        WorkerState::Redundant
      );
    }
  }
}
