//! Per-episode lifecycle states and result-record phases.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of one Inject → Hold → Revert episode.
///
/// ```text
/// Idle → Injecting → Holding → Reverting → Reverted
///            │                     │
///            └─────────────────────┴──────→ Failed
/// ```
///
/// An inject error goes straight to `Reverting` so whatever was mutated is
/// cleaned up. `Reverted` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Injecting,
    Holding,
    Reverting,
    Reverted,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Reverted | LifecycleState::Failed)
    }

    /// Whether `self → next` is a legal edge.
    pub fn can_transition(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle, Injecting)
                | (Idle, Failed)
                | (Injecting, Holding)
                | (Injecting, Reverting)
                | (Injecting, Failed)
                | (Holding, Reverting)
                | (Reverting, Reverted)
                | (Reverting, Failed)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Injecting => "injecting",
            LifecycleState::Holding => "holding",
            LifecycleState::Reverting => "reverting",
            LifecycleState::Reverted => "reverted",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Checkpoint written to the result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Targeted,
    Injected,
    Reverted,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Targeted => "targeted",
            Phase::Injected => "injected",
            Phase::Reverted => "reverted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::*;
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [Idle, Injecting, Holding, Reverting, Reverted];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn inject_failure_goes_through_reverting() {
        assert!(Injecting.can_transition(Reverting));
        assert!(!Injecting.can_transition(Reverted));
        assert!(!Holding.can_transition(Failed));
    }

    #[test]
    fn terminal_states_have_no_exit() {
        for next in [Idle, Injecting, Holding, Reverting, Reverted, Failed] {
            assert!(!Reverted.can_transition(next));
            assert!(!Failed.can_transition(next));
        }
        assert!(Reverted.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Holding.is_terminal());
    }

    #[test]
    fn phase_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Phase::Injected).unwrap(), "\"injected\"");
        assert_eq!(Phase::Reverted.as_str(), "reverted");
    }
}
