//! The phase state machine.
//!
//! `Phase` is a small closed enum rather than an open `Custom(String)`
//! space: the run's legal transitions are fixed and checked against a
//! compile-time edge table, so an illegal transition is caught before it
//! ever reaches persistence.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named stage of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Validate and accept the initial project description.
    Intake,
    /// Produce `Requirements` then `Architecture`.
    Planning,
    /// Produce backend/frontend/devops source files.
    Development,
    /// Generate, execute, and review tests.
    Testing,
    /// Produce the final deployment bundle.
    Deployment,
    /// Parked awaiting an out-of-band human response.
    AwaitingHuman,
    /// Terminal success state.
    Complete,
    /// Terminal failure state.
    Error,
}

impl Phase {
    /// All non-terminal, non-suspended phases in pipeline order.
    pub const PIPELINE: [Phase; 5] = [
        Phase::Intake,
        Phase::Planning,
        Phase::Development,
        Phase::Testing,
        Phase::Deployment,
    ];

    /// Whether this phase ends the run (no further transitions are legal).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Error)
    }

    /// Whether this phase is a valid `max_retries`/circuit-breaker target,
    /// i.e. one the Flow can meaningfully retry work in.
    #[must_use]
    pub fn is_retryable_phase(self) -> bool {
        matches!(
            self,
            Phase::Intake | Phase::Planning | Phase::Development | Phase::Testing | Phase::Deployment
        )
    }

    /// Whether budget exhaustion in this phase routes to `AwaitingHuman`
    /// rather than straight to `Error`.
    #[must_use]
    pub fn supports_awaiting_human_on_exhaustion(self) -> bool {
        matches!(self, Phase::Intake | Phase::Planning | Phase::Testing)
    }

    /// Returns `true` if `self -> next` is a declared edge of the state
    /// machine. `suspended_from` must be supplied when `self ==
    /// AwaitingHuman`, since that phase's only legal edge returns to
    /// wherever it was suspended from.
    #[must_use]
    pub fn allows_transition(self, next: Phase, suspended_from: Option<Phase>) -> bool {
        use Phase::{AwaitingHuman, Complete, Deployment, Development, Error, Intake, Planning, Testing};
        match self {
            Intake => matches!(next, Planning | AwaitingHuman | Error),
            Planning => matches!(next, Development | AwaitingHuman | Error),
            Development => matches!(next, Testing | Error),
            Testing => matches!(next, Deployment | Development | AwaitingHuman | Error),
            Deployment => matches!(next, Complete | Error),
            AwaitingHuman => Some(next) == suspended_from,
            Complete | Error => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Intake => "INTAKE",
            Phase::Planning => "PLANNING",
            Phase::Development => "DEVELOPMENT",
            Phase::Testing => "TESTING",
            Phase::Deployment => "DEPLOYMENT",
            Phase::AwaitingHuman => "AWAITING_HUMAN",
            Phase::Complete => "COMPLETE",
            Phase::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A single recorded phase transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transition {
    /// Phase being left.
    pub from_phase: Phase,
    /// Phase being entered.
    pub to_phase: Phase,
    /// Wall-clock time the transition was committed.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Human-readable router/system rationale.
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intake_edges_are_exactly_as_specified() {
        assert!(Phase::Intake.allows_transition(Phase::Planning, None));
        assert!(Phase::Intake.allows_transition(Phase::AwaitingHuman, None));
        assert!(Phase::Intake.allows_transition(Phase::Error, None));
        assert!(!Phase::Intake.allows_transition(Phase::Development, None));
        assert!(!Phase::Intake.allows_transition(Phase::Complete, None));
    }

    #[test]
    fn testing_may_loop_back_to_development() {
        assert!(Phase::Testing.allows_transition(Phase::Development, None));
        assert!(Phase::Testing.allows_transition(Phase::Deployment, None));
    }

    #[test]
    fn awaiting_human_only_returns_to_suspension_source() {
        assert!(Phase::AwaitingHuman.allows_transition(Phase::Testing, Some(Phase::Testing)));
        assert!(!Phase::AwaitingHuman.allows_transition(Phase::Deployment, Some(Phase::Testing)));
        assert!(!Phase::AwaitingHuman.allows_transition(Phase::Testing, None));
    }

    #[test]
    fn terminal_phases_have_no_outgoing_edges() {
        assert!(!Phase::Complete.allows_transition(Phase::Error, None));
        assert!(!Phase::Error.allows_transition(Phase::Complete, None));
        assert!(Phase::Complete.is_terminal());
        assert!(Phase::Error.is_terminal());
    }

    #[test]
    fn display_uses_shouting_snake_case_names() {
        assert_eq!(Phase::AwaitingHuman.to_string(), "AWAITING_HUMAN");
        assert_eq!(Phase::Development.to_string(), "DEVELOPMENT");
    }
}
