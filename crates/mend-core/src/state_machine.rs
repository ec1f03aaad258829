//! Incident phase transition table
//!
//! ```text
//! monitoring -> analyzing -> [pending_approval] -> fixing -> testing -> resolved
//!      ^            ^  |              |              |          |
//!      |            |  +--------------+--------------+----------+--> escalated
//!      +------------+------- failed attempt ---------+----------+
//! ```
//!
//! Every non-terminal phase may escalate. `resolved` and `escalated` are
//! terminal.

use crate::error::StateMachineError;
use crate::incident::Phase;

/// Validate a phase transition
///
/// # Errors
/// Returns [`StateMachineError::IllegalTransition`] if `to` is not reachable from `from`
pub fn validate_transition(from: Phase, to: Phase) -> Result<(), StateMachineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// Phases reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: Phase) -> &'static [Phase] {
    match from {
        Phase::Monitoring => &[Phase::Analyzing, Phase::Escalated],
        Phase::Analyzing => &[Phase::Fixing, Phase::PendingApproval, Phase::Escalated],
        Phase::PendingApproval => &[Phase::Fixing, Phase::Analyzing, Phase::Escalated],
        Phase::Fixing => &[Phase::Testing, Phase::Monitoring, Phase::Escalated],
        Phase::Testing => &[Phase::Resolved, Phase::Monitoring, Phase::Escalated],
        Phase::Resolved | Phase::Escalated => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Phase; 7] = [
        Phase::Monitoring,
        Phase::Analyzing,
        Phase::PendingApproval,
        Phase::Fixing,
        Phase::Testing,
        Phase::Resolved,
        Phase::Escalated,
    ];

    #[test]
    fn happy_path_is_allowed() {
        let path = [
            Phase::Monitoring,
            Phase::Analyzing,
            Phase::PendingApproval,
            Phase::Fixing,
            Phase::Testing,
            Phase::Resolved,
        ];
        for pair in path.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok(), "{:?}", pair);
        }
    }

    #[test]
    fn terminal_phases_have_no_exits() {
        for to in ALL {
            assert!(validate_transition(Phase::Resolved, to).is_err());
            assert!(validate_transition(Phase::Escalated, to).is_err());
        }
    }

    #[test]
    fn every_live_phase_can_escalate() {
        for from in ALL.into_iter().filter(|p| !p.is_terminal()) {
            assert!(validate_transition(from, Phase::Escalated).is_ok());
        }
    }

    #[test]
    fn fixing_cannot_be_skipped() {
        assert_eq!(
            validate_transition(Phase::Analyzing, Phase::Testing),
            Err(StateMachineError::IllegalTransition {
                from: Phase::Analyzing,
                to: Phase::Testing
            })
        );
        assert!(validate_transition(Phase::Monitoring, Phase::Fixing).is_err());
    }
}
