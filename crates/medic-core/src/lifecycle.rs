//! PR lifecycle transition table.
//!
//! The table below is the single source of truth for which state changes a
//! reconciliation step may perform. Anything not listed is illegal.

use serde::Serialize;
use thiserror::Error;

use crate::types::{PrState, RemediationAction};

/// Errors from lifecycle checks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: PrState, to: PrState },
}

/// One legal edge of the lifecycle graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: PrState,
    pub to: PrState,
    pub trigger: &'static str,
}

const fn edge(from: PrState, to: PrState, trigger: &'static str) -> Transition {
    Transition { from, to, trigger }
}

use PrState::*;

/// Every legal transition.
pub const TRANSITIONS: &[Transition] = &[
    edge(Created, ChecksRunning, "checks begin"),
    edge(ChecksRunning, ChecksPassed, "all checks pass"),
    edge(ChecksRunning, ChecksFailed, "check fails or times out"),
    edge(ChecksPassed, PolicyEvaluating, "policy bot evaluates"),
    edge(ChecksPassed, PolicyEvaluating, "retrigger policy bot (max 2)"),
    edge(PolicyEvaluating, PolicyPassed, "all policies met"),
    edge(PolicyEvaluating, PolicyFailed, "policy violated"),
    edge(PolicyPassed, Approved, "approver bot approves"),
    edge(PolicyPassed, PolicyEvaluating, "retrigger approver path / SOD recheck"),
    edge(Approved, Merging, "automerge begins"),
    edge(Approved, Merging, "retrigger automerge (max 2)"),
    edge(Approved, PolicyEvaluating, "SOD recheck, two-approval repos (max 1)"),
    edge(Merging, Merged, "merge succeeds"),
    edge(Merging, ChecksRunning, "branch behind, auto-update"),
    edge(Merging, Closed, "merge conflicts"),
    edge(ChecksFailed, ChecksRunning, "rebuild (max 3)"),
    edge(ChecksFailed, ChecksRunning, "update branch (max 2)"),
    edge(ChecksFailed, Closed, "close & reopen (max 1, conflicts)"),
    edge(ChecksFailed, NeedsIntervention, "persistent failure / budget exhausted"),
    edge(Closed, Created, "fresh PR via close & reopen"),
    edge(PolicyFailed, PolicyEvaluating, "retrigger policy (max 2)"),
    edge(PolicyFailed, PolicyEvaluating, "SOD recheck (max 1)"),
    edge(PolicyFailed, Closed, "permanent failure: foreign commit or invalid file"),
    edge(PolicyFailed, NeedsIntervention, "unknown failure / budget exhausted"),
    // Escalation from the remaining non-terminal states.
    edge(Created, NeedsIntervention, "escalated"),
    edge(ChecksRunning, NeedsIntervention, "escalated"),
    edge(ChecksPassed, NeedsIntervention, "escalated"),
    edge(PolicyEvaluating, NeedsIntervention, "escalated"),
    edge(PolicyPassed, NeedsIntervention, "escalated"),
    edge(Approved, NeedsIntervention, "escalated"),
    edge(Merging, NeedsIntervention, "escalated"),
];

/// Whether `from -> to` is a listed edge.
pub fn is_legal(from: PrState, to: PrState) -> bool {
    TRANSITIONS.iter().any(|t| t.from == from && t.to == to)
}

pub fn ensure_legal(from: PrState, to: PrState) -> Result<(), LifecycleError> {
    if is_legal(from, to) {
        Ok(())
    } else {
        Err(LifecycleError::IllegalTransition { from, to })
    }
}

/// All edges leaving `from`, in table order.
pub fn transitions_from(from: PrState) -> impl Iterator<Item = &'static Transition> {
    TRANSITIONS.iter().filter(move |t| t.from == from)
}

/// State a remediation drives the PR towards once the command is accepted.
pub fn remediation_target(action: RemediationAction) -> PrState {
    match action {
        RemediationAction::Rebuild | RemediationAction::UpdateBranch => ChecksRunning,
        RemediationAction::CloseReopen | RemediationAction::ClosePr => Closed,
        RemediationAction::RetriggerPolicy
        | RemediationAction::RetriggerSod
        | RemediationAction::RetriggerApprover => PolicyEvaluating,
        RemediationAction::RetriggerMerge => Merging,
    }
}

/// What an acknowledged remediation does to the persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationEffect {
    /// Move along a legal edge.
    Transition(PrState),
    /// No legal edge (including self-loops): keep the state, restart the
    /// dwell clock and let the upstream event move it.
    RestartDwell,
}

pub fn remediation_effect(from: PrState, action: RemediationAction) -> RemediationEffect {
    let target = remediation_target(action);
    if is_legal(from, target) {
        RemediationEffect::Transition(target)
    } else {
        RemediationEffect::RestartDwell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            Created,
            ChecksRunning,
            ChecksPassed,
            PolicyEvaluating,
            PolicyPassed,
            Approved,
            Merging,
            Merged,
        ];
        for pair in path.windows(2) {
            assert!(is_legal(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_states_have_no_exit_except_reopen() {
        assert_eq!(transitions_from(Merged).count(), 0);
        assert_eq!(transitions_from(NeedsIntervention).count(), 0);
        let closed: Vec<_> = transitions_from(Closed).map(|t| t.to).collect();
        assert_eq!(closed, vec![Created]);
    }

    #[test]
    fn test_every_active_state_can_escalate() {
        for state in PrState::ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(is_legal(*state, NeedsIntervention), "{state}");
        }
    }

    #[test]
    fn test_illegal_transition_detected() {
        assert_eq!(
            ensure_legal(Created, Merged),
            Err(LifecycleError::IllegalTransition { from: Created, to: Merged })
        );
        assert!(!is_legal(Approved, ChecksRunning));
    }

    #[test]
    fn test_remediation_effects() {
        assert_eq!(
            remediation_effect(ChecksFailed, RemediationAction::Rebuild),
            RemediationEffect::Transition(ChecksRunning)
        );
        assert_eq!(
            remediation_effect(PolicyFailed, RemediationAction::ClosePr),
            RemediationEffect::Transition(Closed)
        );
        assert_eq!(
            remediation_effect(PolicyEvaluating, RemediationAction::RetriggerPolicy),
            RemediationEffect::RestartDwell
        );
        assert_eq!(
            remediation_effect(Merging, RemediationAction::RetriggerMerge),
            RemediationEffect::RestartDwell
        );
        assert_eq!(
            remediation_effect(Approved, RemediationAction::RetriggerSod),
            RemediationEffect::Transition(PolicyEvaluating)
        );
    }
}
