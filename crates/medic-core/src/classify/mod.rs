//! Classification engine.
//!
//! Maps a reconciled PR to exactly one outcome. The rule chain in
//! [`rules::RULES`] is walked in order and the first matching rule wins:
//!
//! 1. Merge conflict present → CLOSE_AND_REOPEN
//! 2. Branch behind base → UPDATE_BRANCH
//! 3. Checks failed, transient → RETRY_CHECKS
//! 4. Checks failed, persistent → escalate, no budget
//! 5. Policy bot stale → RETRIGGER_POLICY
//! 6. SOD failure → RETRIGGER_SOD
//! 7. Foreign commit / invalid file → CLOSE_PR, no budget
//! 8. Approver bot stale → RETRIGGER_APPROVER
//! 9. Automerge stale → RETRIGGER_MERGE
//! 10. Dwell within threshold → NO_ACTION
//! 11. Anything else → escalate, no budget
//!
//! Classification is pure: same record, snapshot and instant, same result.

pub mod rules;
pub mod signatures;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::MedicConfig;
use crate::staleness::StalenessPolicy;
use crate::types::{CheckStatus, LiveSnapshot, PrState, PullRequestRecord, RemediationAction};

pub use rules::{Rule, RuleContext, RULES};
pub use signatures::{FailureSignatures, FailureVerdict};

/// A persisted record after drift correction, paired with the live truth.
#[derive(Debug, Clone, Copy)]
pub struct ReconciledPr<'a> {
    pub record: &'a PullRequestRecord,
    pub live: &'a LiveSnapshot,
}

impl<'a> ReconciledPr<'a> {
    pub fn new(record: &'a PullRequestRecord, live: &'a LiveSnapshot) -> Self {
        Self { record, live }
    }
}

/// The eleven mutually exclusive classification outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    CloseAndReopen,
    UpdateBranch,
    RetryChecks,
    PersistentCheckFailure,
    RetriggerPolicy,
    RetriggerSod,
    ClosePr,
    RetriggerApprover,
    RetriggerMerge,
    NoAction,
    Unclassified,
}

impl Classification {
    /// Position in the priority chain, 1-based.
    pub fn rule_number(self) -> u8 {
        match self {
            Classification::CloseAndReopen => 1,
            Classification::UpdateBranch => 2,
            Classification::RetryChecks => 3,
            Classification::PersistentCheckFailure => 4,
            Classification::RetriggerPolicy => 5,
            Classification::RetriggerSod => 6,
            Classification::ClosePr => 7,
            Classification::RetriggerApprover => 8,
            Classification::RetriggerMerge => 9,
            Classification::NoAction => 10,
            Classification::Unclassified => 11,
        }
    }

    pub fn decision(self) -> Decision {
        match self {
            Classification::CloseAndReopen => Decision::Dispatch(RemediationAction::CloseReopen),
            Classification::UpdateBranch => Decision::Dispatch(RemediationAction::UpdateBranch),
            Classification::RetryChecks => Decision::Dispatch(RemediationAction::Rebuild),
            Classification::RetriggerPolicy => {
                Decision::Dispatch(RemediationAction::RetriggerPolicy)
            }
            Classification::RetriggerSod => Decision::Dispatch(RemediationAction::RetriggerSod),
            Classification::ClosePr => Decision::Dispatch(RemediationAction::ClosePr),
            Classification::RetriggerApprover => {
                Decision::Dispatch(RemediationAction::RetriggerApprover)
            }
            Classification::RetriggerMerge => Decision::Dispatch(RemediationAction::RetriggerMerge),
            Classification::NoAction => Decision::NoAction,
            Classification::PersistentCheckFailure | Classification::Unclassified => {
                Decision::Escalate
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Classification::CloseAndReopen => "CLOSE_AND_REOPEN",
            Classification::UpdateBranch => "UPDATE_BRANCH",
            Classification::RetryChecks => "RETRY_CHECKS",
            Classification::PersistentCheckFailure => "PERSISTENT_CHECK_FAILURE",
            Classification::RetriggerPolicy => "RETRIGGER_POLICY",
            Classification::RetriggerSod => "RETRIGGER_SOD",
            Classification::ClosePr => "CLOSE_PR",
            Classification::RetriggerApprover => "RETRIGGER_APPROVER",
            Classification::RetriggerMerge => "RETRIGGER_MERGE",
            Classification::NoAction => "NO_ACTION",
            Classification::Unclassified => "UNCLASSIFIED",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the reconciler should do with a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "action", rename_all = "snake_case")]
pub enum Decision {
    Dispatch(RemediationAction),
    NoAction,
    Escalate,
}

impl Decision {
    /// Only budgeted dispatches consult the retry budget.
    pub fn is_budget_gated(self) -> bool {
        matches!(self, Decision::Dispatch(action) if action.is_budgeted())
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Dispatch(action) => write!(f, "DISPATCH({})", action),
            Decision::NoAction => f.write_str("NO_ACTION"),
            Decision::Escalate => f.write_str("ESCALATE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub classification: Classification,
    pub decision: Decision,
    pub reason: String,
}

/// Rule-chain evaluator bound to a staleness policy and failure signatures.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    staleness: StalenessPolicy,
    signatures: FailureSignatures,
}

impl Classifier {
    pub fn new(staleness: StalenessPolicy, signatures: FailureSignatures) -> Self {
        Self {
            staleness,
            signatures,
        }
    }

    pub fn from_config(config: &MedicConfig) -> Self {
        Self::new(
            config.staleness.clone(),
            FailureSignatures::from_config(&config.classification),
        )
    }

    pub fn staleness(&self) -> &StalenessPolicy {
        &self.staleness
    }

    fn context<'a>(&self, pr: ReconciledPr<'a>, now: DateTime<Utc>) -> RuleContext<'a> {
        let dwell = pr.record.dwell(now);
        let threshold = self.staleness.threshold(pr.record.state);
        let checks_verdict = (pr.record.state == PrState::ChecksFailed
            && pr.live.checks.status == CheckStatus::Failed)
            .then(|| self.signatures.judge(&pr.live.checks.failures));

        RuleContext {
            record: pr.record,
            live: pr.live,
            dwell,
            threshold,
            stale: self.staleness.exceeds(pr.record.state, dwell),
            checks_verdict,
        }
    }

    /// Classify a reconciled PR at `now`.
    pub fn classify(&self, pr: ReconciledPr<'_>, now: DateTime<Utc>) -> ClassificationResult {
        let ctx = self.context(pr, now);

        // The final rule always applies, so the fallback is never reached.
        let classification = RULES
            .iter()
            .find(|rule| rule.applies(&ctx))
            .map(|rule| rule.classification)
            .unwrap_or(Classification::Unclassified);

        let result = ClassificationResult {
            classification,
            decision: classification.decision(),
            reason: rules::reason(classification, &ctx),
        };

        tracing::debug!(
            pr = %pr.record.pr,
            state = %pr.record.state,
            rule = classification.rule_number(),
            classification = %classification,
            decision = %result.decision,
            "Classified PR"
        );

        result
    }

    /// Every rule whose predicate holds, in priority order.
    pub fn matching_rules(&self, pr: ReconciledPr<'_>, now: DateTime<Utc>) -> Vec<Classification> {
        let ctx = self.context(pr, now);
        RULES
            .iter()
            .filter(|rule| rule.applies(&ctx))
            .map(|rule| rule.classification)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CheckFailure, CheckRollup, Mergeability, PolicyFailureKind, PolicyResult, PrRef,
    };
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn record(state: PrState, minutes: i64) -> PullRequestRecord {
        PullRequestRecord::new(
            PrRef::new("acme/api", 42),
            state,
            now() - chrono::Duration::minutes(minutes),
        )
    }

    fn live_for(state: PrState) -> LiveSnapshot {
        let mut live = LiveSnapshot::with_checks(CheckRollup::passed());
        match state {
            PrState::Created => live.checks = CheckRollup {
                status: CheckStatus::Pending,
                failures: vec![],
            },
            PrState::ChecksRunning => live.checks = CheckRollup::running(),
            PrState::ChecksFailed => live.checks = CheckRollup::failed(vec![]),
            PrState::PolicyEvaluating => live.policy = PolicyResult::Evaluating,
            PrState::PolicyPassed => live.policy = PolicyResult::Passed,
            PrState::Approved => {
                live.policy = PolicyResult::Passed;
                live.reviews.approved = true;
            }
            _ => {}
        }
        live
    }

    fn classify(record: &PullRequestRecord, live: &LiveSnapshot) -> ClassificationResult {
        Classifier::default().classify(ReconciledPr::new(record, live), now())
    }

    #[test]
    fn test_transient_check_failure_retries() {
        let rec = record(PrState::ChecksFailed, 35);
        let mut live = live_for(PrState::ChecksFailed);
        live.checks.failures = vec![CheckFailure::new("build", "runner lost communication")];

        let result = classify(&rec, &live);
        assert_eq!(result.classification, Classification::RetryChecks);
        assert_eq!(result.decision, Decision::Dispatch(RemediationAction::Rebuild));
        assert!(result.reason.contains("build"));
    }

    #[test]
    fn test_persistent_check_failure_escalates() {
        let rec = record(PrState::ChecksFailed, 35);
        let mut live = live_for(PrState::ChecksFailed);
        live.checks.failures = vec![CheckFailure::new("test", "AssertionError: expected 1")];

        let result = classify(&rec, &live);
        assert_eq!(result.classification, Classification::PersistentCheckFailure);
        assert_eq!(result.decision, Decision::Escalate);
        assert!(!result.decision.is_budget_gated());
    }

    #[test]
    fn test_conflict_beats_everything() {
        let rec = record(PrState::ChecksFailed, 35);
        let mut live = live_for(PrState::ChecksFailed);
        live.mergeability = Mergeability::Conflicting;
        live.behind_base = true;

        let result = classify(&rec, &live);
        assert_eq!(result.classification, Classification::CloseAndReopen);

        let matching = Classifier::default().matching_rules(ReconciledPr::new(&rec, &live), now());
        assert_eq!(
            &matching[..3],
            &[
                Classification::CloseAndReopen,
                Classification::UpdateBranch,
                Classification::RetryChecks
            ]
        );
    }

    #[test]
    fn test_behind_base_updates_branch() {
        let rec = record(PrState::Approved, 12);
        let mut live = live_for(PrState::Approved);
        live.behind_base = true;
        assert_eq!(classify(&rec, &live).classification, Classification::UpdateBranch);
    }

    #[test]
    fn test_policy_rules() {
        let stale_eval = record(PrState::PolicyEvaluating, 31);
        assert_eq!(
            classify(&stale_eval, &live_for(PrState::PolicyEvaluating)).classification,
            Classification::RetriggerPolicy
        );

        let failed = record(PrState::PolicyFailed, 1);
        let mut live = live_for(PrState::PolicyFailed);

        live.policy = PolicyResult::Failed {
            kind: PolicyFailureKind::BotError,
            detail: String::new(),
        };
        assert_eq!(classify(&failed, &live).classification, Classification::RetriggerPolicy);

        live.policy = PolicyResult::Failed {
            kind: PolicyFailureKind::Sod,
            detail: String::new(),
        };
        assert_eq!(classify(&failed, &live).classification, Classification::RetriggerSod);

        live.policy = PolicyResult::Failed {
            kind: PolicyFailureKind::ForeignCommit,
            detail: "commit abc123 by mallory".to_string(),
        };
        let result = classify(&failed, &live);
        assert_eq!(result.classification, Classification::ClosePr);
        assert!(!result.decision.is_budget_gated());
        assert!(result.reason.contains("mallory"));
    }

    #[test]
    fn test_unknown_policy_failure() {
        let mut live = live_for(PrState::PolicyFailed);
        live.policy = PolicyResult::Failed {
            kind: PolicyFailureKind::Unknown,
            detail: String::new(),
        };
        assert_eq!(
            classify(&record(PrState::PolicyFailed, 5), &live).classification,
            Classification::NoAction
        );
        assert_eq!(
            classify(&record(PrState::PolicyFailed, 11), &live).classification,
            Classification::Unclassified
        );
    }

    #[test]
    fn test_sod_on_approved_needs_two_approval_repo() {
        let mut live = live_for(PrState::Approved);
        live.reviews.sod_violation = true;

        let mut rec = record(PrState::Approved, 1);
        assert_eq!(classify(&rec, &live).classification, Classification::NoAction);

        rec.two_approval_repo = true;
        assert_eq!(classify(&rec, &live).classification, Classification::RetriggerSod);
    }

    #[test]
    fn test_stale_approval_and_merge() {
        assert_eq!(
            classify(&record(PrState::PolicyPassed, 16), &live_for(PrState::PolicyPassed))
                .classification,
            Classification::RetriggerApprover
        );
        assert_eq!(
            classify(&record(PrState::Approved, 11), &live_for(PrState::Approved)).classification,
            Classification::RetriggerMerge
        );
    }

    #[test]
    fn test_within_threshold_no_action() {
        let result = classify(&record(PrState::ChecksRunning, 20), &live_for(PrState::ChecksRunning));
        assert_eq!(result.classification, Classification::NoAction);
        assert_eq!(result.decision, Decision::NoAction);
    }

    #[test]
    fn test_stalled_checks_fall_through() {
        let result = classify(&record(PrState::ChecksRunning, 61), &live_for(PrState::ChecksRunning));
        assert_eq!(result.classification, Classification::Unclassified);
        assert_eq!(result.classification.rule_number(), 11);
        assert_eq!(result.decision, Decision::Escalate);
    }

    #[test]
    fn test_terminal_records_take_no_action() {
        let mut live = live_for(PrState::ChecksFailed);
        live.mergeability = Mergeability::Conflicting;
        let result = classify(&record(PrState::NeedsIntervention, 600), &live);
        assert_eq!(result.classification, Classification::NoAction);
    }

    #[test]
    fn test_every_classification_has_a_rule() {
        let numbers: Vec<u8> = RULES.iter().map(|r| r.classification.rule_number()).collect();
        assert_eq!(numbers, (1..=11).collect::<Vec<u8>>());
    }
}
