//! Drift reconciliation.
//!
//! The state store is a projection of upstream events and can fall behind
//! (missed webhooks, redelivery gaps). Before a PR is classified its
//! persisted state is compared against the state the live snapshot implies
//! and, when they disagree, corrected to the live truth.
//!
//! Only single edges of the lifecycle table are applied. A jump that is not
//! an edge is still reported, but the persisted state is left as it was.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::BudgetScope;
use crate::lifecycle;
use crate::types::{LiveSnapshot, PrState, PullRequestRecord};

/// One correction from persisted state to live truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftCorrection {
    pub from: PrState,
    pub to: PrState,
    /// `from -> to` is a single edge of the lifecycle table. Only legal
    /// corrections are applied to the record.
    pub legal_edge: bool,
    /// Counters were cleared because the PR moved forward
    pub counters_reset: bool,
    pub corrected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriftOutcome {
    /// The record to classify, corrected if it drifted
    pub record: PullRequestRecord,
    pub correction: Option<DriftCorrection>,
}

impl DriftOutcome {
    /// Persisted and live state disagreed.
    pub fn drifted(&self) -> bool {
        self.correction.is_some()
    }

    /// The record was changed and needs writing back.
    pub fn applied(&self) -> bool {
        self.correction.as_ref().is_some_and(|c| c.legal_edge)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DriftReconciler {
    scope: BudgetScope,
}

impl DriftReconciler {
    pub fn new(scope: BudgetScope) -> Self {
        Self { scope }
    }

    /// Correct `record` to the state `live` implies.
    ///
    /// The staleness clock restarts at `now` on correction. Jumps that are
    /// not a lifecycle edge are reported and left unapplied. NEEDS_INTERVENTION
    /// is never corrected; it is set by the reconciler, not by upstream.
    pub fn reconcile(
        &self,
        record: &PullRequestRecord,
        live: &LiveSnapshot,
        now: DateTime<Utc>,
    ) -> DriftOutcome {
        let from = record.state;
        let to = live.implied_state();

        if from == to || from == PrState::NeedsIntervention {
            return DriftOutcome {
                record: record.clone(),
                correction: None,
            };
        }

        let legal_edge = lifecycle::is_legal(from, to);
        if !legal_edge {
            tracing::warn!(
                event = "STATE_DRIFT_CORRECTED",
                pr = %record.pr,
                from = %from,
                to = %to,
                "Upstream state is not reachable in one step, keeping persisted state"
            );
            return DriftOutcome {
                record: record.clone(),
                correction: Some(DriftCorrection {
                    from,
                    to,
                    legal_edge,
                    counters_reset: false,
                    corrected_at: now,
                }),
            };
        }

        let counters_reset = self.scope == BudgetScope::ResetOnProgress
            && is_forward_progress(from, to)
            && record.retry_counts.total() > 0;

        let mut corrected = record.clone();
        corrected.state = to;
        corrected.restart_dwell(now);
        if counters_reset {
            corrected.retry_counts.reset();
        }

        tracing::warn!(
            event = "STATE_DRIFT_CORRECTED",
            pr = %record.pr,
            from = %from,
            to = %to,
            counters_reset,
            "Persisted state drifted from upstream"
        );

        DriftOutcome {
            record: corrected,
            correction: Some(DriftCorrection {
                from,
                to,
                legal_edge,
                counters_reset,
                corrected_at: now,
            }),
        }
    }
}

/// Strictly further along the happy path, not counting closes or escalations.
fn is_forward_progress(from: PrState, to: PrState) -> bool {
    !matches!(to, PrState::Closed | PrState::NeedsIntervention)
        && to.progress_rank() > from.progress_rank()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CheckRollup, MergeStatus, PolicyResult, PrRef, RemediationAction};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn record(state: PrState) -> PullRequestRecord {
        PullRequestRecord::new(
            PrRef::new("acme/api", 42),
            state,
            t0() - chrono::Duration::minutes(90),
        )
    }

    #[test]
    fn test_running_corrected_to_passed() {
        let rec = record(PrState::ChecksRunning);
        let live = LiveSnapshot::with_checks(CheckRollup::passed());

        let outcome = DriftReconciler::default().reconcile(&rec, &live, t0());
        assert!(outcome.drifted());
        assert_eq!(outcome.record.state, PrState::ChecksPassed);
        assert_eq!(outcome.record.entered_state_at, t0());

        let correction = outcome.correction.unwrap();
        assert_eq!(correction.from, PrState::ChecksRunning);
        assert!(correction.legal_edge);
    }

    #[test]
    fn test_no_drift_keeps_record() {
        let rec = record(PrState::ChecksRunning);
        let live = LiveSnapshot::with_checks(CheckRollup::running());

        let outcome = DriftReconciler::default().reconcile(&rec, &live, t0());
        assert!(!outcome.drifted());
        assert_eq!(outcome.record, rec);
    }

    #[test]
    fn test_multi_edge_jump_not_applied() {
        let rec = record(PrState::ChecksRunning);
        let mut live = LiveSnapshot::with_checks(CheckRollup::passed());
        live.merge = MergeStatus::Merged;

        let outcome = DriftReconciler::default().reconcile(&rec, &live, t0());
        assert!(outcome.drifted());
        assert!(!outcome.applied());
        assert_eq!(outcome.record, rec);

        let correction = outcome.correction.unwrap();
        assert_eq!(correction.to, PrState::Merged);
        assert!(!correction.legal_edge);
        assert!(!correction.counters_reset);
    }

    #[test]
    fn test_skipped_stage_not_applied() {
        let mut rec = record(PrState::ChecksFailed);
        rec.retry_counts.set(RemediationAction::Rebuild, 2);
        let live = LiveSnapshot::with_checks(CheckRollup::passed());

        let outcome =
            DriftReconciler::new(BudgetScope::ResetOnProgress).reconcile(&rec, &live, t0());
        assert!(!outcome.applied());
        assert_eq!(outcome.record.state, PrState::ChecksFailed);
        assert_eq!(outcome.record.retry_counts.rebuild, 2);
    }

    #[test]
    fn test_needs_intervention_is_sticky() {
        let rec = record(PrState::NeedsIntervention);
        let live = LiveSnapshot::with_checks(CheckRollup::running());
        assert!(!DriftReconciler::default().reconcile(&rec, &live, t0()).drifted());
    }

    #[test]
    fn test_lifetime_scope_keeps_counters() {
        let mut rec = record(PrState::ChecksRunning);
        rec.retry_counts.set(RemediationAction::Rebuild, 2);
        let live = LiveSnapshot::with_checks(CheckRollup::passed());

        let outcome = DriftReconciler::new(BudgetScope::Lifetime).reconcile(&rec, &live, t0());
        assert!(outcome.applied());
        assert_eq!(outcome.record.retry_counts.rebuild, 2);
    }

    #[test]
    fn test_reset_on_progress_clears_counters() {
        let mut rec = record(PrState::ChecksPassed);
        rec.retry_counts.set(RemediationAction::Rebuild, 2);
        let mut live = LiveSnapshot::with_checks(CheckRollup::passed());
        live.policy = PolicyResult::Evaluating;

        let outcome =
            DriftReconciler::new(BudgetScope::ResetOnProgress).reconcile(&rec, &live, t0());
        assert_eq!(outcome.record.state, PrState::PolicyEvaluating);
        assert_eq!(outcome.record.retry_counts.total(), 0);
        assert!(outcome.correction.unwrap().counters_reset);
    }

    #[test]
    fn test_reset_on_progress_ignores_regression() {
        let mut rec = record(PrState::Merging);
        rec.retry_counts.set(RemediationAction::RetriggerMerge, 1);
        let live = LiveSnapshot::with_checks(CheckRollup::running());

        let outcome =
            DriftReconciler::new(BudgetScope::ResetOnProgress).reconcile(&rec, &live, t0());
        assert_eq!(outcome.record.state, PrState::ChecksRunning);
        assert!(outcome.applied());
        assert_eq!(outcome.record.retry_counts.retrigger_merge, 1);
    }
}
