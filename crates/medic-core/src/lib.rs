//! # medic-core
//!
//! Deterministic decision engine for AutoMergeMedic, a reconciler that keeps
//! automated PR merges moving through checks, policy, approval and merge.
//!
//! This crate answers, for one PR at one instant:
//! - Has the persisted state drifted from upstream truth?
//! - Is the PR stale in its current state?
//! - Which single remediation, if any, should be taken?
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: Same record, snapshot and instant give the same result
//! 2. **No I/O**: Nothing here talks to the network; see `medic-runtime`
//! 3. **Total**: Every PR gets exactly one classification
//! 4. **Table-driven**: Legal transitions live in [`lifecycle::TRANSITIONS`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use medic_core::{classify, Classifier, LiveSnapshot, MedicConfig};
//!
//! let config = MedicConfig::from_yaml_file("medic.yaml")?;
//! let classifier = Classifier::from_config(&config);
//! let result = classify(&classifier, &record, &live, Utc::now());
//!
//! match result.decision {
//!     Decision::Dispatch(action) => println!("dispatch {}", action.slash_command()),
//!     Decision::NoAction => println!("ok: {}", result.reason),
//!     Decision::Escalate => println!("escalate: {}", result.reason),
//! }
//! ```

pub mod classify;
pub mod command;
pub mod config;
pub mod drift;
pub mod lifecycle;
pub mod staleness;
pub mod types;

// Re-export main types at crate root
pub use classify::{
    Classification, ClassificationResult, Classifier, Decision, FailureSignatures,
    FailureVerdict, ReconciledPr,
};
pub use command::{idempotency_key, RemediationCommand};
pub use config::{
    BudgetScope, CallConfig, CircuitBreakerConfig, ClassificationConfig, ConfigError,
    GithubConfig, MedicConfig, RetryLimits, SchedulerConfig,
};
pub use drift::{DriftCorrection, DriftOutcome, DriftReconciler};
pub use lifecycle::{LifecycleError, Transition};
pub use staleness::StalenessPolicy;
pub use types::{
    CheckFailure, CheckRollup, CheckStatus, LiveSnapshot, MergeStatus, Mergeability,
    PolicyFailureKind, PolicyResult, PrRef, PrState, PullRequestRecord, RemediationAction,
    RetryCounters, ReviewSummary,
};

use chrono::{DateTime, Utc};

/// Classify a persisted record against its live snapshot.
///
/// Convenience wrapper around [`Classifier::classify`]; drift correction is
/// the caller's job.
pub fn classify(
    classifier: &Classifier,
    record: &PullRequestRecord,
    live: &LiveSnapshot,
    now: DateTime<Utc>,
) -> ClassificationResult {
    classifier.classify(ReconciledPr::new(record, live), now)
}

/// Reconcile drift, then classify the corrected record.
///
/// Returns the drift outcome alongside the classification, or `None` for
/// the classification when the corrected record is no longer stale.
pub fn reconcile_and_classify(
    config: &MedicConfig,
    record: &PullRequestRecord,
    live: &LiveSnapshot,
    now: DateTime<Utc>,
) -> (DriftOutcome, Option<ClassificationResult>) {
    let outcome = DriftReconciler::new(config.budget_scope).reconcile(record, live, now);
    if !config.staleness.is_stale(&outcome.record, now) {
        return (outcome, None);
    }
    let classifier = Classifier::from_config(config);
    let result = classify(&classifier, &outcome.record, live, now);
    (outcome, Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_pr_42_transient_failure() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let record = PullRequestRecord::new(
            PrRef::new("acme/payments", 42),
            PrState::ChecksFailed,
            now - chrono::Duration::minutes(35),
        );
        let live = LiveSnapshot::with_checks(CheckRollup::failed(vec![CheckFailure::new(
            "ci/build",
            "Job timed out after 60 minutes",
        )]));

        let (drift, result) = reconcile_and_classify(&MedicConfig::default(), &record, &live, now);
        assert!(!drift.drifted());
        let result = result.unwrap();
        assert_eq!(result.classification, Classification::RetryChecks);
        assert_eq!(result.decision, Decision::Dispatch(RemediationAction::Rebuild));
    }

    #[test]
    fn test_drift_correction_skips_classification() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let record = PullRequestRecord::new(
            PrRef::new("acme/payments", 9),
            PrState::ChecksRunning,
            now - chrono::Duration::minutes(90),
        );
        let live = LiveSnapshot::with_checks(CheckRollup::passed());

        let (drift, result) = reconcile_and_classify(&MedicConfig::default(), &record, &live, now);
        assert_eq!(drift.record.state, PrState::ChecksPassed);
        assert_eq!(drift.record.entered_state_at, now);
        assert!(result.is_none());
    }
}
