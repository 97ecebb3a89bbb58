//! Property-based tests for classification precedence.

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

use medic_core::{
    idempotency_key, lifecycle, CheckFailure, CheckRollup, CheckStatus, Classification,
    Classifier, Decision, DriftReconciler, LiveSnapshot, MergeStatus, Mergeability,
    PolicyFailureKind, PolicyResult, PrRef, PrState, PullRequestRecord, ReconciledPr,
    RemediationAction, ReviewSummary,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn any_state() -> impl Strategy<Value = PrState> {
    prop::sample::select(PrState::ALL.to_vec())
}

fn active_state() -> impl Strategy<Value = PrState> {
    prop::sample::select(
        PrState::ALL
            .iter()
            .copied()
            .filter(|s| !s.is_terminal())
            .collect::<Vec<_>>(),
    )
}

fn failure_kind() -> impl Strategy<Value = PolicyFailureKind> {
    prop::sample::select(vec![
        PolicyFailureKind::Sod,
        PolicyFailureKind::ForeignCommit,
        PolicyFailureKind::InvalidFile,
        PolicyFailureKind::BotError,
        PolicyFailureKind::Unknown,
    ])
}

fn policy() -> impl Strategy<Value = PolicyResult> {
    prop_oneof![
        Just(PolicyResult::Pending),
        Just(PolicyResult::Evaluating),
        Just(PolicyResult::Passed),
        failure_kind().prop_map(|kind| PolicyResult::Failed {
            kind,
            detail: String::new()
        }),
    ]
}

fn check_failure() -> impl Strategy<Value = CheckFailure> {
    let summaries = prop::sample::select(vec![
        "",
        "job timed out",
        "connection reset by peer",
        "error[E0425]: cannot find value",
        "2 tests failed",
        "eslint found 3 problems",
        "something odd happened",
    ]);
    ("[a-z]{3,8}", summaries).prop_map(|(name, summary)| CheckFailure::new(name, summary))
}

fn checks() -> impl Strategy<Value = CheckRollup> {
    prop_oneof![
        Just(CheckRollup {
            status: CheckStatus::Pending,
            failures: vec![]
        }),
        Just(CheckRollup::running()),
        Just(CheckRollup::passed()),
        prop::collection::vec(check_failure(), 0..4).prop_map(CheckRollup::failed),
    ]
}

fn live() -> impl Strategy<Value = LiveSnapshot> {
    (
        checks(),
        policy(),
        any::<bool>(),
        any::<bool>(),
        prop::sample::select(vec![
            MergeStatus::Open,
            MergeStatus::Merging,
            MergeStatus::Merged,
            MergeStatus::Closed,
        ]),
        prop::sample::select(vec![
            Mergeability::Mergeable,
            Mergeability::Conflicting,
            Mergeability::Unknown,
        ]),
        any::<bool>(),
    )
        .prop_map(
            |(checks, policy, approved, sod_violation, merge, mergeability, behind_base)| {
                LiveSnapshot {
                    checks,
                    policy,
                    reviews: ReviewSummary {
                        approved,
                        sod_violation,
                    },
                    merge,
                    mergeability,
                    behind_base,
                }
            },
        )
}

fn record(state: PrState, minutes: i64, two_approval_repo: bool) -> PullRequestRecord {
    let mut record = PullRequestRecord::new(
        PrRef::new("acme/api", 42),
        state,
        now() - chrono::Duration::minutes(minutes),
    );
    record.two_approval_repo = two_approval_repo;
    record
}

proptest! {
    /// Property: conflict plus branch-behind always closes and reopens.
    #[test]
    fn prop_conflict_and_behind_close_and_reopen(
        state in active_state(),
        minutes in 0i64..600,
        two in any::<bool>(),
        mut live in live(),
    ) {
        live.mergeability = Mergeability::Conflicting;
        live.behind_base = true;
        let rec = record(state, minutes, two);

        let result = Classifier::default().classify(ReconciledPr::new(&rec, &live), now());
        prop_assert_eq!(result.classification, Classification::CloseAndReopen);
        prop_assert_eq!(result.decision, Decision::Dispatch(RemediationAction::CloseReopen));
    }

    /// Property: classify returns the first matching rule, and some rule always matches.
    #[test]
    fn prop_classify_is_first_match(
        state in any_state(),
        minutes in 0i64..600,
        two in any::<bool>(),
        live in live(),
    ) {
        let rec = record(state, minutes, two);
        let classifier = Classifier::default();
        let pr = ReconciledPr::new(&rec, &live);

        let matching = classifier.matching_rules(pr, now());
        prop_assert!(!matching.is_empty());
        prop_assert_eq!(matching.last().copied(), Some(Classification::Unclassified));
        prop_assert_eq!(classifier.classify(pr, now()).classification, matching[0]);
    }

    /// Property: persistent check failures and permanent policy failures
    /// never go through the retry budget.
    #[test]
    fn prop_terminal_outcomes_bypass_budget(
        state in any_state(),
        minutes in 0i64..600,
        two in any::<bool>(),
        live in live(),
    ) {
        let rec = record(state, minutes, two);
        let result = Classifier::default().classify(ReconciledPr::new(&rec, &live), now());

        match result.classification {
            Classification::PersistentCheckFailure
            | Classification::ClosePr
            | Classification::Unclassified => {
                prop_assert!(!result.decision.is_budget_gated());
            }
            Classification::NoAction => prop_assert_eq!(result.decision, Decision::NoAction),
            _ => prop_assert!(result.decision.is_budget_gated()),
        }
    }

    /// Property: terminal records are never remediated.
    #[test]
    fn prop_terminal_records_no_action(
        state in prop::sample::select(vec![PrState::Merged, PrState::Closed, PrState::NeedsIntervention]),
        minutes in 0i64..10_000,
        live in live(),
    ) {
        let rec = record(state, minutes, false);
        let result = Classifier::default().classify(ReconciledPr::new(&rec, &live), now());
        prop_assert_eq!(result.decision, Decision::NoAction);
    }

    /// Property: drift only ever moves a record along one lifecycle edge.
    #[test]
    fn prop_drift_follows_lifecycle_edges(
        state in active_state(),
        minutes in 0i64..600,
        live in live(),
    ) {
        let rec = record(state, minutes, false);
        let outcome = DriftReconciler::default().reconcile(&rec, &live, now());

        if outcome.applied() {
            prop_assert!(lifecycle::is_legal(rec.state, outcome.record.state));
            prop_assert_eq!(outcome.record.state, live.implied_state());
            prop_assert_eq!(outcome.record.entered_state_at, now());

            let again = DriftReconciler::default().reconcile(&outcome.record, &live, now());
            prop_assert!(!again.drifted());
        } else {
            prop_assert_eq!(&outcome.record, &rec);
        }
    }

    /// Property: the idempotency key depends only on (pr, action, counter).
    #[test]
    fn prop_idempotency_key_deterministic(
        repo in "[a-z]{1,10}/[a-z]{1,10}",
        number in 1u64..100_000,
        counter in 0u32..10,
    ) {
        let pr = PrRef::new(repo.clone(), number);
        let a = idempotency_key(&pr, RemediationAction::Rebuild, counter);
        let b = idempotency_key(&PrRef::new(repo, number), RemediationAction::Rebuild, counter);
        prop_assert_eq!(&a, &b);
        prop_assert_ne!(a, idempotency_key(&pr, RemediationAction::Rebuild, counter + 1));
    }
}
