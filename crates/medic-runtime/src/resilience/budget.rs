//! Per-PR retry budgets.
//!
//! A reservation is taken before a command is enqueued and committed only
//! once the queue acknowledges it, so a failed enqueue never burns budget.

use medic_core::{PullRequestRecord, RemediationAction, RetryLimits};
use serde::Serialize;

/// A pending attempt that has not been committed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub action: RemediationAction,

    /// Counter value before this attempt; feeds the idempotency key
    pub counter_before: u32,

    /// 1-based attempt number
    pub attempt_number: u32,
}

/// Result of a budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    Reserved(Reservation),
    Exhausted {
        action: RemediationAction,
        used: u32,
        max: u32,
    },
}

/// Budget gate over the configured retry limits.
#[derive(Debug, Clone, Default)]
pub struct RetryBudget {
    limits: RetryLimits,
}

impl RetryBudget {
    pub fn new(limits: RetryLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RetryLimits {
        &self.limits
    }

    /// Check whether `action` may run again for this PR.
    ///
    /// Unbudgeted actions always reserve attempt 1.
    pub fn check_and_reserve(
        &self,
        record: &PullRequestRecord,
        action: RemediationAction,
    ) -> BudgetCheck {
        let Some(max) = self.limits.max_for(action) else {
            return BudgetCheck::Reserved(Reservation {
                action,
                counter_before: 0,
                attempt_number: 1,
            });
        };

        let used = record.retry_counts.get(action);
        if used >= max {
            return BudgetCheck::Exhausted { action, used, max };
        }

        BudgetCheck::Reserved(Reservation {
            action,
            counter_before: used,
            attempt_number: used + 1,
        })
    }

    /// Commit an acknowledged attempt onto the working copy of the record.
    ///
    /// Sets the counter to the reserved attempt rather than incrementing, so
    /// committing the same reservation twice is harmless.
    pub fn commit(&self, record: &mut PullRequestRecord, reservation: &Reservation) {
        record
            .retry_counts
            .set(reservation.action, reservation.attempt_number);
    }

    /// Remaining attempts for `action`, `None` when unbudgeted.
    pub fn remaining(&self, record: &PullRequestRecord, action: RemediationAction) -> Option<u32> {
        self.limits
            .max_for(action)
            .map(|max| max.saturating_sub(record.retry_counts.get(action)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use medic_core::{PrRef, PrState};
    use proptest::prelude::*;

    fn record() -> PullRequestRecord {
        PullRequestRecord::new(PrRef::new("acme/api", 42), PrState::ChecksFailed, Utc::now())
    }

    #[test]
    fn test_first_rebuild_reserves_attempt_one() {
        let budget = RetryBudget::default();
        let check = budget.check_and_reserve(&record(), RemediationAction::Rebuild);
        assert_eq!(
            check,
            BudgetCheck::Reserved(Reservation {
                action: RemediationAction::Rebuild,
                counter_before: 0,
                attempt_number: 1,
            })
        );
    }

    #[test]
    fn test_exhausted_at_max() {
        let budget = RetryBudget::default();
        let mut rec = record();
        rec.retry_counts.set(RemediationAction::Rebuild, 3);
        assert_eq!(
            budget.check_and_reserve(&rec, RemediationAction::Rebuild),
            BudgetCheck::Exhausted {
                action: RemediationAction::Rebuild,
                used: 3,
                max: 3
            }
        );
        assert_eq!(budget.remaining(&rec, RemediationAction::Rebuild), Some(0));
    }

    #[test]
    fn test_close_pr_never_gated() {
        let budget = RetryBudget::default();
        let check = budget.check_and_reserve(&record(), RemediationAction::ClosePr);
        assert!(matches!(check, BudgetCheck::Reserved(r) if r.attempt_number == 1));
        assert_eq!(budget.remaining(&record(), RemediationAction::ClosePr), None);
    }

    #[test]
    fn test_commit_is_idempotent() {
        let budget = RetryBudget::default();
        let mut rec = record();
        let BudgetCheck::Reserved(reservation) =
            budget.check_and_reserve(&rec, RemediationAction::UpdateBranch)
        else {
            panic!("expected reservation");
        };
        budget.commit(&mut rec, &reservation);
        budget.commit(&mut rec, &reservation);
        assert_eq!(rec.retry_counts.update_branch, 1);
    }

    proptest! {
        /// Property: reserving and committing never pushes a counter past its max.
        #[test]
        fn prop_counters_never_exceed_max(
            max in 0u32..6,
            attempts in 0usize..20,
        ) {
            let limits = RetryLimits { rebuild: max, ..Default::default() };
            let budget = RetryBudget::new(limits);
            let mut rec = record();
            let mut exhausted = false;

            for _ in 0..attempts {
                match budget.check_and_reserve(&rec, RemediationAction::Rebuild) {
                    BudgetCheck::Reserved(r) => {
                        prop_assert!(!exhausted);
                        budget.commit(&mut rec, &r);
                    }
                    BudgetCheck::Exhausted { used, .. } => {
                        prop_assert_eq!(used, max);
                        exhausted = true;
                    }
                }
                prop_assert!(rec.retry_counts.rebuild <= max);
            }
            prop_assert_eq!(rec.retry_counts.rebuild, max.min(attempts as u32));
        }
    }
}
