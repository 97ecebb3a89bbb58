//! The ordered rule chain.
//!
//! Each rule is a plain predicate over the reconciled PR. The first rule
//! whose predicate holds decides the outcome; the last rule always holds.

use std::time::Duration;

use super::signatures::FailureVerdict;
use super::Classification;
use crate::types::{LiveSnapshot, PolicyFailureKind, PolicyResult, PrState, PullRequestRecord};

/// Everything a rule predicate may look at.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub record: &'a PullRequestRecord,
    pub live: &'a LiveSnapshot,
    pub dwell: Duration,
    pub threshold: Option<Duration>,
    /// Dwell exceeds the state's threshold
    pub stale: bool,
    /// Set only while the record sits in CHECKS_FAILED
    pub checks_verdict: Option<FailureVerdict>,
}

impl RuleContext<'_> {
    fn state(&self) -> PrState {
        self.record.state
    }

    fn active(&self) -> bool {
        !self.record.state.is_terminal()
    }

    fn policy_failure(&self) -> Option<PolicyFailureKind> {
        match (&self.live.policy, self.state()) {
            (PolicyResult::Failed { kind, .. }, PrState::PolicyFailed) => Some(*kind),
            _ => None,
        }
    }
}

/// A `(predicate, classification)` pair.
#[derive(Clone, Copy)]
pub struct Rule {
    pub classification: Classification,
    applies: fn(&RuleContext<'_>) -> bool,
}

impl Rule {
    pub fn applies(&self, ctx: &RuleContext<'_>) -> bool {
        (self.applies)(ctx)
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("classification", &self.classification)
            .finish()
    }
}

/// Rules in priority order.
pub static RULES: [Rule; 11] = [
    Rule {
        classification: Classification::CloseAndReopen,
        applies: |ctx| ctx.active() && ctx.live.has_conflict(),
    },
    Rule {
        classification: Classification::UpdateBranch,
        applies: |ctx| ctx.active() && ctx.live.behind_base,
    },
    Rule {
        classification: Classification::RetryChecks,
        applies: |ctx| ctx.checks_verdict == Some(FailureVerdict::Transient),
    },
    Rule {
        classification: Classification::PersistentCheckFailure,
        applies: |ctx| ctx.checks_verdict == Some(FailureVerdict::Persistent),
    },
    Rule {
        classification: Classification::RetriggerPolicy,
        applies: |ctx| match ctx.state() {
            PrState::ChecksPassed | PrState::PolicyEvaluating => ctx.stale,
            PrState::PolicyFailed => ctx.policy_failure() == Some(PolicyFailureKind::BotError),
            _ => false,
        },
    },
    Rule {
        classification: Classification::RetriggerSod,
        applies: |ctx| match ctx.state() {
            PrState::PolicyFailed => ctx.policy_failure() == Some(PolicyFailureKind::Sod),
            PrState::PolicyPassed => ctx.live.reviews.sod_violation,
            PrState::Approved => ctx.live.reviews.sod_violation && ctx.record.two_approval_repo,
            _ => false,
        },
    },
    Rule {
        classification: Classification::ClosePr,
        applies: |ctx| ctx.policy_failure().is_some_and(PolicyFailureKind::is_permanent),
    },
    Rule {
        classification: Classification::RetriggerApprover,
        applies: |ctx| ctx.state() == PrState::PolicyPassed && ctx.stale,
    },
    Rule {
        classification: Classification::RetriggerMerge,
        applies: |ctx| matches!(ctx.state(), PrState::Approved | PrState::Merging) && ctx.stale,
    },
    Rule {
        classification: Classification::NoAction,
        applies: |ctx| !ctx.stale,
    },
    Rule {
        classification: Classification::Unclassified,
        applies: |_| true,
    },
];

fn human(d: Duration) -> String {
    humantime::format_duration(Duration::from_secs(d.as_secs())).to_string()
}

fn dwell_note(ctx: &RuleContext<'_>) -> String {
    match ctx.threshold {
        Some(limit) => format!(
            "{} for {} (threshold {})",
            ctx.state(),
            human(ctx.dwell),
            human(limit)
        ),
        None => format!("{} for {}", ctx.state(), human(ctx.dwell)),
    }
}

/// Human-readable reason for a classification.
pub(crate) fn reason(classification: Classification, ctx: &RuleContext<'_>) -> String {
    match classification {
        Classification::CloseAndReopen => "merge conflict with base branch".to_string(),
        Classification::UpdateBranch => "branch is behind base".to_string(),
        Classification::RetryChecks => format!(
            "checks failed with transient signatures: {}",
            failed_check_names(ctx)
        ),
        Classification::PersistentCheckFailure => format!(
            "checks failed with persistent signatures: {}",
            failed_check_names(ctx)
        ),
        Classification::RetriggerPolicy => match ctx.policy_failure() {
            Some(_) => "policy bot errored".to_string(),
            None => format!("policy bot stale: {}", dwell_note(ctx)),
        },
        Classification::RetriggerSod => "separation-of-duties check failed".to_string(),
        Classification::ClosePr => match &ctx.live.policy {
            PolicyResult::Failed { kind, detail } if !detail.is_empty() => {
                format!("permanent policy failure ({:?}): {}", kind, detail)
            }
            PolicyResult::Failed { kind, .. } => format!("permanent policy failure ({:?})", kind),
            _ => "permanent policy failure".to_string(),
        },
        Classification::RetriggerApprover => format!("approver bot stale: {}", dwell_note(ctx)),
        Classification::RetriggerMerge => format!("automerge stale: {}", dwell_note(ctx)),
        Classification::NoAction => format!("within threshold: {}", dwell_note(ctx)),
        Classification::Unclassified => format!("stalled with no known remedy: {}", dwell_note(ctx)),
    }
}

fn failed_check_names(ctx: &RuleContext<'_>) -> String {
    if ctx.live.checks.failures.is_empty() {
        return "(no details)".to_string();
    }
    ctx.live
        .checks
        .failures
        .iter()
        .map(|f| f.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
