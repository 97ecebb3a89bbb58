//! Core data model: PR identity, lifecycle states, retry counters,
//! persisted records and the live upstream snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrRef {
    /// Repository slug (e.g., "acme/payments")
    pub repository: String,

    /// PR number within the repository
    pub number: u64,
}

impl PrRef {
    pub fn new(repository: impl Into<String>, number: u64) -> Self {
        Self {
            repository: repository.into(),
            number,
        }
    }
}

impl fmt::Display for PrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repository, self.number)
    }
}

/// Lifecycle state of a PR in the merge pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrState {
    Created,
    ChecksRunning,
    ChecksPassed,
    ChecksFailed,
    PolicyEvaluating,
    PolicyPassed,
    PolicyFailed,
    Approved,
    Merging,
    Merged,
    Closed,
    NeedsIntervention,
}

impl PrState {
    pub const ALL: [PrState; 12] = [
        PrState::Created,
        PrState::ChecksRunning,
        PrState::ChecksPassed,
        PrState::ChecksFailed,
        PrState::PolicyEvaluating,
        PrState::PolicyPassed,
        PrState::PolicyFailed,
        PrState::Approved,
        PrState::Merging,
        PrState::Merged,
        PrState::Closed,
        PrState::NeedsIntervention,
    ];

    /// Terminal states are never stale and never remediated.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PrState::Merged | PrState::Closed | PrState::NeedsIntervention
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PrState::Created => "CREATED",
            PrState::ChecksRunning => "CHECKS_RUNNING",
            PrState::ChecksPassed => "CHECKS_PASSED",
            PrState::ChecksFailed => "CHECKS_FAILED",
            PrState::PolicyEvaluating => "POLICY_EVALUATING",
            PrState::PolicyPassed => "POLICY_PASSED",
            PrState::PolicyFailed => "POLICY_FAILED",
            PrState::Approved => "APPROVED",
            PrState::Merging => "MERGING",
            PrState::Merged => "MERGED",
            PrState::Closed => "CLOSED",
            PrState::NeedsIntervention => "NEEDS_INTERVENTION",
        }
    }

    /// Position along the happy path. Failure states share the rank of the
    /// stage they failed in.
    pub fn progress_rank(self) -> u8 {
        match self {
            PrState::Created => 0,
            PrState::ChecksRunning | PrState::ChecksFailed => 1,
            PrState::ChecksPassed => 2,
            PrState::PolicyEvaluating | PrState::PolicyFailed => 3,
            PrState::PolicyPassed => 4,
            PrState::Approved => 5,
            PrState::Merging => 6,
            PrState::Merged | PrState::Closed | PrState::NeedsIntervention => 7,
        }
    }
}

impl fmt::Display for PrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A corrective command the reconciler can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    Rebuild,
    UpdateBranch,
    CloseReopen,
    RetriggerPolicy,
    RetriggerSod,
    RetriggerApprover,
    RetriggerMerge,
    /// Permanent close; never budget-gated.
    ClosePr,
}

impl RemediationAction {
    /// Actions that consume a retry counter.
    pub const BUDGETED: [RemediationAction; 7] = [
        RemediationAction::Rebuild,
        RemediationAction::UpdateBranch,
        RemediationAction::CloseReopen,
        RemediationAction::RetriggerPolicy,
        RemediationAction::RetriggerSod,
        RemediationAction::RetriggerApprover,
        RemediationAction::RetriggerMerge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RemediationAction::Rebuild => "rebuild",
            RemediationAction::UpdateBranch => "update_branch",
            RemediationAction::CloseReopen => "close_reopen",
            RemediationAction::RetriggerPolicy => "retrigger_policy",
            RemediationAction::RetriggerSod => "retrigger_sod",
            RemediationAction::RetriggerApprover => "retrigger_approver",
            RemediationAction::RetriggerMerge => "retrigger_merge",
            RemediationAction::ClosePr => "close_pr",
        }
    }

    /// Slash command understood by the command router.
    pub fn slash_command(self) -> &'static str {
        match self {
            RemediationAction::Rebuild => "/rebuild",
            RemediationAction::UpdateBranch => "/update-branch",
            RemediationAction::CloseReopen => "/close-reopen",
            RemediationAction::RetriggerPolicy => "/recheck",
            RemediationAction::RetriggerSod => "/recheck-sod",
            RemediationAction::RetriggerApprover => "/approve",
            RemediationAction::RetriggerMerge => "/merge",
            RemediationAction::ClosePr => "/close",
        }
    }

    pub fn is_budgeted(self) -> bool {
        !matches!(self, RemediationAction::ClosePr)
    }
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-action retry counters for one PR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryCounters {
    pub rebuild: u32,
    pub update_branch: u32,
    pub close_reopen: u32,
    pub retrigger_policy: u32,
    pub retrigger_sod: u32,
    pub retrigger_approver: u32,
    pub retrigger_merge: u32,
}

impl RetryCounters {
    /// Current count for an action. Unbudgeted actions always read zero.
    pub fn get(&self, action: RemediationAction) -> u32 {
        match action {
            RemediationAction::Rebuild => self.rebuild,
            RemediationAction::UpdateBranch => self.update_branch,
            RemediationAction::CloseReopen => self.close_reopen,
            RemediationAction::RetriggerPolicy => self.retrigger_policy,
            RemediationAction::RetriggerSod => self.retrigger_sod,
            RemediationAction::RetriggerApprover => self.retrigger_approver,
            RemediationAction::RetriggerMerge => self.retrigger_merge,
            RemediationAction::ClosePr => 0,
        }
    }

    fn slot_mut(&mut self, action: RemediationAction) -> Option<&mut u32> {
        match action {
            RemediationAction::Rebuild => Some(&mut self.rebuild),
            RemediationAction::UpdateBranch => Some(&mut self.update_branch),
            RemediationAction::CloseReopen => Some(&mut self.close_reopen),
            RemediationAction::RetriggerPolicy => Some(&mut self.retrigger_policy),
            RemediationAction::RetriggerSod => Some(&mut self.retrigger_sod),
            RemediationAction::RetriggerApprover => Some(&mut self.retrigger_approver),
            RemediationAction::RetriggerMerge => Some(&mut self.retrigger_merge),
            RemediationAction::ClosePr => None,
        }
    }

    /// Set the counter for a budgeted action. No-op for `ClosePr`.
    pub fn set(&mut self, action: RemediationAction, value: u32) {
        if let Some(slot) = self.slot_mut(action) {
            *slot = value;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn total(&self) -> u32 {
        RemediationAction::BUDGETED
            .iter()
            .map(|action| self.get(*action))
            .sum()
    }
}

/// Persisted state of one PR, owned by the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    #[serde(flatten)]
    pub pr: PrRef,

    /// Current lifecycle state
    pub state: PrState,

    /// When the PR entered `state`; the staleness clock
    pub entered_state_at: DateTime<Utc>,

    #[serde(default)]
    pub retry_counts: RetryCounters,

    /// Repo requires two approvals, enabling the SOD recheck from APPROVED
    #[serde(default)]
    pub two_approval_repo: bool,

    /// Optimistic concurrency version
    #[serde(default)]
    pub version: u64,
}

impl PullRequestRecord {
    pub fn new(pr: PrRef, state: PrState, entered_state_at: DateTime<Utc>) -> Self {
        Self {
            pr,
            state,
            entered_state_at,
            retry_counts: RetryCounters::default(),
            two_approval_repo: false,
            version: 0,
        }
    }

    /// Time spent in the current state. Clock skew reads as zero.
    pub fn dwell(&self, now: DateTime<Utc>) -> Duration {
        (now - self.entered_state_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Move to `to` if the lifecycle table allows it, restarting the dwell clock.
    pub fn transition_to(
        &mut self,
        to: PrState,
        at: DateTime<Utc>,
    ) -> Result<(), crate::lifecycle::LifecycleError> {
        crate::lifecycle::ensure_legal(self.state, to)?;
        self.state = to;
        self.entered_state_at = at;
        Ok(())
    }

    /// Restart the staleness clock without changing state.
    pub fn restart_dwell(&mut self, at: DateTime<Utc>) {
        self.entered_state_at = at;
    }
}

/// Aggregate CI status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

/// One failed check and whatever output it reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFailure {
    pub name: String,

    #[serde(default)]
    pub summary: String,
}

impl CheckFailure {
    pub fn new(name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            summary: summary.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRollup {
    pub status: CheckStatus,

    #[serde(default)]
    pub failures: Vec<CheckFailure>,
}

impl CheckRollup {
    pub fn passed() -> Self {
        Self {
            status: CheckStatus::Passed,
            failures: Vec::new(),
        }
    }

    pub fn running() -> Self {
        Self {
            status: CheckStatus::Running,
            failures: Vec::new(),
        }
    }

    pub fn failed(failures: Vec<CheckFailure>) -> Self {
        Self {
            status: CheckStatus::Failed,
            failures,
        }
    }
}

/// Why the policy bot rejected a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyFailureKind {
    /// Separation-of-duties violation
    Sod,
    /// A commit from an unexpected author
    ForeignCommit,
    /// A file the automation may not touch
    InvalidFile,
    /// The policy bot itself errored
    BotError,
    Unknown,
}

impl PolicyFailureKind {
    /// Permanent failures close the PR without retry.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            PolicyFailureKind::ForeignCommit | PolicyFailureKind::InvalidFile
        )
    }
}

/// Policy bot verdict as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PolicyResult {
    Pending,
    Evaluating,
    Passed,
    Failed {
        kind: PolicyFailureKind,
        #[serde(default)]
        detail: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSummary {
    /// Approver bot (or human) approved the PR
    pub approved: bool,

    /// Approval violates separation of duties
    pub sod_violation: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    #[default]
    Open,
    Merging,
    Merged,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mergeability {
    Mergeable,
    Conflicting,
    #[default]
    Unknown,
}

/// Freshly polled upstream truth for one PR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub checks: CheckRollup,

    pub policy: PolicyResult,

    #[serde(default)]
    pub reviews: ReviewSummary,

    #[serde(default)]
    pub merge: MergeStatus,

    #[serde(default)]
    pub mergeability: Mergeability,

    /// Head branch is behind its base
    #[serde(default)]
    pub behind_base: bool,
}

impl LiveSnapshot {
    /// Open PR with the given check rollup and nothing else reported yet.
    pub fn with_checks(checks: CheckRollup) -> Self {
        Self {
            checks,
            policy: PolicyResult::Pending,
            reviews: ReviewSummary::default(),
            merge: MergeStatus::Open,
            mergeability: Mergeability::Unknown,
            behind_base: false,
        }
    }

    pub fn has_conflict(&self) -> bool {
        self.mergeability == Mergeability::Conflicting
    }

    /// The lifecycle state this snapshot implies.
    ///
    /// Merge status dominates, then the check rollup, then the policy
    /// verdict, then approval.
    pub fn implied_state(&self) -> PrState {
        match self.merge {
            MergeStatus::Merged => return PrState::Merged,
            MergeStatus::Closed => return PrState::Closed,
            MergeStatus::Merging => return PrState::Merging,
            MergeStatus::Open => {}
        }

        match self.checks.status {
            CheckStatus::Pending => PrState::Created,
            CheckStatus::Running => PrState::ChecksRunning,
            CheckStatus::Failed => PrState::ChecksFailed,
            CheckStatus::Passed => match &self.policy {
                PolicyResult::Pending => PrState::ChecksPassed,
                PolicyResult::Evaluating => PrState::PolicyEvaluating,
                PolicyResult::Failed { .. } => PrState::PolicyFailed,
                PolicyResult::Passed if self.reviews.approved => PrState::Approved,
                PolicyResult::Passed => PrState::PolicyPassed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = PrState::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![&PrState::Merged, &PrState::Closed, &PrState::NeedsIntervention]
        );
    }

    #[test]
    fn test_state_serializes_screaming_snake() {
        let json = serde_json::to_string(&PrState::ChecksFailed).unwrap();
        assert_eq!(json, "\"CHECKS_FAILED\"");
        assert_eq!(PrState::PolicyEvaluating.to_string(), "POLICY_EVALUATING");
    }

    #[test]
    fn test_counters_ignore_close_pr() {
        let mut counters = RetryCounters::default();
        counters.set(RemediationAction::Rebuild, 2);
        counters.set(RemediationAction::ClosePr, 9);
        assert_eq!(counters.get(RemediationAction::Rebuild), 2);
        assert_eq!(counters.get(RemediationAction::ClosePr), 0);
        assert_eq!(counters.total(), 2);
    }

    #[test]
    fn test_dwell_clamps_clock_skew() {
        let entered = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let record = PullRequestRecord::new(PrRef::new("acme/api", 1), PrState::Created, entered);
        let before = entered - chrono::Duration::minutes(1);
        assert_eq!(record.dwell(before), Duration::ZERO);
        let after = entered + chrono::Duration::minutes(7);
        assert_eq!(record.dwell(after), Duration::from_secs(420));
    }

    #[test]
    fn test_implied_state_ordering() {
        let mut live = LiveSnapshot::with_checks(CheckRollup::passed());
        assert_eq!(live.implied_state(), PrState::ChecksPassed);

        live.policy = PolicyResult::Passed;
        assert_eq!(live.implied_state(), PrState::PolicyPassed);

        live.reviews.approved = true;
        assert_eq!(live.implied_state(), PrState::Approved);

        live.merge = MergeStatus::Merged;
        assert_eq!(live.implied_state(), PrState::Merged);

        let failed = LiveSnapshot::with_checks(CheckRollup::failed(vec![]));
        assert_eq!(failed.implied_state(), PrState::ChecksFailed);
    }

    #[test]
    fn test_record_yaml_flattens_identity() {
        let yaml = r#"
repository: acme/api
number: 42
state: CHECKS_FAILED
entered_state_at: "2025-01-01T12:00:00Z"
retry_counts:
  rebuild: 1
"#;
        let record: PullRequestRecord = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(record.pr, PrRef::new("acme/api", 42));
        assert_eq!(record.retry_counts.rebuild, 1);
        assert_eq!(record.version, 0);
        assert_eq!(record.pr.to_string(), "acme/api#42");
    }

    #[test]
    fn test_policy_result_tagged() {
        let yaml = "status: failed\nkind: foreign_commit\n";
        let policy: PolicyResult = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            policy,
            PolicyResult::Failed { kind: PolicyFailureKind::ForeignCommit, .. }
        ));
    }
}
