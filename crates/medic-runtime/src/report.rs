//! Per-run reports.

use chrono::{DateTime, Utc};
use serde::Serialize;

use medic_core::{Classification, DriftCorrection, PrRef, PrState, RemediationAction};

use crate::resilience::CircuitStatus;

/// What happened to one PR in a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PrOutcome {
    /// Command enqueued and the record written back
    Dispatched {
        action: RemediationAction,
        attempt_number: u32,
        idempotency_key: String,
        command: String,
        /// Queue already held this key
        duplicate: bool,
        new_state: PrState,
    },

    /// Moved to NEEDS_INTERVENTION and a human notified
    Escalated { reason: String },

    /// Stale but nothing to do yet
    NoAction { reason: String },

    /// No longer stale once drift was corrected
    Recovered { state: PrState },

    /// Breaker OPEN, or HALF_OPEN with the probe slot taken
    SkippedBreakerOpen,

    /// Run deadline passed before the PR was started
    SkippedDeadline,

    /// Another writer updated the record first; retried next run
    VersionConflict,

    /// Enqueue failed; budget untouched
    DispatchFailed {
        action: RemediationAction,
        error: String,
    },

    /// A collaborator call failed for this PR only
    Error { error: String },
}

impl PrOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PrOutcome::Dispatched { .. } => "dispatched",
            PrOutcome::Escalated { .. } => "escalated",
            PrOutcome::NoAction { .. } => "no_action",
            PrOutcome::Recovered { .. } => "recovered",
            PrOutcome::SkippedBreakerOpen => "skipped_breaker_open",
            PrOutcome::SkippedDeadline => "skipped_deadline",
            PrOutcome::VersionConflict => "version_conflict",
            PrOutcome::DispatchFailed { .. } => "dispatch_failed",
            PrOutcome::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrReport {
    pub pr: PrRef,
    /// State as persisted when the run picked the PR up
    pub state_before: PrState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftCorrection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    pub outcome: PrOutcome,
}

impl PrReport {
    pub fn new(pr: PrRef, state_before: PrState, outcome: PrOutcome) -> Self {
        Self {
            pr,
            state_before,
            drift: None,
            classification: None,
            outcome,
        }
    }
}

/// Counts per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub candidates: usize,
    pub dispatched: usize,
    pub escalated: usize,
    pub no_action: usize,
    pub recovered: usize,
    pub drift_corrected: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub breaker_at_start: CircuitStatus,
    pub breaker_at_end: CircuitStatus,
    pub prs: Vec<PrReport>,
    /// Terminal records purged after the run
    pub purged: usize,
}

impl RunReport {
    pub fn get(&self, pr: &PrRef) -> Option<&PrReport> {
        self.prs.iter().find(|r| &r.pr == pr)
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            candidates: self.prs.len(),
            ..Default::default()
        };
        for report in &self.prs {
            if report.drift.is_some() {
                summary.drift_corrected += 1;
            }
            match report.outcome {
                PrOutcome::Dispatched { .. } => summary.dispatched += 1,
                PrOutcome::Escalated { .. } => summary.escalated += 1,
                PrOutcome::NoAction { .. } => summary.no_action += 1,
                PrOutcome::Recovered { .. } => summary.recovered += 1,
                PrOutcome::SkippedBreakerOpen | PrOutcome::SkippedDeadline => summary.skipped += 1,
                PrOutcome::VersionConflict => summary.conflicts += 1,
                PrOutcome::DispatchFailed { .. } | PrOutcome::Error { .. } => summary.failed += 1,
            }
        }
        summary
    }
}
