//! The reconciliation run.
//!
//! One `run_once` call:
//! 1. Queries the store for stale records
//! 2. Polls live status for each, concurrently up to `max_concurrency`
//! 3. Corrects drift and re-checks staleness
//! 4. Classifies, gates on budget and breaker, then dispatches or escalates
//! 5. Purges terminal records past retention
//!
//! Per-PR failures are isolated into the [`RunReport`]; only a failed
//! candidate query fails the run.
//!
//! The breaker is consulted twice per PR: once on admission and again right
//! before the enqueue. Enqueues and their breaker updates are serialized, so
//! a trip recorded by one PR is seen by every PR that dispatches after it.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use medic_core::{
    ClassificationResult, Classifier, ConfigError, Decision, DriftReconciler, MedicConfig,
    PullRequestRecord, ReconciledPr,
};

use crate::admin::AdminHandle;
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    CollaboratorError, CommandQueue, EventKind, Notifier, PrEvent, StateStore, StatusApi,
    WriteResult,
};
use crate::dispatcher::{DispatchOutcome, Dispatcher, EscalationOutcome};
use crate::metrics::{MetricsError, ReconcilerMetrics};
use crate::report::{PrOutcome, PrReport, RunReport};
use crate::resilience::{
    Admission, BreakerTransition, BudgetCheck, CallPolicy, CircuitBreaker, CircuitStatus,
    Reservation, RetryBudget,
};

/// Run-level errors.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Reconciler not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to query stale PRs: {0}")]
    Query(#[source] CollaboratorError),

    #[error("Failed to set up metrics: {0}")]
    Metrics(#[from] MetricsError),
}

/// Drives reconciliation runs against injected collaborators.
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    status_api: Arc<dyn StatusApi>,
    notifier: Arc<dyn Notifier>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    config: MedicConfig,
    classifier: Classifier,
    drift: DriftReconciler,
    dispatcher: Dispatcher,
    calls: CallPolicy,
    metrics: ReconcilerMetrics,
    /// Held from the breaker re-check until the outcome is recorded.
    dispatch_gate: Mutex<()>,
}

impl Reconciler {
    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::new()
    }

    pub fn config(&self) -> &MedicConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn metrics(&self) -> &ReconcilerMetrics {
        &self.metrics
    }

    /// Operator handle over the shared breaker.
    pub fn admin_handle(&self) -> AdminHandle {
        AdminHandle::new(self.breaker.clone())
    }

    /// Execute one bounded reconciliation run.
    pub async fn run_once(&self) -> Result<RunReport, ReconcileError> {
        let started_at = self.clock.now();
        let deadline = started_at
            .checked_add_signed(to_chrono(self.config.scheduler.run_deadline))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let breaker_at_start = self.breaker.evaluate(started_at);

        let candidates = self
            .calls
            .run("query_stale", || {
                self.store.query_stale(&self.config.staleness, started_at)
            })
            .await
            .map_err(|e| {
                self.metrics.run_failed();
                ReconcileError::Query(e)
            })?;

        tracing::info!(
            candidates = candidates.len(),
            breaker = %breaker_at_start,
            "Reconciliation run started"
        );

        let processed: Vec<(PrReport, bool)> = stream::iter(candidates)
            .map(|record| self.process(record, breaker_at_start, deadline))
            .buffer_unordered(self.config.scheduler.max_concurrency.max(1))
            .collect()
            .await;

        // The probe slot stays taken for the whole run.
        let probe_unused = processed.iter().any(|(_, unused)| *unused);
        if probe_unused {
            self.breaker.release_probe();
        }

        let mut prs: Vec<PrReport> = processed.into_iter().map(|(report, _)| report).collect();
        prs.sort_by(|a, b| a.pr.cmp(&b.pr));

        let finished_at = self.clock.now();
        let purged = self.purge(finished_at).await;

        let report = RunReport {
            started_at,
            finished_at,
            breaker_at_start,
            breaker_at_end: self.breaker.evaluate(finished_at),
            prs,
            purged,
        };

        self.metrics.run_completed(&report);

        let summary = report.summary();
        tracing::info!(
            candidates = summary.candidates,
            dispatched = summary.dispatched,
            escalated = summary.escalated,
            drift_corrected = summary.drift_corrected,
            skipped = summary.skipped,
            conflicts = summary.conflicts,
            failed = summary.failed,
            purged,
            breaker = %report.breaker_at_end,
            "Reconciliation run finished"
        );

        Ok(report)
    }

    /// Gate one PR on deadline and breaker, then reconcile it.
    ///
    /// Also returns whether this PR held the half-open slot without
    /// dispatching.
    async fn process(
        &self,
        record: PullRequestRecord,
        breaker_at_start: CircuitStatus,
        deadline: DateTime<Utc>,
    ) -> (PrReport, bool) {
        let now = self.clock.now();
        if now >= deadline {
            tracing::info!(pr = %record.pr, "Run deadline passed, skipping");
            let report = PrReport::new(record.pr, record.state, PrOutcome::SkippedDeadline);
            return (report, false);
        }

        let admission = match breaker_at_start {
            CircuitStatus::Open => Admission::Rejected,
            // A run that starts half-open sends at most one probe.
            CircuitStatus::HalfOpen => match self.breaker.admit(now) {
                Admission::Admitted => Admission::Rejected,
                admission => admission,
            },
            CircuitStatus::Closed => self.breaker.admit(now),
        };

        if !admission.is_allowed() {
            tracing::debug!(pr = %record.pr, "Circuit breaker open, skipping");
            let report = PrReport::new(record.pr, record.state, PrOutcome::SkippedBreakerOpen);
            return (report, false);
        }

        let (report, dispatched) = self.reconcile_pr(record, admission, now).await;
        (report, admission == Admission::Probe && !dispatched)
    }

    /// Returns the report and whether a dispatch outcome reached the breaker.
    async fn reconcile_pr(
        &self,
        record: PullRequestRecord,
        admission: Admission,
        now: DateTime<Utc>,
    ) -> (PrReport, bool) {
        let pr = record.pr.clone();
        let mut report = PrReport::new(pr.clone(), record.state, PrOutcome::SkippedDeadline);

        let live = match self
            .calls
            .run("live_status", || self.status_api.live_status(&pr))
            .await
        {
            Ok(live) => live,
            Err(e) => {
                tracing::warn!(pr = %pr, error = %e, "Failed to poll live status");
                report.outcome = PrOutcome::Error {
                    error: e.to_string(),
                };
                return (report, false);
            }
        };

        let drift = self.drift.reconcile(&record, &live, now);
        if let Some(correction) = &drift.correction {
            let event = PrEvent::new(
                pr.clone(),
                EventKind::StateDriftCorrected,
                json!(correction),
                now,
            );
            self.dispatcher.append_event(&event).await;
        }
        let drifted = drift.applied();
        report.drift = drift.correction;
        let working = drift.record;

        if !self.config.staleness.is_stale(&working, now) {
            report.outcome = if drifted {
                match self.persist(&working, record.version).await {
                    Ok(()) => PrOutcome::Recovered {
                        state: working.state,
                    },
                    Err(outcome) => outcome,
                }
            } else {
                PrOutcome::NoAction {
                    reason: "within staleness threshold".to_string(),
                }
            };
            return (report, false);
        }

        let result = self.classifier.classify(ReconciledPr::new(&working, &live), now);
        report.classification = Some(result.classification);

        let (outcome, dispatched) = self.act(&working, drifted, result, admission, now).await;
        report.outcome = outcome;
        (report, dispatched)
    }

    async fn act(
        &self,
        record: &PullRequestRecord,
        drifted: bool,
        result: ClassificationResult,
        admission: Admission,
        now: DateTime<Utc>,
    ) -> (PrOutcome, bool) {
        match result.decision {
            Decision::NoAction => {
                if drifted {
                    if let Err(outcome) = self.persist(record, record.version).await {
                        return (outcome, false);
                    }
                }
                (PrOutcome::NoAction { reason: result.reason }, false)
            }
            Decision::Escalate => (self.escalate(record, &result.reason, now).await, false),
            Decision::Dispatch(action) => {
                match self.dispatcher.budget().check_and_reserve(record, action) {
                    BudgetCheck::Reserved(reservation) => {
                        self.dispatch(record, reservation, admission, now).await
                    }
                    BudgetCheck::Exhausted { action, used, max } => {
                        let reason = format!(
                            "retry budget exhausted for {} ({}/{}): {}",
                            action, used, max, result.reason
                        );
                        (self.escalate(record, &reason, now).await, false)
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        record: &PullRequestRecord,
        reservation: Reservation,
        admission: Admission,
        now: DateTime<Utc>,
    ) -> (PrOutcome, bool) {
        let action = reservation.action;

        let gate = self.dispatch_gate.lock().await;
        if !self.breaker.permits_dispatch(admission) {
            // Reservation dropped uncommitted
            tracing::info!(pr = %record.pr, action = %action, "Circuit breaker opened since admission, skipping");
            return (PrOutcome::SkippedBreakerOpen, false);
        }

        let dispatched = self.dispatcher.dispatch(record, reservation, now).await;
        let transition = match &dispatched {
            Ok(outcome) => {
                let success = outcome.is_success();
                self.metrics.dispatch_completed(action, success);
                self.breaker.record_outcome(success, now)
            }
            Err(_) => None,
        };
        drop(gate);

        if let Some(transition) = transition {
            self.on_breaker_transition(transition).await;
        }

        match dispatched {
            Ok(DispatchOutcome::Acknowledged {
                command,
                duplicate,
                new_state,
                write,
            }) => {
                let outcome = match write {
                    Ok(WriteResult::Committed { .. }) => PrOutcome::Dispatched {
                        action,
                        attempt_number: command.attempt_number,
                        idempotency_key: command.idempotency_key,
                        command: command.command,
                        duplicate,
                        new_state,
                    },
                    Ok(WriteResult::VersionConflict) => PrOutcome::VersionConflict,
                    Err(e) => PrOutcome::Error {
                        error: e.to_string(),
                    },
                };
                (outcome, true)
            }
            Ok(DispatchOutcome::EnqueueFailed { error, .. }) => (
                PrOutcome::DispatchFailed {
                    action,
                    error: error.to_string(),
                },
                true,
            ),
            Err(e) => {
                tracing::error!(pr = %record.pr, action = %action, error = %e, "Dispatch aborted");
                (
                    PrOutcome::Error {
                        error: e.to_string(),
                    },
                    false,
                )
            }
        }
    }

    async fn escalate(&self, record: &PullRequestRecord, reason: &str, now: DateTime<Utc>) -> PrOutcome {
        match self.dispatcher.escalate(record, reason, now).await {
            Ok(EscalationOutcome::Escalated) => PrOutcome::Escalated {
                reason: reason.to_string(),
            },
            Ok(EscalationOutcome::VersionConflict) => PrOutcome::VersionConflict,
            Err(e) => {
                tracing::error!(pr = %record.pr, error = %e, "Escalation failed");
                PrOutcome::Error {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Write a drift-corrected record that needs no remediation.
    async fn persist(&self, record: &PullRequestRecord, expected_version: u64) -> Result<(), PrOutcome> {
        match self
            .calls
            .run("conditional_update", || {
                self.store.conditional_update(record, expected_version)
            })
            .await
        {
            Ok(WriteResult::Committed { .. }) => Ok(()),
            Ok(WriteResult::VersionConflict) => {
                tracing::info!(pr = %record.pr, "Version conflict writing drift correction, skipping");
                Err(PrOutcome::VersionConflict)
            }
            Err(e) => {
                tracing::warn!(pr = %record.pr, error = %e, "Failed to write drift correction");
                Err(PrOutcome::Error {
                    error: e.to_string(),
                })
            }
        }
    }

    /// Count the transition and notify when the breaker opens.
    async fn on_breaker_transition(&self, transition: BreakerTransition) {
        self.metrics.breaker_transition(transition);
        if matches!(
            transition,
            BreakerTransition::Tripped | BreakerTransition::Reopened
        ) {
            let state = self.breaker.snapshot();
            if let Err(e) = self
                .calls
                .run("send_breaker_tripped", || {
                    self.notifier.send_breaker_tripped(&state)
                })
                .await
            {
                tracing::error!(error = %e, "Failed to send circuit breaker notification");
            }
        }
    }

    async fn purge(&self, now: DateTime<Utc>) -> usize {
        let Some(older_than) = now.checked_sub_signed(to_chrono(self.config.retention)) else {
            return 0;
        };
        match self
            .calls
            .run("purge_terminal", || self.store.purge_terminal(older_than))
            .await
        {
            Ok(purged) => purged,
            Err(e) => {
                tracing::warn!(error = %e, "Retention purge failed");
                0
            }
        }
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Builder for [`Reconciler`].
pub struct ReconcilerBuilder {
    config: MedicConfig,
    store: Option<Arc<dyn StateStore>>,
    status_api: Option<Arc<dyn StatusApi>>,
    queue: Option<Arc<dyn CommandQueue>>,
    notifier: Option<Arc<dyn Notifier>>,
    breaker: Option<Arc<CircuitBreaker>>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<ReconcilerMetrics>,
}

impl ReconcilerBuilder {
    pub fn new() -> Self {
        Self {
            config: MedicConfig::default(),
            store: None,
            status_api: None,
            queue: None,
            notifier: None,
            breaker: None,
            clock: None,
            metrics: None,
        }
    }

    pub fn config(mut self, config: MedicConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn status_api(mut self, status_api: Arc<dyn StatusApi>) -> Self {
        self.status_api = Some(status_api);
        self
    }

    pub fn command_queue(mut self, queue: Arc<dyn CommandQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Share an existing breaker. Defaults to a fresh one from config.
    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Record into existing metrics. Defaults to a private registry.
    pub fn metrics(mut self, metrics: ReconcilerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Reconciler, ReconcileError> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| ReconcileError::NotConfigured("No state store set".to_string()))?;
        let status_api = self
            .status_api
            .ok_or_else(|| ReconcileError::NotConfigured("No status API set".to_string()))?;
        let queue = self
            .queue
            .ok_or_else(|| ReconcileError::NotConfigured("No command queue set".to_string()))?;
        let notifier = self
            .notifier
            .ok_or_else(|| ReconcileError::NotConfigured("No notifier set".to_string()))?;

        let config = self.config;
        let breaker = self
            .breaker
            .unwrap_or_else(|| Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => ReconcilerMetrics::new()?,
        };
        let calls = CallPolicy::new(config.calls.clone());
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue,
            notifier.clone(),
            RetryBudget::new(config.retry_limits),
            calls.clone(),
        );

        Ok(Reconciler {
            store,
            status_api,
            notifier,
            breaker,
            clock,
            classifier: Classifier::from_config(&config),
            drift: DriftReconciler::new(config.budget_scope),
            dispatcher,
            calls,
            config,
            metrics,
            dispatch_gate: Mutex::new(()),
        })
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
