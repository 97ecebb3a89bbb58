//! Command dispatch and escalation.
//!
//! The dispatcher owns the write side of a decision: enqueueing the
//! remediation command, committing budget, writing the record back and
//! appending audit events. Breaker bookkeeping stays with the reconciler.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use medic_core::lifecycle::{self, RemediationEffect};
use medic_core::{
    LifecycleError, PrState, PullRequestRecord, RemediationAction, RemediationCommand,
};

use crate::collaborators::{
    CollaboratorError, CommandQueue, EventKind, Notifier, PrEvent, StateStore, WriteResult,
};
use crate::resilience::{CallPolicy, Reservation, RetryBudget};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Result of a dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The queue acknowledged the command. The write-back may still have
    /// lost a race or failed.
    Acknowledged {
        command: RemediationCommand,
        duplicate: bool,
        new_state: PrState,
        write: Result<WriteResult, CollaboratorError>,
    },

    /// The enqueue failed after retries; no budget consumed.
    EnqueueFailed {
        command: RemediationCommand,
        error: CollaboratorError,
    },
}

impl DispatchOutcome {
    /// Whether the breaker should count this as a success.
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Acknowledged { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationOutcome {
    Escalated,
    VersionConflict,
}

pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn CommandQueue>,
    notifier: Arc<dyn Notifier>,
    budget: RetryBudget,
    calls: CallPolicy,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn CommandQueue>,
        notifier: Arc<dyn Notifier>,
        budget: RetryBudget,
        calls: CallPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
            budget,
            calls,
        }
    }

    pub fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    /// Enqueue the reserved attempt and, once acknowledged, commit it.
    ///
    /// `record` is the working copy; its `version` is the one read from the
    /// store and is used as the expected version of the write.
    pub async fn dispatch(
        &self,
        record: &PullRequestRecord,
        reservation: Reservation,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let action = reservation.action;
        let command = RemediationCommand::new(record.pr.clone(), action, reservation.counter_before);

        // Build the committed record up front so an illegal edge never
        // follows an acknowledged enqueue.
        let mut updated = record.clone();
        self.budget.commit(&mut updated, &reservation);
        match lifecycle::remediation_effect(record.state, action) {
            RemediationEffect::Transition(to) => updated.transition_to(to, now)?,
            RemediationEffect::RestartDwell => updated.restart_dwell(now),
        }

        let ack = match self
            .calls
            .run("enqueue", || self.queue.enqueue(&command))
            .await
        {
            Ok(ack) => ack,
            Err(error) => {
                tracing::warn!(
                    pr = %record.pr,
                    action = %action,
                    attempt = command.attempt_number,
                    error = %error,
                    "Remediation enqueue failed"
                );
                let event = PrEvent::new(
                    record.pr.clone(),
                    EventKind::RemediationFailed,
                    json!({
                        "action": action,
                        "attempt_number": command.attempt_number,
                        "idempotency_key": command.idempotency_key,
                        "error": error.to_string(),
                    }),
                    now,
                );
                self.append_event(&event).await;
                return Ok(DispatchOutcome::EnqueueFailed { command, error });
            }
        };

        let write = self
            .calls
            .run("conditional_update", || {
                self.store.conditional_update(&updated, record.version)
            })
            .await;

        match &write {
            Ok(WriteResult::Committed { version }) => {
                let kind = if action == RemediationAction::ClosePr {
                    EventKind::ClosedPermanent
                } else {
                    EventKind::RemediationDispatched
                };
                tracing::info!(
                    pr = %record.pr,
                    action = %action,
                    attempt = command.attempt_number,
                    from = %record.state,
                    to = %updated.state,
                    version = *version,
                    duplicate = ack.duplicate,
                    "Remediation dispatched"
                );
                let event = PrEvent::new(
                    record.pr.clone(),
                    kind,
                    json!({
                        "action": action,
                        "command": command.command,
                        "attempt_number": command.attempt_number,
                        "idempotency_key": command.idempotency_key,
                        "duplicate": ack.duplicate,
                        "from": record.state,
                        "to": updated.state,
                    }),
                    now,
                );
                self.append_event(&event).await;
            }
            Ok(WriteResult::VersionConflict) => {
                // The next run reserves the same counter and so re-sends the
                // same key; the queue dedupes it.
                tracing::warn!(
                    pr = %record.pr,
                    action = %action,
                    key = %command.idempotency_key,
                    "Version conflict after enqueue, leaving record for next run"
                );
            }
            Err(e) => {
                tracing::error!(
                    pr = %record.pr,
                    action = %action,
                    error = %e,
                    "Failed to write back record after enqueue"
                );
            }
        }

        Ok(DispatchOutcome::Acknowledged {
            command,
            duplicate: ack.duplicate,
            new_state: updated.state,
            write,
        })
    }

    /// Move the record to NEEDS_INTERVENTION and notify a human.
    pub async fn escalate(
        &self,
        record: &PullRequestRecord,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<EscalationOutcome, DispatchError> {
        let mut updated = record.clone();
        updated.transition_to(PrState::NeedsIntervention, now)?;

        let write = self
            .calls
            .run("conditional_update", || {
                self.store.conditional_update(&updated, record.version)
            })
            .await?;

        if write == WriteResult::VersionConflict {
            tracing::info!(pr = %record.pr, "Version conflict on escalation, skipping");
            return Ok(EscalationOutcome::VersionConflict);
        }

        tracing::warn!(pr = %record.pr, from = %record.state, reason, "PR escalated");
        let event = PrEvent::new(
            record.pr.clone(),
            EventKind::Escalated,
            json!({ "from": record.state, "reason": reason }),
            now,
        );
        self.append_event(&event).await;

        if let Err(e) = self
            .calls
            .run("send_escalation", || {
                self.notifier.send_escalation(&record.pr, reason)
            })
            .await
        {
            tracing::error!(pr = %record.pr, error = %e, "Failed to send escalation notification");
        }

        Ok(EscalationOutcome::Escalated)
    }

    /// Append an audit event. Failures are logged and never fail the PR.
    pub async fn append_event(&self, event: &PrEvent) {
        if let Err(e) = self
            .calls
            .run("append_event", || self.store.append_event(event))
            .await
        {
            tracing::error!(pr = %event.pr, kind = %event.kind, error = %e, "Failed to append event");
        }
    }
}
