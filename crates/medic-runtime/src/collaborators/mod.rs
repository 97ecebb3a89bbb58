//! External collaborators of the reconciler.
//!
//! The reconciler never talks to a concrete store, API or queue; everything
//! is reached through the async traits below and injected as `Arc<dyn _>`.
//!
//! - [`StateStore`]: persisted PR records, versioned for optimistic concurrency
//! - [`StatusApi`]: live upstream truth for one PR
//! - [`CommandQueue`]: remediation commands, delivered at-least-once downstream
//! - [`Notifier`]: escalations and breaker trips for humans

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use medic_core::{LiveSnapshot, PrRef, PullRequestRecord, RemediationCommand, StalenessPolicy};

use crate::resilience::CircuitBreakerState;

pub mod memory;
pub mod secrets;

#[cfg(feature = "github")]
pub mod github;

pub use memory::{InMemoryCommandQueue, InMemoryStateStore, RecordingNotifier, ScriptedStatusApi};
pub use secrets::{ApiCredential, CredentialSource};

#[cfg(feature = "github")]
pub use github::GithubStatusApi;

/// Errors from collaborator calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Collaborator not configured: {0}")]
    NotConfigured(String),
}

impl CollaboratorError {
    /// Transient errors are retried with backoff at the call site.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Timeout(_)
                | CollaboratorError::Unavailable(_)
                | CollaboratorError::RateLimited { .. }
        )
    }
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Committed { version: u64 },
    /// Someone else wrote first; retry next cycle
    VersionConflict,
}

/// Audit event kinds appended to a PR's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    StateDriftCorrected,
    RemediationDispatched,
    RemediationFailed,
    Escalated,
    ClosedPermanent,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::StateDriftCorrected => "STATE_DRIFT_CORRECTED",
            EventKind::RemediationDispatched => "REMEDIATION_DISPATCHED",
            EventKind::RemediationFailed => "REMEDIATION_FAILED",
            EventKind::Escalated => "ESCALATED",
            EventKind::ClosedPermanent => "CLOSED_PERMANENT",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrEvent {
    pub pr: PrRef,
    pub kind: EventKind,
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl PrEvent {
    pub fn new(pr: PrRef, kind: EventKind, detail: serde_json::Value, at: DateTime<Utc>) -> Self {
        Self {
            pr,
            kind,
            detail,
            at,
        }
    }
}

/// Acknowledgement from the command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnqueueAck {
    /// The idempotency key was already queued; nothing new was sent
    pub duplicate: bool,
}

/// Persisted PR records.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Non-terminal records whose dwell exceeds their state's threshold.
    async fn query_stale(
        &self,
        policy: &StalenessPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<PullRequestRecord>, CollaboratorError>;

    /// Write `record` if the stored version still equals `expected_version`.
    async fn conditional_update(
        &self,
        record: &PullRequestRecord,
        expected_version: u64,
    ) -> Result<WriteResult, CollaboratorError>;

    async fn append_event(&self, event: &PrEvent) -> Result<(), CollaboratorError>;

    /// Delete terminal records that entered their state before `older_than`.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, CollaboratorError>;
}

/// Upstream source of truth.
#[async_trait]
pub trait StatusApi: Send + Sync {
    async fn live_status(&self, pr: &PrRef) -> Result<LiveSnapshot, CollaboratorError>;
}

#[async_trait]
pub trait CommandQueue: Send + Sync {
    async fn enqueue(&self, command: &RemediationCommand) -> Result<EnqueueAck, CollaboratorError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_escalation(&self, pr: &PrRef, reason: &str) -> Result<(), CollaboratorError>;

    async fn send_breaker_tripped(
        &self,
        state: &CircuitBreakerState,
    ) -> Result<(), CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(CollaboratorError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(CollaboratorError::Unavailable("502".into()).is_transient());
        assert!(CollaboratorError::RateLimited { retry_after: None }.is_transient());
        assert!(!CollaboratorError::Rejected("bad".into()).is_transient());
        assert!(!CollaboratorError::NotFound("pr".into()).is_transient());
        assert!(!CollaboratorError::Decode("json".into()).is_transient());
    }

    #[test]
    fn test_event_kind_names() {
        let json = serde_json::to_string(&EventKind::StateDriftCorrected).unwrap();
        assert_eq!(json, "\"STATE_DRIFT_CORRECTED\"");
        assert_eq!(EventKind::ClosedPermanent.to_string(), "CLOSED_PERMANENT");
    }
}
