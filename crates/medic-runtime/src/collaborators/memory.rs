//! In-memory collaborators for tests, demos and the CLI.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use medic_core::{LiveSnapshot, PrRef, PullRequestRecord, RemediationCommand, StalenessPolicy};

use super::{
    CollaboratorError, CommandQueue, EnqueueAck, Notifier, PrEvent, StateStore, StatusApi,
    WriteResult,
};
use crate::resilience::CircuitBreakerState;

// =============================================================================
// STATE STORE
// =============================================================================

/// Versioned record map with an append-only event log.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: RwLock<BTreeMap<PrRef, PullRequestRecord>>,
    events: RwLock<Vec<PrEvent>>,
    pending_conflicts: Mutex<HashSet<PrRef>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = PullRequestRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Insert or replace a record as-is, version included.
    pub fn insert(&self, record: PullRequestRecord) {
        self.records.write().insert(record.pr.clone(), record);
    }

    pub fn get(&self, pr: &PrRef) -> Option<PullRequestRecord> {
        self.records.read().get(pr).cloned()
    }

    pub fn records(&self) -> Vec<PullRequestRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn events(&self) -> Vec<PrEvent> {
        self.events.read().clone()
    }

    pub fn events_for(&self, pr: &PrRef) -> Vec<PrEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| &e.pr == pr)
            .cloned()
            .collect()
    }

    /// Simulate a concurrent writer: the next conditional update for `pr`
    /// bumps the stored version and reports a conflict.
    pub fn inject_conflict(&self, pr: &PrRef) {
        self.pending_conflicts.lock().insert(pr.clone());
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn query_stale(
        &self,
        policy: &StalenessPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<PullRequestRecord>, CollaboratorError> {
        let mut stale: Vec<PullRequestRecord> = self
            .records
            .read()
            .values()
            .filter(|r| !r.state.is_terminal() && policy.is_stale(r, now))
            .cloned()
            .collect();
        stale.sort_by(|a, b| {
            a.entered_state_at
                .cmp(&b.entered_state_at)
                .then_with(|| a.pr.cmp(&b.pr))
        });
        Ok(stale)
    }

    async fn conditional_update(
        &self,
        record: &PullRequestRecord,
        expected_version: u64,
    ) -> Result<WriteResult, CollaboratorError> {
        let mut records = self.records.write();
        let stored = records
            .get_mut(&record.pr)
            .ok_or_else(|| CollaboratorError::NotFound(record.pr.to_string()))?;

        if self.pending_conflicts.lock().remove(&record.pr) {
            stored.version += 1;
            return Ok(WriteResult::VersionConflict);
        }

        if stored.version != expected_version {
            return Ok(WriteResult::VersionConflict);
        }

        let version = expected_version + 1;
        let mut updated = record.clone();
        updated.version = version;
        *stored = updated;
        Ok(WriteResult::Committed { version })
    }

    async fn append_event(&self, event: &PrEvent) -> Result<(), CollaboratorError> {
        self.events.write().push(event.clone());
        Ok(())
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, CollaboratorError> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| !(r.state.is_terminal() && r.entered_state_at < older_than));
        Ok(before - records.len())
    }
}

// =============================================================================
// STATUS API
// =============================================================================

/// Status API answering from a scripted map of snapshots.
#[derive(Debug, Default)]
pub struct ScriptedStatusApi {
    snapshots: RwLock<HashMap<PrRef, LiveSnapshot>>,
    failures: Mutex<HashMap<PrRef, VecDeque<CollaboratorError>>>,
    calls: Mutex<usize>,
}

impl ScriptedStatusApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pr: PrRef, live: LiveSnapshot) {
        self.snapshots.write().insert(pr, live);
    }

    /// Queue an error to return on the next poll of `pr`.
    pub fn fail_next(&self, pr: PrRef, error: CollaboratorError) {
        self.failures.lock().entry(pr).or_default().push_back(error);
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl StatusApi for ScriptedStatusApi {
    async fn live_status(&self, pr: &PrRef) -> Result<LiveSnapshot, CollaboratorError> {
        *self.calls.lock() += 1;

        if let Some(error) = self
            .failures
            .lock()
            .get_mut(pr)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }

        self.snapshots
            .read()
            .get(pr)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(pr.to_string()))
    }
}

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// Command queue that records accepted commands and dedupes redelivered
/// idempotency keys for a TTL.
pub struct InMemoryCommandQueue {
    seen: Cache<String, ()>,
    accepted: Mutex<Vec<RemediationCommand>>,
    failures_remaining: Mutex<usize>,
}

impl InMemoryCommandQueue {
    pub fn new(dedupe_ttl: Duration) -> Self {
        let seen = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(dedupe_ttl)
            .build();

        Self {
            seen,
            accepted: Mutex::new(Vec::new()),
            failures_remaining: Mutex::new(0),
        }
    }

    /// Make the next `n` enqueue calls fail with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        *self.failures_remaining.lock() = n;
    }

    /// Commands actually accepted, duplicates excluded.
    pub fn commands(&self) -> Vec<RemediationCommand> {
        self.accepted.lock().clone()
    }
}

impl Default for InMemoryCommandQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

#[async_trait]
impl CommandQueue for InMemoryCommandQueue {
    async fn enqueue(&self, command: &RemediationCommand) -> Result<EnqueueAck, CollaboratorError> {
        {
            let mut remaining = self.failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CollaboratorError::Unavailable(
                    "command queue unavailable".to_string(),
                ));
            }
        }

        let entry = self
            .seen
            .entry(command.idempotency_key.clone())
            .or_insert(())
            .await;

        if !entry.is_fresh() {
            tracing::debug!(
                pr = %command.pr,
                key = %command.idempotency_key,
                "Duplicate command suppressed"
            );
            return Ok(EnqueueAck { duplicate: true });
        }

        self.accepted.lock().push(command.clone());
        Ok(EnqueueAck { duplicate: false })
    }
}

// =============================================================================
// NOTIFIER
// =============================================================================

/// Notifier that records what it was asked to send.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    escalations: Mutex<Vec<(PrRef, String)>>,
    breaker_trips: Mutex<Vec<CircuitBreakerState>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn escalations(&self) -> Vec<(PrRef, String)> {
        self.escalations.lock().clone()
    }

    pub fn breaker_trips(&self) -> Vec<CircuitBreakerState> {
        self.breaker_trips.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_escalation(&self, pr: &PrRef, reason: &str) -> Result<(), CollaboratorError> {
        tracing::info!(pr = %pr, reason, "Escalation notification");
        self.escalations.lock().push((pr.clone(), reason.to_string()));
        Ok(())
    }

    async fn send_breaker_tripped(
        &self,
        state: &CircuitBreakerState,
    ) -> Result<(), CollaboratorError> {
        tracing::info!(status = %state.status, "Circuit breaker notification");
        self.breaker_trips.lock().push(state.clone());
        Ok(())
    }
}
