//! YAML scenarios that seed the in-memory collaborators.
//!
//! ```yaml
//! now: 2025-06-01T12:00:00Z   # optional, defaults to the wall clock
//! queue_failures: 0           # enqueue calls that fail before the queue recovers
//! prs:
//!   - repository: acme/payments
//!     number: 42
//!     state: CHECKS_FAILED
//!     dwell: 35m
//!     retry_counts: { rebuild: 0 }
//!     live:
//!       checks:
//!         status: failed
//!         failures:
//!           - { name: ci/build, summary: "Job timed out after 60 minutes" }
//!       policy: { status: pending }
//! ```

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use medic_core::{LiveSnapshot, PrRef, PrState, PullRequestRecord, RetryCounters};
use medic_runtime::{InMemoryStateStore, ScriptedStatusApi};

#[derive(Debug, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,

    #[serde(default)]
    pub queue_failures: usize,

    pub prs: Vec<ScenarioPr>,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioPr {
    pub repository: String,
    pub number: u64,
    pub state: PrState,

    /// Time already spent in `state`
    #[serde(with = "medic_core::config::duration::human")]
    pub dwell: Duration,

    #[serde(default)]
    pub retry_counts: RetryCounters,

    #[serde(default)]
    pub two_approval_repo: bool,

    pub live: LiveSnapshot,
}

impl ScenarioPr {
    pub fn pr(&self) -> PrRef {
        PrRef::new(self.repository.clone(), self.number)
    }

    pub fn record(&self, now: DateTime<Utc>) -> anyhow::Result<PullRequestRecord> {
        let dwell = chrono::Duration::from_std(self.dwell)
            .with_context(|| format!("dwell out of range for {}", self.pr()))?;
        let mut record = PullRequestRecord::new(self.pr(), self.state, now - dwell);
        record.retry_counts = self.retry_counts;
        record.two_approval_repo = self.two_approval_repo;
        Ok(record)
    }
}

impl Scenario {
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse scenario")
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    /// Build the store and status API as of `now`.
    pub fn seed(
        &self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(Arc<InMemoryStateStore>, Arc<ScriptedStatusApi>)> {
        let store = InMemoryStateStore::new();
        let api = ScriptedStatusApi::new();
        for entry in &self.prs {
            store.insert(entry.record(now)?);
            api.set(entry.pr(), entry.live.clone());
        }
        Ok((Arc::new(store), Arc::new(api)))
    }
}
