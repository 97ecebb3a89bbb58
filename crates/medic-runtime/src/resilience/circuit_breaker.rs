//! Circuit breaker gating remediation dispatch.
//!
//! One breaker is shared by every PR in a run. It watches a sliding window
//! of recent dispatch outcomes; when too many of them fail the breaker opens
//! and the reconciler stops dispatching until the cooldown has passed and a
//! single probe PR succeeds.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

pub use medic_core::CircuitBreakerConfig;

/// Status of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    /// Normal operation
    Closed,

    /// Dispatch suppressed
    Open,

    /// Testing recovery with a single probe
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitStatus::Closed => "CLOSED",
            CircuitStatus::Open => "OPEN",
            CircuitStatus::HalfOpen => "HALF_OPEN",
        })
    }
}

/// One dispatch outcome in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSample {
    pub at: DateTime<Utc>,
    pub success: bool,
}

/// Point-in-time copy of the breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub status: CircuitStatus,
    pub window: Vec<OutcomeSample>,
    pub opened_at: Option<DateTime<Utc>>,
    pub probe_in_flight: bool,
}

impl CircuitBreakerState {
    pub fn failures(&self) -> usize {
        self.window.iter().filter(|s| !s.success).count()
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.window.len() as f64
        }
    }
}

/// Result of asking the breaker whether a PR may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; proceed normally
    Admitted,

    /// Breaker half-open and this PR holds the single probe slot
    Probe,

    /// Skip this PR for the run
    Rejected,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// A status change caused by a recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    /// CLOSED -> OPEN
    Tripped,

    /// HALF_OPEN -> OPEN after a failed probe
    Reopened,

    /// HALF_OPEN -> CLOSED after a successful probe
    Recovered,
}

struct Inner {
    status: CircuitStatus,
    window: VecDeque<OutcomeSample>,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl Inner {
    fn closed(capacity: usize) -> Self {
        Self {
            status: CircuitStatus::Closed,
            window: VecDeque::with_capacity(capacity),
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|s| !s.success).count();
        failures as f64 / self.window.len() as f64
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.status = CircuitStatus::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }
}

/// Shared, injectable circuit breaker.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::closed(config.window_size)),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Apply the OPEN -> HALF_OPEN cooldown rule.
    fn cool_down(&self, inner: &mut Inner, now: DateTime<Utc>) {
        if inner.status != CircuitStatus::Open {
            return;
        }
        let Some(opened_at) = inner.opened_at else {
            return;
        };
        let elapsed = (now - opened_at).to_std().unwrap_or_default();
        if elapsed >= self.config.cooldown {
            inner.status = CircuitStatus::HalfOpen;
            inner.probe_in_flight = false;
            tracing::info!(
                cooldown = %humantime::format_duration(self.config.cooldown),
                "Circuit breaker half-open, admitting one probe"
            );
        }
    }

    /// Current status, after applying the cooldown rule at `now`.
    pub fn evaluate(&self, now: DateTime<Utc>) -> CircuitStatus {
        let mut inner = self.inner.lock();
        self.cool_down(&mut inner, now);
        inner.status
    }

    /// Ask whether a PR may proceed.
    ///
    /// While HALF_OPEN only the first caller gets the probe slot; everyone
    /// else is rejected until the probe reports or is released.
    pub fn admit(&self, now: DateTime<Utc>) -> Admission {
        let mut inner = self.inner.lock();
        self.cool_down(&mut inner, now);
        let status = inner.status;
        match status {
            CircuitStatus::Closed => Admission::Admitted,
            CircuitStatus::Open => Admission::Rejected,
            CircuitStatus::HalfOpen if inner.probe_in_flight => Admission::Rejected,
            CircuitStatus::HalfOpen => {
                inner.probe_in_flight = true;
                Admission::Probe
            }
        }
    }

    /// Whether a PR admitted earlier may still enqueue now.
    ///
    /// The status can change between admission and dispatch; only a CLOSED
    /// breaker or the HALF_OPEN slot holder may proceed.
    pub fn permits_dispatch(&self, admission: Admission) -> bool {
        let inner = self.inner.lock();
        match inner.status {
            CircuitStatus::Closed => true,
            CircuitStatus::Open => false,
            CircuitStatus::HalfOpen => admission == Admission::Probe && inner.probe_in_flight,
        }
    }

    /// Give back an unused probe slot at the end of a run.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.status == CircuitStatus::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Record one dispatch outcome and re-evaluate, in one critical section.
    pub fn record_outcome(&self, success: bool, now: DateTime<Utc>) -> Option<BreakerTransition> {
        let mut inner = self.inner.lock();

        inner.window.push_back(OutcomeSample { at: now, success });
        while inner.window.len() > self.config.window_size {
            inner.window.pop_front();
        }

        let status = inner.status;
        match status {
            CircuitStatus::HalfOpen if success => {
                let capacity = self.config.window_size;
                *inner = Inner::closed(capacity);
                tracing::info!("Circuit breaker closed after successful probe");
                Some(BreakerTransition::Recovered)
            }
            CircuitStatus::HalfOpen => {
                inner.open(now);
                tracing::warn!("Circuit breaker reopened after failed probe");
                Some(BreakerTransition::Reopened)
            }
            CircuitStatus::Closed => {
                let samples = inner.window.len();
                let ratio = inner.failure_ratio();
                if samples >= self.config.min_samples && ratio > self.config.failure_ratio {
                    inner.open(now);
                    tracing::warn!(
                        samples,
                        failure_ratio = ratio,
                        threshold = self.config.failure_ratio,
                        "Circuit breaker opened after repeated dispatch failures"
                    );
                    Some(BreakerTransition::Tripped)
                } else {
                    None
                }
            }
            CircuitStatus::Open => None,
        }
    }

    pub fn record_success(&self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        self.record_outcome(true, now)
    }

    pub fn record_failure(&self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        self.record_outcome(false, now)
    }

    /// Administrative reset to CLOSED, bypassing the cooldown.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.status;
        *inner = Inner::closed(self.config.window_size);
        tracing::info!(previous = %previous, "Circuit breaker reset by administrator");
    }

    pub fn status(&self) -> CircuitStatus {
        self.inner.lock().status
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            status: inner.status,
            window: inner.window.iter().copied().collect(),
            opened_at: inner.opened_at,
            probe_in_flight: inner.probe_in_flight,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.snapshot())
            .field("config", &self.config)
            .finish()
    }
}
