//! Prometheus metrics for reconciliation runs.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `medic_runs_total` | Counter | `result` |
//! | `medic_pr_outcomes_total` | Counter | `outcome` |
//! | `medic_dispatches_total` | Counter | `action`, `result` |
//! | `medic_drift_detected_total` | Counter | `applied` |
//! | `medic_breaker_transitions_total` | Counter | `transition` |
//! | `medic_breaker_state` | Gauge | `state` |
//! | `medic_run_candidates` | Gauge | |
//!
//! The breaker gauge holds 1 for the current state and 0 for the others.
//! Every label value is a fixed identifier, so cardinality stays bounded.

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use medic_core::RemediationAction;

use crate::report::RunReport;
use crate::resilience::{BreakerTransition, CircuitStatus};

const BREAKER_STATES: [CircuitStatus; 3] = [
    CircuitStatus::Closed,
    CircuitStatus::Open,
    CircuitStatus::HalfOpen,
];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Reconciler metrics and the registry they are registered with.
///
/// Cheap to clone; all metrics share their storage across clones.
#[derive(Clone)]
pub struct ReconcilerMetrics {
    registry: Registry,
    runs_total: CounterVec,
    pr_outcomes_total: CounterVec,
    dispatches_total: CounterVec,
    drift_detected_total: CounterVec,
    breaker_transitions_total: CounterVec,
    breaker_state: GaugeVec,
    run_candidates: Gauge,
}

impl ReconcilerMetrics {
    /// Create the metrics on a fresh registry.
    pub fn new() -> MetricsResult<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register the metrics with an existing registry.
    ///
    /// # Errors
    ///
    /// Fails if a metric with the same name is already registered.
    pub fn with_registry(registry: Registry) -> MetricsResult<Self> {
        let runs_total = CounterVec::new(
            Opts::new("medic_runs_total", "Reconciliation runs by result"),
            &["result"],
        )?;
        registry.register(Box::new(runs_total.clone()))?;

        let pr_outcomes_total = CounterVec::new(
            Opts::new("medic_pr_outcomes_total", "Per-PR run outcomes"),
            &["outcome"],
        )?;
        registry.register(Box::new(pr_outcomes_total.clone()))?;

        let dispatches_total = CounterVec::new(
            Opts::new(
                "medic_dispatches_total",
                "Remediation commands handed to the command queue",
            ),
            &["action", "result"],
        )?;
        registry.register(Box::new(dispatches_total.clone()))?;

        let drift_detected_total = CounterVec::new(
            Opts::new(
                "medic_drift_detected_total",
                "Persisted state disagreeing with live status",
            ),
            &["applied"],
        )?;
        registry.register(Box::new(drift_detected_total.clone()))?;

        let breaker_transitions_total = CounterVec::new(
            Opts::new(
                "medic_breaker_transitions_total",
                "Circuit breaker status changes caused by dispatch outcomes",
            ),
            &["transition"],
        )?;
        registry.register(Box::new(breaker_transitions_total.clone()))?;

        let breaker_state = GaugeVec::new(
            Opts::new("medic_breaker_state", "Circuit breaker status at run end"),
            &["state"],
        )?;
        registry.register(Box::new(breaker_state.clone()))?;

        let run_candidates = Gauge::with_opts(Opts::new(
            "medic_run_candidates",
            "Stale PRs picked up by the last run",
        ))?;
        registry.register(Box::new(run_candidates.clone()))?;

        Ok(Self {
            registry,
            runs_total,
            pr_outcomes_total,
            dispatches_total,
            drift_detected_total,
            breaker_transitions_total,
            breaker_state,
            run_candidates,
        })
    }

    /// Record a finished run.
    pub fn run_completed(&self, report: &RunReport) {
        self.runs_total.with_label_values(&["completed"]).inc();
        self.run_candidates.set(report.prs.len() as f64);

        for pr in &report.prs {
            self.pr_outcomes_total
                .with_label_values(&[pr.outcome.label()])
                .inc();
            if let Some(drift) = &pr.drift {
                let applied = if drift.legal_edge { "true" } else { "false" };
                self.drift_detected_total.with_label_values(&[applied]).inc();
            }
        }

        self.set_breaker_state(report.breaker_at_end);
    }

    /// Record a run that could not query its candidates.
    pub fn run_failed(&self) {
        self.runs_total.with_label_values(&["query_failed"]).inc();
    }

    pub fn dispatch_completed(&self, action: RemediationAction, acknowledged: bool) {
        let result = if acknowledged { "acknowledged" } else { "failed" };
        self.dispatches_total
            .with_label_values(&[action.as_str(), result])
            .inc();
    }

    pub fn breaker_transition(&self, transition: BreakerTransition) {
        let label = match transition {
            BreakerTransition::Tripped => "tripped",
            BreakerTransition::Reopened => "reopened",
            BreakerTransition::Recovered => "recovered",
        };
        self.breaker_transitions_total
            .with_label_values(&[label])
            .inc();
    }

    pub fn set_breaker_state(&self, status: CircuitStatus) {
        for state in BREAKER_STATES {
            let value = if state == status { 1.0 } else { 0.0 };
            self.breaker_state
                .with_label_values(&[&state.to_string()])
                .set(value);
        }
    }

    pub fn run_count(&self, result: &str) -> f64 {
        self.runs_total.with_label_values(&[result]).get()
    }

    pub fn outcome_count(&self, outcome: &str) -> f64 {
        self.pr_outcomes_total.with_label_values(&[outcome]).get()
    }

    pub fn dispatch_count(&self, action: RemediationAction, result: &str) -> f64 {
        self.dispatches_total
            .with_label_values(&[action.as_str(), result])
            .get()
    }

    pub fn transition_count(&self, transition: &str) -> f64 {
        self.breaker_transitions_total
            .with_label_values(&[transition])
            .get()
    }

    pub fn breaker_state(&self, status: CircuitStatus) -> f64 {
        self.breaker_state
            .with_label_values(&[&status.to_string()])
            .get()
    }

    pub fn candidates(&self) -> f64 {
        self.run_candidates.get()
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for ReconcilerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcilerMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_creation() {
        let metrics = ReconcilerMetrics::new().unwrap();
        assert!(metrics.encode_text().is_ok());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        ReconcilerMetrics::with_registry(registry.clone()).unwrap();
        assert!(matches!(
            ReconcilerMetrics::with_registry(registry),
            Err(MetricsError::RegistrationFailed(_))
        ));
    }

    #[test]
    fn test_breaker_state_is_one_hot() {
        let metrics = ReconcilerMetrics::new().unwrap();
        metrics.set_breaker_state(CircuitStatus::Open);
        assert_eq!(metrics.breaker_state(CircuitStatus::Open), 1.0);
        assert_eq!(metrics.breaker_state(CircuitStatus::Closed), 0.0);

        metrics.set_breaker_state(CircuitStatus::HalfOpen);
        assert_eq!(metrics.breaker_state(CircuitStatus::Open), 0.0);
        assert_eq!(metrics.breaker_state(CircuitStatus::HalfOpen), 1.0);
    }

    #[test]
    fn test_dispatch_counter() {
        let metrics = ReconcilerMetrics::new().unwrap();
        metrics.dispatch_completed(RemediationAction::Rebuild, true);
        metrics.dispatch_completed(RemediationAction::Rebuild, true);
        metrics.dispatch_completed(RemediationAction::Rebuild, false);

        assert_eq!(metrics.dispatch_count(RemediationAction::Rebuild, "acknowledged"), 2.0);
        assert_eq!(metrics.dispatch_count(RemediationAction::Rebuild, "failed"), 1.0);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("medic_dispatches_total"));
    }

    #[test]
    fn test_transition_counter() {
        let metrics = ReconcilerMetrics::new().unwrap();
        metrics.breaker_transition(BreakerTransition::Tripped);
        assert_eq!(metrics.transition_count("tripped"), 1.0);
        assert_eq!(metrics.transition_count("recovered"), 0.0);
    }
}
