//! Operator control surface.

use std::sync::Arc;

use crate::resilience::{CircuitBreaker, CircuitBreakerState};

/// The only way to mutate breaker state from outside a run.
#[derive(Debug, Clone)]
pub struct AdminHandle {
    breaker: Arc<CircuitBreaker>,
}

impl AdminHandle {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    /// Force the breaker CLOSED with an empty window, skipping the cooldown.
    pub fn reset_circuit_breaker(&self) -> CircuitBreakerState {
        self.breaker.reset();
        self.breaker.snapshot()
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerState {
        self.breaker.snapshot()
    }
}
