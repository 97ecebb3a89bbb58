//! Resilience patterns for medic-runtime.
//!
//! This module provides:
//! - Circuit breaker gating remediation dispatch
//! - Per-PR retry budgets
//! - Call-site timeout and retry with backoff

mod backoff;
mod budget;
mod circuit_breaker;

pub use backoff::CallPolicy;
pub use budget::{BudgetCheck, Reservation, RetryBudget};
pub use circuit_breaker::{
    Admission, BreakerTransition, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState,
    CircuitStatus, OutcomeSample,
};
