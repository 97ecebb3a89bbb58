//! # medic-runtime
//!
//! Async reconciliation loop for AutoMergeMedic.
//!
//! `medic-core` decides what a stuck PR needs; this crate does it. A
//! [`Reconciler`] run queries the state store for stale PRs, polls live
//! status, corrects drift, classifies, and then dispatches a remediation
//! command or escalates to a human.
//!
//! Around that sit the resilience pieces:
//! - [`CircuitBreaker`]: stops all dispatch when the command path keeps failing
//! - [`RetryBudget`]: caps attempts per action per PR
//! - [`CallPolicy`]: per-call timeout and backoff for every collaborator call
//!
//! Each reconciler records Prometheus counters and gauges in
//! [`ReconcilerMetrics`]; `encode_text` renders them for scraping.
//!
//! Collaborators are async traits injected as `Arc<dyn _>`; in-memory
//! versions live in [`collaborators::memory`]. Enable the `github` feature
//! for a REST-backed [`StatusApi`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use medic_runtime::{Reconciler, Scheduler};
//!
//! let reconciler = Arc::new(
//!     Reconciler::builder()
//!         .config(config)
//!         .store(store)
//!         .status_api(status_api)
//!         .command_queue(queue)
//!         .notifier(notifier)
//!         .build()?,
//! );
//!
//! let report = reconciler.run_once().await?;
//! println!("{} dispatched", report.summary().dispatched);
//! ```

pub mod admin;
pub mod clock;
pub mod collaborators;
pub mod dispatcher;
pub mod metrics;
pub mod reconciler;
pub mod report;
pub mod resilience;
pub mod scheduler;

pub use admin::AdminHandle;
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    ApiCredential, CollaboratorError, CommandQueue, CredentialSource, EnqueueAck, EventKind,
    InMemoryCommandQueue, InMemoryStateStore, Notifier, PrEvent, RecordingNotifier,
    ScriptedStatusApi, StateStore, StatusApi, WriteResult,
};
pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher, EscalationOutcome};
pub use metrics::{MetricsError, ReconcilerMetrics};
pub use reconciler::{ReconcileError, Reconciler, ReconcilerBuilder};
pub use report::{PrOutcome, PrReport, RunReport, RunSummary};
pub use resilience::{
    Admission, BreakerTransition, BudgetCheck, CallPolicy, CircuitBreaker, CircuitBreakerState,
    CircuitStatus, Reservation, RetryBudget,
};
pub use scheduler::{Scheduler, SchedulerStats};

#[cfg(feature = "github")]
pub use collaborators::GithubStatusApi;
