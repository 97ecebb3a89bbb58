//! Periodic driver for reconciliation runs.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::reconciler::Reconciler;
use crate::report::RunReport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub runs: usize,
    pub failed_runs: usize,
}

pub struct Scheduler {
    reconciler: Arc<Reconciler>,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    /// Run every `cadence` until `shutdown` turns true or its sender drops.
    ///
    /// The first run starts immediately. Runs never overlap: a run that
    /// outlasts the cadence swallows the missed ticks. Shutdown waits for
    /// the in-flight run to finish.
    pub async fn run_every<F>(
        &self,
        cadence: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut on_report: F,
    ) -> SchedulerStats
    where
        F: FnMut(&RunReport),
    {
        let mut stats = SchedulerStats::default();
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    stats.runs += 1;
                    match self.reconciler.run_once().await {
                        Ok(report) => on_report(&report),
                        Err(e) => {
                            stats.failed_runs += 1;
                            tracing::error!(error = %e, "Reconciliation run failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(runs = stats.runs, failed = stats.failed_runs, "Scheduler stopped");
        stats
    }
}
