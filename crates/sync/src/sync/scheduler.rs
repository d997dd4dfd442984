//! Periodic sync passes over every active tenant.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::SyncResult;
use crate::types::{SyncMode, SyncOutcome};

use super::orchestrator::{SyncOrchestrator, TenantSyncReport};

/// Counters across the passes a scheduler has run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Passes started.
    pub total_passes: u64,
    /// Runs finished across all passes.
    pub total_runs: u64,
    /// Runs that succeeded.
    pub successful_runs: u64,
    /// Runs that partially succeeded.
    pub partial_runs: u64,
    /// Runs that failed.
    pub failed_runs: u64,
    /// Runs rejected before they started.
    pub rejected_runs: u64,
    /// Records applied across all passes.
    pub changes_synced: u64,
    /// When the last pass finished.
    pub last_pass_at: Option<DateTime<Utc>>,
    /// Error of the last pass that could not run at all.
    pub last_error: Option<String>,
}

impl SchedulerStats {
    fn record(&mut self, reports: &[TenantSyncReport]) {
        for report in reports {
            for run in &report.runs {
                self.total_runs += 1;
                self.changes_synced += run.records_applied;
                match run.outcome() {
                    Some(SyncOutcome::Succeeded) => self.successful_runs += 1,
                    Some(SyncOutcome::PartiallySucceeded) => self.partial_runs += 1,
                    _ => self.failed_runs += 1,
                }
            }
            self.rejected_runs += report.rejected.len() as u64;
        }
    }
}

/// Triggers [`SyncOrchestrator::sync_all`] on a fixed interval.
#[derive(Debug, Clone)]
pub struct SyncScheduler {
    orchestrator: SyncOrchestrator,
    interval: Duration,
    mode: SyncMode,
    stats: Arc<RwLock<SchedulerStats>>,
}

impl SyncScheduler {
    /// Creates a scheduler running `mode` passes every `interval`.
    pub fn new(orchestrator: SyncOrchestrator, interval: Duration, mode: SyncMode) -> Self {
        Self {
            orchestrator,
            interval,
            mode,
            stats: Arc::new(RwLock::new(SchedulerStats::default())),
        }
    }

    /// Returns the counters so far.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.read().clone()
    }

    /// Runs one pass over every active tenant.
    pub async fn run_once(&self) -> SyncResult<Vec<TenantSyncReport>> {
        self.stats.write().total_passes += 1;
        let result = self.orchestrator.sync_all(self.mode).await;

        let mut stats = self.stats.write();
        stats.last_pass_at = Some(Utc::now());
        match &result {
            Ok(reports) => {
                stats.record(reports);
                stats.last_error = None;
                debug!(
                    tenants = reports.len(),
                    total_runs = stats.total_runs,
                    "Sync pass finished"
                );
            }
            Err(e) => {
                error!(error = %e, "Sync pass failed");
                stats.last_error = Some(e.to_string());
            }
        }
        result
    }

    /// Starts passes in the background until the handle is stopped.
    ///
    /// The first pass runs immediately. A pass that overruns the interval
    /// delays the next one rather than stacking them.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let stats = Arc::clone(&self.stats);
        let task = tokio::spawn(async move { self.run_loop(shutdown_rx).await });
        SchedulerHandle {
            shutdown_tx,
            stats,
            task,
        }
    }

    async fn run_loop(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            mode = %self.mode,
            "Sync scheduler started"
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Sync scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    // Errors are already logged and kept in the stats.
                    let _ = self.run_once().await;
                }
            }
        }
    }
}

/// A running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    stats: Arc<RwLock<SchedulerStats>>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Returns the counters so far.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.read().clone()
    }

    /// Stops the scheduler after the pass in progress, if any, finishes.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            error!(error = %e, "Sync scheduler task failed");
        }
    }
}
