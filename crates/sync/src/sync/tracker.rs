//! Shared progress of an in-flight run.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;

use crate::types::{ChangePosition, RowError, RunFailure, RunState, SyncOutcome, SyncRunRecord};

/// The live record of one run, shared between the run task, its handle and
/// status queries.
///
/// Counters are updated as rows are applied, so a run that is cut short by
/// its timeout still reports what it did.
#[derive(Debug)]
pub(crate) struct RunTracker {
    record: Mutex<SyncRunRecord>,
    cancelled: AtomicBool,
    max_row_errors: usize,
}

impl RunTracker {
    pub(crate) fn new(record: SyncRunRecord, max_row_errors: usize) -> Self {
        Self {
            record: Mutex::new(record),
            cancelled: AtomicBool::new(false),
            max_row_errors,
        }
    }

    pub(crate) fn snapshot(&self) -> SyncRunRecord {
        self.record.lock().clone()
    }

    pub(crate) fn run_id(&self) -> String {
        self.record.lock().run_id.clone()
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn row_applied(&self) {
        let mut record = self.record.lock();
        record.records_examined += 1;
        record.records_applied += 1;
    }

    pub(crate) fn row_failed(&self, error: RowError) {
        let mut record = self.record.lock();
        record.records_examined += 1;
        if record.row_errors.len() < self.max_row_errors {
            record.row_errors.push(error);
        } else {
            record.row_errors_truncated += 1;
        }
    }

    pub(crate) fn watermark_advanced(&self, position: ChangePosition) {
        let mut record = self.record.lock();
        record.watermark_after = record.watermark_after.max(position);
    }

    pub(crate) fn counts(&self) -> (u64, u64, u64) {
        let record = self.record.lock();
        (
            record.records_examined,
            record.records_applied,
            record.row_error_count(),
        )
    }

    /// Moves the record to its terminal state and returns it.
    pub(crate) fn finish(&self, outcome: SyncOutcome, error: Option<RunFailure>) -> SyncRunRecord {
        let mut record = self.record.lock();
        record.state = RunState::Finished(outcome);
        record.finished_at = Some(Utc::now());
        record.error = error;
        record.clone()
    }
}
