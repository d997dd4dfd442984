//! Sync run records: the append-only audit trail behind status reporting.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SyncError};
use crate::tenant::TenantId;

use super::{ChangePosition, ResourceType};

/// How a run reads its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Read the whole source table, ignoring the watermark.
    Full,
    /// Read only change-log entries past the watermark.
    Incremental,
}

impl SyncMode {
    /// Returns the persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(format!("unknown sync mode '{other}' (expected full or incremental)")),
        }
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Every fetched row was mapped and written.
    Succeeded,
    /// Some rows failed; the watermark stops before the first failure.
    PartiallySucceeded,
    /// Nothing from this run moved the watermark.
    Failed,
}

impl SyncOutcome {
    /// Returns the persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Succeeded => "succeeded",
            SyncOutcome::PartiallySucceeded => "partially_succeeded",
            SyncOutcome::Failed => "failed",
        }
    }

    /// Parses the persisted string form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "succeeded" => Some(SyncOutcome::Succeeded),
            "partially_succeeded" => Some(SyncOutcome::PartiallySucceeded),
            "failed" => Some(SyncOutcome::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a (tenant, resource type) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No run is active.
    Idle,
    /// A run holds the lease and is processing batches.
    Running,
    /// The run finished with this outcome; its record is being persisted.
    Finished(SyncOutcome),
}

impl RunState {
    /// Returns `true` for the three terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Finished(_))
    }
}

/// One row that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    /// Position of the entry in the source sequence.
    pub position: ChangePosition,
    /// The row's source id, when it could be read.
    pub source_id: Option<String>,
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl RowError {
    /// Builds a row error from a row-level [`SyncError`].
    pub fn from_error(position: ChangePosition, source_id: Option<String>, err: &SyncError) -> Self {
        Self {
            position,
            source_id,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Why a run failed as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl From<&SyncError> for RunFailure {
    fn from(err: &SyncError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// One synchronization attempt for a (tenant, resource type).
///
/// While a run is in flight its record is held in memory with
/// `state == Running`; once it reaches a terminal state the record is
/// appended to the ledger and never changes again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunRecord {
    /// Unique run identifier.
    pub run_id: String,
    /// Tenant the run belongs to.
    pub tenant_id: TenantId,
    /// Resource type being synchronized.
    pub resource_type: ResourceType,
    /// How the source was read.
    pub mode: SyncMode,
    /// Current lifecycle state.
    pub state: RunState,
    /// When the run entered `Running`.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Source entries fetched.
    pub records_examined: u64,
    /// Entries written (or deactivated) in the canonical store.
    pub records_applied: u64,
    /// Watermark when the run started.
    pub watermark_before: ChangePosition,
    /// Watermark when the run ended.
    pub watermark_after: ChangePosition,
    /// Run-level failure, for `Failed` runs.
    pub error: Option<RunFailure>,
    /// Row-level failures, bounded.
    pub row_errors: Vec<RowError>,
    /// Row-level failures that did not fit in `row_errors`.
    pub row_errors_truncated: u64,
}

impl SyncRunRecord {
    /// Creates the record of a run that just entered `Running`.
    pub fn started(
        run_id: impl Into<String>,
        tenant_id: TenantId,
        resource_type: ResourceType,
        mode: SyncMode,
        watermark: ChangePosition,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            tenant_id,
            resource_type,
            mode,
            state: RunState::Running,
            started_at: Utc::now(),
            finished_at: None,
            records_examined: 0,
            records_applied: 0,
            watermark_before: watermark,
            watermark_after: watermark,
            error: None,
            row_errors: Vec::new(),
            row_errors_truncated: 0,
        }
    }

    /// Returns the terminal outcome, if the run has finished.
    pub fn outcome(&self) -> Option<SyncOutcome> {
        match self.state {
            RunState::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Returns the total number of row-level failures.
    pub fn row_error_count(&self) -> u64 {
        self.row_errors.len() as u64 + self.row_errors_truncated
    }
}
