//! Change Source Adapters.
//!
//! A [`ChangeSource`] turns a tenant's [`SourceConnection`] into a lazy,
//! finite, restartable sequence of row batches for one resource type. Two
//! variants exist, chosen by [`SyncMode`]:
//!
//! - [`FullScanSource`] pages the entire source table and ignores the
//!   watermark. Used to bootstrap a tenant or repair a lost watermark.
//! - [`ChangeLogSource`] yields only rows whose change-log position is past
//!   the watermark, in change-log order.
//!
//! Sources never write. A row that does not carry every column the mapping
//! descriptor reads comes back as a per-row
//! [`SourceError::SchemaMismatch`]; a broken connection fails the whole
//! batch with [`SourceError::Unavailable`] and leaves the source positioned
//! so the same batch can be requested again.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use helios_sync::source::{MemorySourceDatabase, SourceQuery, open_source};
//! use helios_sync::tenant::TenantId;
//! use helios_sync::types::{ChangePosition, SyncMode};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let db = Arc::new(MemorySourceDatabase::new());
//! db.insert("patients", "patient_id", json!({"patient_id": "P100", "gender": "M"}));
//!
//! let query = SourceQuery::new(TenantId::new("t1"), "patients", "patient_id")
//!     .with_columns(["gender"]);
//! let mut source = open_source(SyncMode::Incremental, db, query, ChangePosition::ORIGIN);
//!
//! let batch = source.next_batch().await.unwrap().unwrap();
//! assert_eq!(batch.len(), 1);
//! assert_eq!(batch[0].position, ChangePosition::new(1));
//! # }
//! ```

mod change_log;
mod full_scan;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::SourceConnection;
use crate::error::{MappingError, SourceError, SyncResult};
use crate::tenant::TenantId;
use crate::types::{ChangePosition, SourceRow, SyncMode};

pub use change_log::ChangeLogSource;
pub use full_scan::FullScanSource;
pub use memory::{MemorySourceDatabase, MemoryTenantConnector};
#[cfg(feature = "sqlite")]
pub use sqlite::{
    CHANGE_LOG_TABLE, SqliteSourceConnection, SqliteTenantConnector, install_change_capture,
};

/// What to read from a tenant's source for one resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    /// Tenant the source belongs to.
    pub tenant_id: TenantId,
    /// Source table name.
    pub table: String,
    /// Column holding each row's source id.
    pub key_column: String,
    /// Columns every row must carry. Always includes `key_column`.
    pub required_columns: Vec<String>,
    /// Entries per batch.
    pub batch_size: usize,
}

impl SourceQuery {
    /// Default number of entries per batch.
    pub const DEFAULT_BATCH_SIZE: usize = 500;

    /// Creates a query reading only the key column.
    pub fn new(
        tenant_id: TenantId,
        table: impl Into<String>,
        key_column: impl Into<String>,
    ) -> Self {
        let key_column = key_column.into();
        Self {
            tenant_id,
            table: table.into(),
            required_columns: vec![key_column.clone()],
            key_column,
            batch_size: Self::DEFAULT_BATCH_SIZE,
        }
    }

    /// Adds columns every row must carry.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            if !self.required_columns.contains(&column) {
                self.required_columns.push(column);
            }
        }
        self
    }

    /// Sets the batch size. Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Checks that `row` carries every required column. Null values count
    /// as present.
    pub fn check_columns(&self, row: &SourceRow) -> SyncResult<()> {
        let missing: Vec<String> = self
            .required_columns
            .iter()
            .filter(|column| !row.contains_key(*column))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SourceError::SchemaMismatch {
                table: self.table.clone(),
                missing,
            }
            .into())
        }
    }

    /// Validates a row and extracts its source id.
    pub fn record_from_row(&self, row: SourceRow) -> SyncResult<SourceRecord> {
        self.check_columns(&row)?;
        let source_id = row
            .get(&self.key_column)
            .and_then(key_string)
            .ok_or_else(|| MappingError::MissingRequired {
                field: "identifier".to_string(),
            })?;
        Ok(SourceRecord {
            source_id,
            deleted: false,
            row,
        })
    }
}

/// One source row as yielded by a [`ChangeSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// The row key.
    pub source_id: String,
    /// `true` if the row was deleted in the source.
    pub deleted: bool,
    /// Column values. Empty for deletions the log has no snapshot for.
    pub row: SourceRow,
}

/// One position in a source sequence and what was read there.
#[derive(Debug)]
pub struct SourceEntry {
    /// Change-log position (change-log mode) or scan ordinal (full scan).
    pub position: ChangePosition,
    /// The row, or the row-level error that prevented reading it.
    pub record: SyncResult<SourceRecord>,
}

/// A lazy, finite, restartable sequence of source row batches.
#[async_trait]
pub trait ChangeSource: Send {
    /// Which sync mode this source implements.
    fn mode(&self) -> SyncMode;

    /// Returns the next batch, or `None` once the sequence is exhausted.
    ///
    /// On error the source has not advanced; calling again retries the
    /// same batch.
    async fn next_batch(&mut self) -> SyncResult<Option<Vec<SourceEntry>>>;

    /// Restarts the sequence from its initial cursor.
    fn rewind(&mut self);

    /// The change-log position a fully successful pass may move the
    /// watermark to, when it is not simply the last entry's position.
    fn completion_position(&self) -> Option<ChangePosition>;
}

/// Opens the source variant for `mode`.
pub fn open_source(
    mode: SyncMode,
    connection: Arc<dyn SourceConnection>,
    query: SourceQuery,
    cursor: ChangePosition,
) -> Box<dyn ChangeSource> {
    match mode {
        SyncMode::Full => Box::new(FullScanSource::new(connection, query)),
        SyncMode::Incremental => Box::new(ChangeLogSource::new(connection, query, cursor)),
    }
}

/// Renders a key column value as a source id.
pub(crate) fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Converts a JSON object into a source row.
pub(crate) fn row_from_value(value: Value) -> SourceRow {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => SourceRow::new(),
    }
}
