//! Full-table scan source.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::SourceConnection;
use crate::error::SyncResult;
use crate::types::{ChangePosition, SyncMode};

use super::{ChangeSource, SourceEntry, SourceQuery};

/// Yields every row of the source table, ordered by key, ignoring any
/// watermark.
///
/// Pages continue after the last key read, so rows deleted or inserted
/// between pages never shift an unchanged row out of the scan. Entry
/// positions are scan ordinals starting at 1. Before the first page is read
/// the source's newest change-log position is captured; a pass in which
/// every row succeeded may move the watermark there, because every change
/// up to that point is reflected in the rows just scanned.
pub struct FullScanSource {
    connection: Arc<dyn SourceConnection>,
    query: SourceQuery,
    last_key: Option<Value>,
    scanned: u64,
    snapshot: Option<ChangePosition>,
    exhausted: bool,
}

impl FullScanSource {
    /// Creates a scan over `query.table`.
    pub fn new(connection: Arc<dyn SourceConnection>, query: SourceQuery) -> Self {
        Self {
            connection,
            query,
            last_key: None,
            scanned: 0,
            snapshot: None,
            exhausted: false,
        }
    }

    /// The change-log position captured when the scan started.
    pub fn snapshot_position(&self) -> Option<ChangePosition> {
        self.snapshot
    }
}

#[async_trait]
impl ChangeSource for FullScanSource {
    fn mode(&self) -> SyncMode {
        SyncMode::Full
    }

    async fn next_batch(&mut self) -> SyncResult<Option<Vec<SourceEntry>>> {
        if self.exhausted {
            return Ok(None);
        }

        let snapshot = match self.snapshot {
            Some(position) => position,
            None => self.connection.latest_position(&self.query.table).await?,
        };
        self.snapshot = Some(snapshot);

        let rows = self
            .connection
            .scan_table(
                &self.query.table,
                &self.query.key_column,
                self.last_key.as_ref(),
                self.query.batch_size,
            )
            .await?;

        if rows.len() < self.query.batch_size {
            self.exhausted = true;
        }
        let Some(last) = rows.last() else {
            return Ok(None);
        };
        match last.get(&self.query.key_column) {
            Some(key) if !key.is_null() => self.last_key = Some(key.clone()),
            _ => self.exhausted = true,
        }

        let start = self.scanned;
        self.scanned += rows.len() as u64;

        let entries = rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| SourceEntry {
                position: ChangePosition::new(start + i as u64 + 1),
                record: self.query.record_from_row(row),
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            tenant = %self.query.tenant_id,
            table = %self.query.table,
            scanned = self.scanned,
            rows = entries.len(),
            "Scanned source page"
        );

        Ok(Some(entries))
    }

    fn rewind(&mut self) {
        self.last_key = None;
        self.scanned = 0;
        self.snapshot = None;
        self.exhausted = false;
    }

    fn completion_position(&self) -> Option<ChangePosition> {
        self.snapshot
    }
}
