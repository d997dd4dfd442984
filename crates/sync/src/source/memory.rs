//! In-process source database.
//!
//! Holds tables and a change log in memory. Useful for tests and demos, and
//! for exercising outage handling: the database can be switched unavailable,
//! or told to fail a number of upcoming calls.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::core::{ChangeLogEntry, ChangeOperation, SourceConnection, TenantConnector};
use crate::error::{SourceError, SyncError, SyncResult};
use crate::tenant::{Tenant, TenantId};
use crate::types::{ChangePosition, SourceRow};

use super::{key_string, row_from_value};

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<String, SourceRow>>,
    log: Vec<ChangeLogEntry>,
    next_position: u64,
}

/// An in-memory operational database with a change log.
#[derive(Debug)]
pub struct MemorySourceDatabase {
    state: RwLock<MemoryState>,
    available: AtomicBool,
    failures_pending: AtomicU32,
}

impl Default for MemorySourceDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySourceDatabase {
    /// Creates an empty, available database.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                next_position: 1,
                ..Default::default()
            }),
            available: AtomicBool::new(true),
            failures_pending: AtomicU32::new(0),
        }
    }

    /// Inserts a row and logs the change. Returns the change position.
    pub fn insert(&self, table: &str, key_column: &str, row: Value) -> ChangePosition {
        self.write_row(table, key_column, row, Some(ChangeOperation::Insert))
    }

    /// Replaces a row and logs the change. Returns the change position.
    pub fn update(&self, table: &str, key_column: &str, row: Value) -> ChangePosition {
        self.write_row(table, key_column, row, Some(ChangeOperation::Update))
    }

    /// Stores a row without logging a change.
    pub fn insert_without_capture(&self, table: &str, key_column: &str, row: Value) {
        self.write_row(table, key_column, row, None);
    }

    /// Removes a row and logs the deletion. Returns the change position.
    pub fn delete(&self, table: &str, key: &str) -> ChangePosition {
        let mut state = self.state.write();
        let old = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.remove(key));
        Self::log_change(&mut state, table, ChangeOperation::Delete, key, old)
    }

    /// Appends a raw change-log entry without touching the table.
    pub fn append_change(
        &self,
        table: &str,
        operation: ChangeOperation,
        record_id: &str,
        row: Option<SourceRow>,
    ) -> ChangePosition {
        let mut state = self.state.write();
        Self::log_change(&mut state, table, operation, record_id, row)
    }

    /// Switches the database between reachable and unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes the next `count` calls fail as unavailable.
    pub fn fail_next(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Returns the number of rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.state.read().tables.get(table).map_or(0, BTreeMap::len)
    }

    fn write_row(
        &self,
        table: &str,
        key_column: &str,
        row: Value,
        operation: Option<ChangeOperation>,
    ) -> ChangePosition {
        let row = row_from_value(row);
        let key = row.get(key_column).and_then(key_string).unwrap_or_default();
        let mut state = self.state.write();
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key.clone(), row.clone());
        match operation {
            Some(operation) => Self::log_change(&mut state, table, operation, &key, Some(row)),
            None => ChangePosition::ORIGIN,
        }
    }

    fn log_change(
        state: &mut MemoryState,
        table: &str,
        operation: ChangeOperation,
        record_id: &str,
        row: Option<SourceRow>,
    ) -> ChangePosition {
        let position = ChangePosition::new(state.next_position);
        state.next_position += 1;
        state.log.push(ChangeLogEntry {
            position,
            table: table.to_string(),
            operation,
            record_id: record_id.to_string(),
            row,
        });
        position
    }

    fn check_available(&self) -> SyncResult<()> {
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || !self.available.load(Ordering::SeqCst) {
            return Err(SyncError::Source(SourceError::Unavailable {
                tenant_id: TenantId::new("memory"),
                message: "connection refused".to_string(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceConnection for MemorySourceDatabase {
    async fn scan_table(
        &self,
        table: &str,
        _key_column: &str,
        after: Option<&Value>,
        limit: usize,
    ) -> SyncResult<Vec<SourceRow>> {
        self.check_available()?;
        let lower = match after.and_then(key_string) {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let state = self.state.read();
        Ok(state
            .tables
            .get(table)
            .map(|rows| {
                rows.range((lower, Bound::Unbounded))
                    .filter(|(key, _)| !key.is_empty())
                    .map(|(_, row)| row.clone())
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_row(
        &self,
        table: &str,
        _key_column: &str,
        key: &str,
    ) -> SyncResult<Option<SourceRow>> {
        self.check_available()?;
        let state = self.state.read();
        Ok(state.tables.get(table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn read_change_log(
        &self,
        table: &str,
        since: ChangePosition,
        limit: usize,
    ) -> SyncResult<Vec<ChangeLogEntry>> {
        self.check_available()?;
        let state = self.state.read();
        Ok(state
            .log
            .iter()
            .filter(|entry| entry.table == table && entry.position > since)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_position(&self, table: &str) -> SyncResult<ChangePosition> {
        self.check_available()?;
        let state = self.state.read();
        Ok(state
            .log
            .iter()
            .rev()
            .find(|entry| entry.table == table)
            .map_or(ChangePosition::ORIGIN, |entry| entry.position))
    }
}

/// Hands out registered [`MemorySourceDatabase`]s by tenant.
#[derive(Debug, Default)]
pub struct MemoryTenantConnector {
    databases: RwLock<HashMap<TenantId, Arc<MemorySourceDatabase>>>,
}

impl MemoryTenantConnector {
    /// Creates a connector with no tenants.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the database for a tenant.
    pub fn register(&self, tenant_id: TenantId, database: Arc<MemorySourceDatabase>) {
        self.databases.write().insert(tenant_id, database);
    }

    /// Returns the database registered for a tenant.
    pub fn database(&self, tenant_id: &TenantId) -> Option<Arc<MemorySourceDatabase>> {
        self.databases.read().get(tenant_id).cloned()
    }
}

#[async_trait]
impl TenantConnector for MemoryTenantConnector {
    async fn connect(&self, tenant: &Tenant) -> SyncResult<Arc<dyn SourceConnection>> {
        let database = self.database(&tenant.id).ok_or_else(|| {
            SyncError::source_unavailable(&tenant.id, "no source database registered")
        })?;
        if !database.available.load(Ordering::SeqCst) {
            return Err(SyncError::source_unavailable(&tenant.id, "connection refused"));
        }
        Ok(database)
    }
}
