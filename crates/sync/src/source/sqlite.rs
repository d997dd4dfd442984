//! SQLite hospital databases as change sources.
//!
//! Each tenant's operational database is a SQLite file. Change capture is a
//! `data_change_log` table filled by `AFTER INSERT/UPDATE/DELETE` triggers
//! that [`install_change_capture`] creates per table; each entry carries a
//! `json_object` snapshot of the row as it was written.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags, Row, params};
use serde_json::{Number, Value};

use crate::core::{
    ChangeLogEntry, ChangeOperation, SourceConnection, TenantConnector, is_plain_identifier,
};
use crate::error::{ConfigError, SourceError, SyncError, SyncResult};
use crate::tenant::{Tenant, TenantId};
use crate::types::{ChangePosition, SourceRow};

use super::row_from_value;

/// Name of the change-log table in source databases.
pub const CHANGE_LOG_TABLE: &str = "data_change_log";

/// Creates the change-log table and the capture triggers for `table`.
///
/// Safe to call repeatedly. Existing rows are not logged; run a full sync
/// to bootstrap them.
pub fn install_change_capture(
    conn: &Connection,
    table: &str,
    key_column: &str,
) -> SyncResult<()> {
    check_identifier(table)?;
    check_identifier(key_column)?;

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {CHANGE_LOG_TABLE} (
            position INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            operation TEXT NOT NULL,
            record_id TEXT NOT NULL,
            new_data TEXT,
            changed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE INDEX IF NOT EXISTS idx_{CHANGE_LOG_TABLE}_table
            ON {CHANGE_LOG_TABLE}(table_name, position);"
    ))?;

    let columns = table_columns(conn, table)?;
    if columns.is_empty() {
        return Err(ConfigError::LoadFailed {
            path: table.to_string(),
            message: "source table does not exist".to_string(),
        }
        .into());
    }
    if !columns.iter().any(|c| c == key_column) {
        return Err(ConfigError::LoadFailed {
            path: table.to_string(),
            message: format!("key column '{key_column}' not found"),
        }
        .into());
    }

    let snapshot = |alias: &str| {
        let pairs = columns
            .iter()
            .map(|c| format!("'{c}', {alias}.\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!("json_object({pairs})")
    };

    conn.execute_batch(&format!(
        "CREATE TRIGGER IF NOT EXISTS trg_{table}_capture_insert AFTER INSERT ON \"{table}\"
         BEGIN
            INSERT INTO {CHANGE_LOG_TABLE} (table_name, operation, record_id, new_data)
            VALUES ('{table}', 'INSERT', CAST(NEW.\"{key_column}\" AS TEXT), {new});
         END;
         CREATE TRIGGER IF NOT EXISTS trg_{table}_capture_update AFTER UPDATE ON \"{table}\"
         BEGIN
            INSERT INTO {CHANGE_LOG_TABLE} (table_name, operation, record_id, new_data)
            VALUES ('{table}', 'UPDATE', CAST(NEW.\"{key_column}\" AS TEXT), {new});
         END;
         CREATE TRIGGER IF NOT EXISTS trg_{table}_capture_delete AFTER DELETE ON \"{table}\"
         BEGIN
            INSERT INTO {CHANGE_LOG_TABLE} (table_name, operation, record_id, new_data)
            VALUES ('{table}', 'DELETE', CAST(OLD.\"{key_column}\" AS TEXT), {old});
         END;",
        new = snapshot("NEW"),
        old = snapshot("OLD"),
    ))?;

    tracing::info!(table, key_column, "Installed change capture");
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> SyncResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Returns `true` once change capture has been installed for any table.
fn has_change_log(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![CHANGE_LOG_TABLE],
        |row| row.get(0),
    )
}

fn check_identifier(name: &str) -> SyncResult<()> {
    if is_plain_identifier(name) {
        Ok(())
    } else {
        Err(ConfigError::LoadFailed {
            path: name.to_string(),
            message: "not a plain SQL identifier".to_string(),
        }
        .into())
    }
}

/// A read-only connection pool on one tenant's SQLite database.
pub struct SqliteSourceConnection {
    tenant_id: TenantId,
    pool: Pool<SqliteConnectionManager>,
}

impl std::fmt::Debug for SqliteSourceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSourceConnection")
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

impl SqliteSourceConnection {
    /// Opens `path` read-only.
    ///
    /// # Errors
    ///
    /// * `SourceError::Unavailable` - if the file is missing or cannot be opened
    pub fn open(tenant_id: TenantId, path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SyncError::source_unavailable(
                &tenant_id,
                format!("source database {} not found", path.display()),
            ));
        }

        let manager = SqliteConnectionManager::file(path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .with_init(|conn| conn.busy_timeout(Duration::from_millis(5000)));

        let pool = Pool::builder()
            .max_size(4)
            .min_idle(Some(0))
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .map_err(|e| SyncError::source_unavailable(&tenant_id, e.to_string()))?;

        Ok(Self { tenant_id, pool })
    }

    fn connection(&self) -> SyncResult<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| SyncError::source_unavailable(&self.tenant_id, e.to_string()))
    }

    fn unavailable(&self, err: rusqlite::Error) -> SyncError {
        SyncError::source_unavailable(&self.tenant_id, err.to_string())
    }

    /// Classifies a failed statement: missing tables and columns are a
    /// schema mismatch, everything else an unreachable source.
    fn read_failed(&self, table: &str, err: rusqlite::Error) -> SyncError {
        let message = err.to_string();
        if message.contains("no such table") {
            SourceError::TableMissing {
                table: table.to_string(),
            }
            .into()
        } else if let Some(column) = message.split("no such column: ").nth(1) {
            SourceError::SchemaMismatch {
                table: table.to_string(),
                missing: vec![column.trim().to_string()],
            }
            .into()
        } else {
            self.unavailable(err)
        }
    }
}

/// Binds a JSON key value with its SQLite storage class, so integer keys
/// compare numerically.
fn key_param(key: &Value) -> SqlValue {
    match key {
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Null => SqlValue::Null,
        other => SqlValue::Text(other.to_string()),
    }
}

/// Converts one result row into a source row keyed by column name.
fn read_row(row: &Row<'_>, names: &[String]) -> rusqlite::Result<SourceRow> {
    let mut out = SourceRow::new();
    for (i, name) in names.iter().enumerate() {
        let value = match row.get_ref(i)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => Value::Number(n.into()),
            ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
            ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        };
        out.insert(name.clone(), value);
    }
    Ok(out)
}

#[async_trait]
impl SourceConnection for SqliteSourceConnection {
    async fn scan_table(
        &self,
        table: &str,
        key_column: &str,
        after: Option<&Value>,
        limit: usize,
    ) -> SyncResult<Vec<SourceRow>> {
        check_identifier(table)?;
        check_identifier(key_column)?;
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT * FROM \"{table}\"
                 WHERE \"{key_column}\" IS NOT NULL AND (?1 IS NULL OR \"{key_column}\" > ?1)
                 ORDER BY \"{key_column}\"
                 LIMIT ?2"
            ))
            .map_err(|e| self.read_failed(table, e))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let cursor = after.map_or(SqlValue::Null, key_param);
        let rows = stmt
            .query_map(params![cursor, limit as i64], |row| read_row(row, &names))
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| self.unavailable(e))?;
        Ok(rows)
    }

    async fn fetch_row(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
    ) -> SyncResult<Option<SourceRow>> {
        check_identifier(table)?;
        check_identifier(key_column)?;
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT * FROM \"{table}\" WHERE CAST(\"{key_column}\" AS TEXT) = ?1 LIMIT 1"
            ))
            .map_err(|e| self.read_failed(table, e))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt
            .query_map(params![key], |row| read_row(row, &names))
            .map_err(|e| self.unavailable(e))?;
        rows.next().transpose().map_err(|e| self.unavailable(e))
    }

    async fn read_change_log(
        &self,
        table: &str,
        since: ChangePosition,
        limit: usize,
    ) -> SyncResult<Vec<ChangeLogEntry>> {
        let conn = self.connection()?;
        if !has_change_log(&conn).map_err(|e| self.unavailable(e))? {
            return Ok(Vec::new());
        }
        let mut stmt = conn
            .prepare(&format!(
                "SELECT position, table_name, operation, record_id, new_data
                 FROM {CHANGE_LOG_TABLE}
                 WHERE table_name = ?1 AND position > ?2
                 ORDER BY position
                 LIMIT ?3"
            ))
            .map_err(|e| self.read_failed(CHANGE_LOG_TABLE, e))?;

        let raw = stmt
            .query_map(params![table, since.value() as i64, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| self.unavailable(e))?;

        let mut entries = Vec::with_capacity(raw.len());
        for (position, table_name, operation, record_id, new_data) in raw {
            let Some(operation) = ChangeOperation::parse(&operation) else {
                tracing::warn!(
                    tenant = %self.tenant_id,
                    position,
                    operation = %operation,
                    "Skipping change-log entry with unknown operation"
                );
                continue;
            };
            let row = match new_data {
                Some(text) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => Some(row_from_value(value)),
                    Err(e) => {
                        tracing::warn!(
                            tenant = %self.tenant_id,
                            position,
                            error = %e,
                            "Unreadable change-log snapshot, reading current row instead"
                        );
                        None
                    }
                },
                None => None,
            };
            entries.push(ChangeLogEntry {
                position: ChangePosition::new(position.max(0) as u64),
                table: table_name,
                operation,
                record_id,
                row,
            });
        }
        Ok(entries)
    }

    async fn latest_position(&self, table: &str) -> SyncResult<ChangePosition> {
        let conn = self.connection()?;
        if !has_change_log(&conn).map_err(|e| self.unavailable(e))? {
            return Ok(ChangePosition::ORIGIN);
        }
        let position: Option<i64> = conn
            .query_row(
                &format!("SELECT MAX(position) FROM {CHANGE_LOG_TABLE} WHERE table_name = ?1"),
                params![table],
                |row| row.get(0),
            )
            .map_err(|e| self.unavailable(e))?;
        Ok(ChangePosition::new(position.unwrap_or(0).max(0) as u64))
    }
}

/// Opens SQLite source databases by tenant, caching one pool per tenant.
#[derive(Debug, Default)]
pub struct SqliteTenantConnector {
    paths: RwLock<HashMap<TenantId, PathBuf>>,
    open: RwLock<HashMap<TenantId, Arc<SqliteSourceConnection>>>,
}

impl SqliteTenantConnector {
    /// Creates a connector with no tenants.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the database file for a tenant, dropping any cached pool.
    pub fn register(&self, tenant_id: TenantId, path: impl Into<PathBuf>) {
        self.open.write().remove(&tenant_id);
        self.paths.write().insert(tenant_id, path.into());
    }
}

#[async_trait]
impl TenantConnector for SqliteTenantConnector {
    async fn connect(&self, tenant: &Tenant) -> SyncResult<Arc<dyn SourceConnection>> {
        if let Some(conn) = self.open.read().get(&tenant.id) {
            return Ok(conn.clone());
        }

        let path = self.paths.read().get(&tenant.id).cloned().ok_or_else(|| {
            SyncError::source_unavailable(&tenant.id, "no source database registered")
        })?;

        let conn = Arc::new(SqliteSourceConnection::open(tenant.id.clone(), &path)?);
        self.open.write().insert(tenant.id.clone(), conn.clone());
        tracing::debug!(tenant = %tenant.id, path = %path.display(), "Opened source database");
        Ok(conn)
    }
}
