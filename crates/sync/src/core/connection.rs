//! Read-only tenant source connections.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncResult;
use crate::tenant::Tenant;
use crate::types::{ChangePosition, SourceRow};

/// Kind of change recorded in a source change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

impl ChangeOperation {
    /// Returns the persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
        }
    }

    /// Parses the persisted string form, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeOperation::Insert),
            "UPDATE" => Some(ChangeOperation::Update),
            "DELETE" => Some(ChangeOperation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a source's append-only change log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeLogEntry {
    /// Strictly increasing position within the log.
    pub position: ChangePosition,
    /// The source table the change touched.
    pub table: String,
    /// What happened to the row.
    pub operation: ChangeOperation,
    /// The touched row's key.
    pub record_id: String,
    /// Row snapshot taken with the change, when the capture recorded one.
    pub row: Option<SourceRow>,
}

/// A live, read-only handle on one tenant's operational database.
///
/// Implementations report connection-level failures as
/// [`SourceError::Unavailable`](crate::error::SourceError::Unavailable) and
/// tables or columns the database does not have as a schema mismatch.
/// Table and column names come from mapping descriptors; implementations
/// reject names that are not plain identifiers.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    /// Reads one page of a table ordered by `key_column`, starting after
    /// the key `after` (from the start when `None`).
    ///
    /// Paging by key keeps a scan stable while rows are inserted or deleted
    /// between pages. Rows with a NULL key are not returned.
    async fn scan_table(
        &self,
        table: &str,
        key_column: &str,
        after: Option<&Value>,
        limit: usize,
    ) -> SyncResult<Vec<SourceRow>>;

    /// Reads the current state of one row, if it still exists.
    async fn fetch_row(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
    ) -> SyncResult<Option<SourceRow>>;

    /// Reads change-log entries for `table` with position greater than
    /// `since`, ascending, at most `limit` of them.
    async fn read_change_log(
        &self,
        table: &str,
        since: ChangePosition,
        limit: usize,
    ) -> SyncResult<Vec<ChangeLogEntry>>;

    /// Returns the newest change-log position for `table`, or the origin
    /// when the table has no entries.
    async fn latest_position(&self, table: &str) -> SyncResult<ChangePosition>;
}

/// Supplies source connections per tenant.
#[async_trait]
pub trait TenantConnector: Send + Sync {
    /// Opens (or hands out a cached) connection for the tenant.
    async fn connect(&self, tenant: &Tenant) -> SyncResult<Arc<dyn SourceConnection>>;
}

/// Returns `true` if `name` is safe to splice into SQL as an identifier.
pub fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_parse() {
        assert_eq!(ChangeOperation::parse("insert"), Some(ChangeOperation::Insert));
        assert_eq!(ChangeOperation::parse("DELETE"), Some(ChangeOperation::Delete));
        assert_eq!(ChangeOperation::parse("TRUNCATE"), None);
    }

    #[test]
    fn test_plain_identifier() {
        assert!(is_plain_identifier("patients"));
        assert!(is_plain_identifier("_lab_results2"));
        assert!(!is_plain_identifier("2patients"));
        assert!(!is_plain_identifier("patients; DROP TABLE x"));
        assert!(!is_plain_identifier(""));
    }
}
