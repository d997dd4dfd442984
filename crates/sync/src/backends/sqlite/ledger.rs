//! [`RunLedger`] for SQLite.

use async_trait::async_trait;
use rusqlite::{Row, params};

use crate::core::RunLedger;
use crate::error::{ErrorKind, SyncResult};
use crate::tenant::TenantId;
use crate::types::{
    ChangePosition, ResourceType, RowError, RunFailure, RunState, SyncMode, SyncOutcome,
    SyncRunRecord,
};

use super::SqliteStore;
use super::backend::{conversion_error, format_timestamp, from_sql_int, parse_timestamp, to_sql_int};

const RUN_COLUMNS: &str = "run_id, tenant_id, resource_type, mode, outcome, started_at, \
     finished_at, records_examined, records_applied, watermark_before, watermark_after, \
     error_kind, error_message, row_errors, row_errors_truncated";

#[async_trait]
impl RunLedger for SqliteStore {
    async fn append_run(&self, record: &SyncRunRecord) -> SyncResult<()> {
        // Only finished runs reach the ledger; anything else is stored as failed.
        let outcome = record.outcome().unwrap_or(SyncOutcome::Failed);
        let row_errors = serde_json::to_string(&record.row_errors)?;

        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO sync_runs
                (run_id, tenant_id, resource_type, mode, outcome, started_at, finished_at,
                 records_examined, records_applied, watermark_before, watermark_after,
                 error_kind, error_message, row_errors, row_errors_truncated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.run_id,
                record.tenant_id.as_str(),
                record.resource_type.as_str(),
                record.mode.as_str(),
                outcome.as_str(),
                format_timestamp(record.started_at),
                record.finished_at.map(format_timestamp),
                to_sql_int(record.records_examined),
                to_sql_int(record.records_applied),
                to_sql_int(record.watermark_before.value()),
                to_sql_int(record.watermark_after.value()),
                record.error.as_ref().map(|e| e.kind.as_str()),
                record.error.as_ref().map(|e| e.message.as_str()),
                row_errors,
                to_sql_int(record.row_errors_truncated),
            ],
        )?;
        Ok(())
    }

    async fn list_runs(
        &self,
        tenant_id: &TenantId,
        resource_type: Option<ResourceType>,
        limit: usize,
    ) -> SyncResult<Vec<SyncRunRecord>> {
        let conn = self.get_connection()?;
        let limit = to_sql_int(limit as u64);

        let records = match resource_type {
            Some(rt) => {
                let sql = format!(
                    "SELECT {RUN_COLUMNS} FROM sync_runs
                     WHERE tenant_id = ?1 AND resource_type = ?2
                     ORDER BY started_at DESC, run_id DESC
                     LIMIT ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(
                    params![tenant_id.as_str(), rt.as_str(), limit],
                    read_run,
                )?
                .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {RUN_COLUMNS} FROM sync_runs
                     WHERE tenant_id = ?1
                     ORDER BY started_at DESC, run_id DESC
                     LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![tenant_id.as_str(), limit], read_run)?
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(records)
    }
}

fn read_run(row: &Row<'_>) -> rusqlite::Result<SyncRunRecord> {
    let tenant_id: String = row.get(1)?;
    let resource_type: String = row.get(2)?;
    let mode: String = row.get(3)?;
    let outcome: String = row.get(4)?;
    let started_at: String = row.get(5)?;
    let finished_at: Option<String> = row.get(6)?;
    let error_kind: Option<String> = row.get(11)?;
    let error_message: Option<String> = row.get(12)?;
    let row_errors: String = row.get(13)?;

    let row_errors: Vec<RowError> =
        serde_json::from_str(&row_errors).map_err(|e| conversion_error(13, e))?;
    let error = error_kind.map(|kind| RunFailure {
        kind: ErrorKind::parse(&kind),
        message: error_message.unwrap_or_default(),
    });

    Ok(SyncRunRecord {
        run_id: row.get(0)?,
        tenant_id: TenantId::new(tenant_id),
        resource_type: resource_type
            .parse::<ResourceType>()
            .map_err(|e| conversion_error(2, e))?,
        mode: mode
            .parse::<SyncMode>()
            .map_err(|e| conversion_error(3, e))?,
        state: RunState::Finished(SyncOutcome::parse(&outcome).unwrap_or(SyncOutcome::Failed)),
        started_at: parse_timestamp(5, &started_at)?,
        finished_at: finished_at
            .as_deref()
            .map(|at| parse_timestamp(6, at))
            .transpose()?,
        records_examined: from_sql_int(row.get(7)?),
        records_applied: from_sql_int(row.get(8)?),
        watermark_before: ChangePosition::new(from_sql_int(row.get(9)?)),
        watermark_after: ChangePosition::new(from_sql_int(row.get(10)?)),
        error,
        row_errors,
        row_errors_truncated: from_sql_int(row.get(14)?),
    })
}
