//! SQLite schema definitions and migrations.

use rusqlite::Connection;

use crate::error::{BackendError, SyncError, SyncResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SyncResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::info!(version = SCHEMA_VERSION, "Created sync store schema");
    } else if current_version > SCHEMA_VERSION {
        return Err(migration_error(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> SyncResult<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| migration_error(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> SyncResult<()> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| migration_error(format!("Failed to clear schema_version: {}", e)))?;

    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])
        .map_err(|e| migration_error(format!("Failed to set schema_version: {}", e)))?;

    Ok(())
}

/// Create the initial schema (version 1).
fn create_schema_v1(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            onboarded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS canonical_resources (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            source_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            source_system TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_synced_at TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            UNIQUE (tenant_id, resource_type, source_id)
        );

        CREATE TABLE IF NOT EXISTS watermarks (
            tenant_id TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            last_outcome TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, resource_type)
        );

        CREATE TABLE IF NOT EXISTS sync_leases (
            tenant_id TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            holder TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, resource_type)
        );

        CREATE TABLE IF NOT EXISTS sync_runs (
            run_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            mode TEXT NOT NULL,
            outcome TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            records_examined INTEGER NOT NULL DEFAULT 0,
            records_applied INTEGER NOT NULL DEFAULT 0,
            watermark_before INTEGER NOT NULL DEFAULT 0,
            watermark_after INTEGER NOT NULL DEFAULT 0,
            error_kind TEXT,
            error_message TEXT,
            row_errors TEXT NOT NULL DEFAULT '[]',
            row_errors_truncated INTEGER NOT NULL DEFAULT 0,
            UNIQUE (tenant_id, resource_type, started_at, run_id)
        );",
    )
    .map_err(|e| migration_error(format!("Failed to create tables: {}", e)))?;

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_canonical_resources_type
            ON canonical_resources(tenant_id, resource_type, source_id);
        CREATE INDEX IF NOT EXISTS idx_sync_runs_tenant
            ON sync_runs(tenant_id, started_at);
        CREATE INDEX IF NOT EXISTS idx_sync_runs_type
            ON sync_runs(tenant_id, resource_type, started_at);",
    )
    .map_err(|e| migration_error(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

fn migration_error(message: String) -> SyncError {
    SyncError::Backend(BackendError::MigrationError { message })
}
