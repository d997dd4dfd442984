//! SQLite backend implementation.
//!
//! One [`SqliteStore`] implements every store trait the sync core needs:
//! canonical resources, watermarks and leases, the run ledger, and the
//! tenant directory. It supports both in-memory databases (for tests) and
//! file-based databases.
//!
//! # Example
//!
//! ```
//! use helios_sync::backends::sqlite::SqliteStore;
//! use helios_sync::core::TenantDirectory;
//! use helios_sync::tenant::Tenant;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStore::in_memory()?;
//! store.init_schema()?;
//!
//! store.onboard(&Tenant::new("t1", "General Hospital")).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE canonical_resources (
//!     id TEXT PRIMARY KEY,              -- surrogate id, generated once
//!     tenant_id TEXT NOT NULL,
//!     resource_type TEXT NOT NULL,
//!     source_id TEXT NOT NULL,
//!     payload TEXT NOT NULL,            -- JSON, keys sorted
//!     status TEXT NOT NULL,             -- active | inactive
//!     source_system TEXT NOT NULL,
//!     created_at TEXT NOT NULL,
//!     last_synced_at TEXT NOT NULL,
//!     version INTEGER NOT NULL,
//!     UNIQUE (tenant_id, resource_type, source_id)
//! );
//!
//! CREATE TABLE watermarks (
//!     tenant_id TEXT NOT NULL,
//!     resource_type TEXT NOT NULL,
//!     position INTEGER NOT NULL,
//!     last_outcome TEXT,
//!     updated_at TEXT NOT NULL,
//!     PRIMARY KEY (tenant_id, resource_type)
//! );
//! ```
//!
//! plus `sync_leases`, the append-only `sync_runs` ledger and `tenants`.

mod backend;
mod ledger;
mod resources;
mod schema;
mod tenants;
mod watermarks;

pub use backend::{SqliteStore, SqliteStoreConfig};
pub use schema::SCHEMA_VERSION;
