//! Collaborator traits for the synchronization core.
//!
//! The core talks to two kinds of outside systems, and each sits behind a
//! trait here:
//!
//! - The shared canonical store: [`ResourceStore`], [`WatermarkStore`],
//!   [`RunLedger`] and [`TenantDirectory`], bundled as [`SyncStore`]
//! - Tenant source databases: [`SourceConnection`], handed out per tenant by
//!   a [`TenantConnector`]
//!
//! # Trait Hierarchy
//!
//! ```text
//! SyncStore
//!     ├── ResourceStore
//!     ├── WatermarkStore
//!     ├── RunLedger
//!     └── TenantDirectory
//!
//! TenantConnector
//!     └── connect() -> SourceConnection
//! ```

mod connection;
mod store;

pub use connection::{
    ChangeLogEntry, ChangeOperation, SourceConnection, TenantConnector, is_plain_identifier,
};
pub use store::{
    DynSyncStore, ResourceStore, RunLedger, SyncStore, TenantDirectory, WatermarkStore,
};
