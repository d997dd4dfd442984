//! Helios Sync
//!
//! This crate synchronizes the operational databases of many hospitals into
//! one shared, multi-tenant store of FHIR-shaped canonical resources. Each
//! hospital (tenant) keeps its own schema; per-tenant mapping descriptors
//! turn its rows into canonical documents, and change-driven runs keep the
//! shared store current without rereading unchanged data.
//!
//! # Architecture
//!
//! - [`tenant`] - Tenant identity and onboarding records
//! - [`types`] - Resource types, canonical documents, watermarks, run records
//! - [`error`] - Error types for all operations
//! - [`core`] - Store and source-connection traits
//! - [`source`] - Change Source Adapters (full scan and change log)
//! - [`mapping`] - Mapping descriptors and the Mapping Engine
//! - [`backends`] - Canonical store implementations (SQLite)
//! - [`sync`] - The Sync Orchestrator and scheduler
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use helios_sync::backends::sqlite::SqliteStore;
//! use helios_sync::core::TenantDirectory;
//! use helios_sync::mapping::{DescriptorRegistry, MappingDescriptor};
//! use helios_sync::source::{MemorySourceDatabase, MemoryTenantConnector};
//! use helios_sync::sync::{SyncConfig, SyncOrchestrator};
//! use helios_sync::tenant::{Tenant, TenantId};
//! use helios_sync::types::{ResourceType, SyncMode, SyncOutcome};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStore::in_memory()?;
//! store.init_schema()?;
//! store.onboard(&Tenant::new("t1", "General Hospital")).await?;
//!
//! let source = Arc::new(MemorySourceDatabase::new());
//! source.insert("patients", "patient_id", json!({"patient_id": "P100", "sex": "M"}));
//! let connector = MemoryTenantConnector::new();
//! connector.register(TenantId::new("t1"), source);
//!
//! let registry = DescriptorRegistry::new();
//! registry.register(serde_json::from_value::<MappingDescriptor>(json!({
//!     "tenant_id": "t1",
//!     "resource_type": "Patient",
//!     "source_table": "patients",
//!     "source_id_column": "patient_id",
//!     "fields": [{
//!         "target": "gender",
//!         "transform": {"kind": "code_lookup", "column": "sex",
//!                       "output": "code",
//!                       "codes": {"M": {"code": "male"}, "F": {"code": "female"}}}
//!     }]
//! }))?)?;
//!
//! let orchestrator = SyncOrchestrator::new(
//!     Arc::new(store),
//!     Arc::new(connector),
//!     Arc::new(registry),
//!     SyncConfig::default(),
//! );
//! let record = orchestrator
//!     .run_sync(&TenantId::new("t1"), ResourceType::Patient, SyncMode::Incremental)
//!     .await?;
//! assert_eq!(record.outcome(), Some(SyncOutcome::Succeeded));
//! assert_eq!(record.records_applied, 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Multitenancy
//!
//! Every key the core persists starts with a [`TenantId`]: the canonical
//! natural key (tenant, resource type, source id), the watermark key and
//! the lease key. References between canonical resources resolve only
//! within the same tenant.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backends;
pub mod core;
pub mod error;
pub mod mapping;
pub mod source;
pub mod sync;
pub mod tenant;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{ErrorKind, SyncError, SyncResult};
pub use tenant::{Tenant, TenantId};
pub use types::{ResourceType, SyncMode, SyncOutcome, SyncRunRecord};

// Re-export core traits
pub use core::{
    DynSyncStore, ResourceStore, RunLedger, SourceConnection, SyncStore, TenantConnector,
    TenantDirectory, WatermarkStore,
};

pub use mapping::{DescriptorRegistry, MappingDescriptor};
pub use sync::{SyncConfig, SyncOrchestrator, SyncScheduler};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
