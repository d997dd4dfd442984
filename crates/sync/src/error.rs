//! Error types for the synchronization core.
//!
//! Errors are grouped by the component that raises them: source adapters,
//! the mapping engine, the upsert writer, configuration, run leases, tenant
//! checks, the storage backend, and run control. [`SyncError::kind`] gives a
//! stable classification that is safe to persist in run records and to show
//! to callers; the raw messages never carry backend internals.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tenant::TenantId;
use crate::types::ResourceType;

/// The primary error type for all synchronization operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Change source errors
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Row mapping errors
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Canonical store write errors
    #[error(transparent)]
    Write(#[from] WriteError),

    /// Mapping descriptor configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Run lease errors
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Tenant errors
    #[error(transparent)]
    Tenant(#[from] TenantError),

    /// Backend-specific errors
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Run control errors
    #[error(transparent)]
    Run(#[from] RunError),
}

/// Errors raised while reading a tenant's source database.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The tenant's source connection could not be established or broke mid-read.
    #[error("source unavailable for tenant {tenant_id}: {message}")]
    Unavailable { tenant_id: TenantId, message: String },

    /// A source row does not carry a column the mapping descriptor reads.
    #[error("schema mismatch in {table}: missing column(s) {}", .missing.join(", "))]
    SchemaMismatch { table: String, missing: Vec<String> },

    /// The source database has no table the mapping descriptor names.
    #[error("schema mismatch: source table {table} does not exist")]
    TableMissing { table: String },
}

/// Errors raised by the mapping engine for a single row.
#[derive(Error, Debug)]
pub enum MappingError {
    /// A required target field could not be produced.
    #[error("required field '{field}' could not be produced")]
    MissingRequired { field: String },

    /// A source value could not be converted for the named target field.
    #[error("cannot map field '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl MappingError {
    /// Returns the target field the error is about.
    pub fn field(&self) -> &str {
        match self {
            MappingError::MissingRequired { field } => field,
            MappingError::InvalidValue { field, .. } => field,
        }
    }
}

/// Errors raised by the upsert writer.
#[derive(Error, Debug)]
pub enum WriteError {
    /// A referenced resource has not been applied yet for this tenant.
    #[error(
        "dangling reference: {resource_type}/{source_id} references {target_type}/{target_source_id} which is not in the store"
    )]
    DanglingReference {
        resource_type: ResourceType,
        source_id: String,
        target_type: ResourceType,
        target_source_id: String,
    },

    /// The natural-key uniqueness constraint rejected a concurrent insert.
    #[error("write conflict on {resource_type}/{source_id}")]
    WriteConflict {
        resource_type: ResourceType,
        source_id: String,
    },
}

/// Errors in mapping descriptor configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No descriptor has been supplied for the pair.
    #[error("no mapping descriptor for tenant {tenant_id}, resource type {resource_type}")]
    ConfigurationMissing {
        tenant_id: TenantId,
        resource_type: ResourceType,
    },

    /// A descriptor failed validation.
    #[error("invalid mapping descriptor for {resource_type}: {message}")]
    InvalidDescriptor {
        resource_type: ResourceType,
        message: String,
    },

    /// A descriptor file could not be read or parsed.
    #[error("cannot load mapping descriptor {path}: {message}")]
    LoadFailed { path: String, message: String },
}

/// Errors related to per-key run leases.
#[derive(Error, Debug)]
pub enum LeaseError {
    /// Another run already holds the lease for the key.
    #[error("sync already running for tenant {tenant_id}, resource type {resource_type} (held by {holder})")]
    AlreadyRunning {
        tenant_id: TenantId,
        resource_type: ResourceType,
        holder: String,
    },

    /// The lease was lost (expired and taken over) before the run finished.
    #[error("lease lost for tenant {tenant_id}, resource type {resource_type}")]
    Lost {
        tenant_id: TenantId,
        resource_type: ResourceType,
    },
}

/// Errors related to tenants.
#[derive(Error, Debug)]
pub enum TenantError {
    /// The tenant has not been onboarded.
    #[error("unknown tenant: {tenant_id}")]
    Unknown { tenant_id: TenantId },

    /// The tenant has been offboarded.
    #[error("tenant inactive: {tenant_id}")]
    Inactive { tenant_id: TenantId },
}

/// Errors originating from the storage backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend is currently unavailable.
    #[error("backend unavailable: {backend_name}")]
    Unavailable {
        backend_name: String,
        message: String,
    },

    /// Connection to the backend failed.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// Connection pool exhausted.
    #[error("connection pool exhausted for {backend_name}")]
    PoolExhausted { backend_name: String },

    /// Schema migration error.
    #[error("schema migration failed: {message}")]
    MigrationError { message: String },

    /// Internal backend error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

/// Errors that end a run early.
#[derive(Error, Debug)]
pub enum RunError {
    /// The run was cancelled between batches.
    #[error("run cancelled after {applied} applied record(s)")]
    Cancelled { applied: u64 },

    /// The run exceeded its configured duration.
    #[error("run timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    /// Every fetched row was rejected.
    #[error("all {examined} record(s) were rejected")]
    AllRowsRejected { examined: u64 },
}

/// Stable classification of a [`SyncError`].
///
/// This is what run records persist and what crosses the boundary to the
/// status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    SchemaMismatch,
    MappingError,
    DanglingReference,
    WriteConflict,
    ConfigurationMissing,
    InvalidConfiguration,
    AlreadyRunning,
    LeaseLost,
    TenantUnavailable,
    Cancelled,
    TimedOut,
    AllRowsRejected,
    Internal,
}

impl ErrorKind {
    /// Returns the persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::MappingError => "mapping_error",
            ErrorKind::DanglingReference => "dangling_reference",
            ErrorKind::WriteConflict => "write_conflict",
            ErrorKind::ConfigurationMissing => "configuration_missing",
            ErrorKind::InvalidConfiguration => "invalid_configuration",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::LeaseLost => "lease_lost",
            ErrorKind::TenantUnavailable => "tenant_unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::AllRowsRejected => "all_rows_rejected",
            ErrorKind::Internal => "internal",
        }
    }

    /// Parses the persisted string form. Unknown values map to `Internal`.
    pub fn parse(value: &str) -> Self {
        match value {
            "source_unavailable" => ErrorKind::SourceUnavailable,
            "schema_mismatch" => ErrorKind::SchemaMismatch,
            "mapping_error" => ErrorKind::MappingError,
            "dangling_reference" => ErrorKind::DanglingReference,
            "write_conflict" => ErrorKind::WriteConflict,
            "configuration_missing" => ErrorKind::ConfigurationMissing,
            "invalid_configuration" => ErrorKind::InvalidConfiguration,
            "already_running" => ErrorKind::AlreadyRunning,
            "lease_lost" => ErrorKind::LeaseLost,
            "tenant_unavailable" => ErrorKind::TenantUnavailable,
            "cancelled" => ErrorKind::Cancelled,
            "timed_out" => ErrorKind::TimedOut,
            "all_rows_rejected" => ErrorKind::AllRowsRejected,
            _ => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SyncError {
    /// Returns the stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Source(SourceError::Unavailable { .. }) => ErrorKind::SourceUnavailable,
            SyncError::Source(
                SourceError::SchemaMismatch { .. } | SourceError::TableMissing { .. },
            ) => ErrorKind::SchemaMismatch,
            SyncError::Mapping(_) => ErrorKind::MappingError,
            SyncError::Write(WriteError::DanglingReference { .. }) => ErrorKind::DanglingReference,
            SyncError::Write(WriteError::WriteConflict { .. }) => ErrorKind::WriteConflict,
            SyncError::Config(ConfigError::ConfigurationMissing { .. }) => {
                ErrorKind::ConfigurationMissing
            }
            SyncError::Config(_) => ErrorKind::InvalidConfiguration,
            SyncError::Lease(LeaseError::AlreadyRunning { .. }) => ErrorKind::AlreadyRunning,
            SyncError::Lease(LeaseError::Lost { .. }) => ErrorKind::LeaseLost,
            SyncError::Tenant(_) => ErrorKind::TenantUnavailable,
            SyncError::Run(RunError::Cancelled { .. }) => ErrorKind::Cancelled,
            SyncError::Run(RunError::TimedOut { .. }) => ErrorKind::TimedOut,
            SyncError::Run(RunError::AllRowsRejected { .. }) => ErrorKind::AllRowsRejected,
            SyncError::Backend(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` if retrying the same operation later can succeed
    /// without a configuration change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SourceUnavailable
                | ErrorKind::DanglingReference
                | ErrorKind::WriteConflict
                | ErrorKind::AlreadyRunning
                | ErrorKind::TimedOut
        )
    }

    /// Returns `true` if the error is confined to one row and must not abort
    /// the batch it belongs to.
    pub fn is_row_level(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SchemaMismatch
                | ErrorKind::MappingError
                | ErrorKind::DanglingReference
                | ErrorKind::WriteConflict
        )
    }

    /// Builds a `SourceUnavailable` error.
    pub fn source_unavailable(tenant_id: &TenantId, message: impl Into<String>) -> Self {
        SyncError::Source(SourceError::Unavailable {
            tenant_id: tenant_id.clone(),
            message: message.into(),
        })
    }
}

/// Result type alias for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Backend(BackendError::SerializationError {
            message: err.to_string(),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Backend(BackendError::Internal {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<r2d2::Error> for SyncError {
    fn from(_err: r2d2::Error) -> Self {
        SyncError::Backend(BackendError::PoolExhausted {
            backend_name: "sqlite".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dangling_reference_display() {
        let err = SyncError::Write(WriteError::DanglingReference {
            resource_type: ResourceType::Observation,
            source_id: "L1".to_string(),
            target_type: ResourceType::Patient,
            target_source_id: "P999".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "dangling reference: Observation/L1 references Patient/P999 which is not in the store"
        );
        assert_eq!(err.kind(), ErrorKind::DanglingReference);
        assert!(err.is_retryable());
        assert!(err.is_row_level());
    }

    #[test]
    fn test_schema_mismatch_display() {
        let err = SourceError::SchemaMismatch {
            table: "patients".to_string(),
            missing: vec!["gender".to_string(), "dob".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "schema mismatch in patients: missing column(s) gender, dob"
        );
    }

    #[test]
    fn test_classification() {
        let missing = SyncError::Config(ConfigError::ConfigurationMissing {
            tenant_id: TenantId::new("t1"),
            resource_type: ResourceType::Patient,
        });
        assert_eq!(missing.kind(), ErrorKind::ConfigurationMissing);
        assert!(!missing.is_retryable());
        assert!(!missing.is_row_level());

        let unavailable = SyncError::source_unavailable(&TenantId::new("t1"), "refused");
        assert_eq!(unavailable.kind(), ErrorKind::SourceUnavailable);
        assert!(unavailable.is_retryable());
        assert!(!unavailable.is_row_level());

        let absent = SyncError::Source(SourceError::TableMissing {
            table: "visits".to_string(),
        });
        assert_eq!(absent.kind(), ErrorKind::SchemaMismatch);
        assert!(!absent.is_retryable());

        let mapping = SyncError::Mapping(MappingError::MissingRequired {
            field: "identifier".to_string(),
        });
        assert!(!mapping.is_retryable());
        assert!(mapping.is_row_level());
    }

    #[test]
    fn test_error_kind_round_trips_through_text() {
        for kind in [
            ErrorKind::SourceUnavailable,
            ErrorKind::DanglingReference,
            ErrorKind::TimedOut,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), kind);
        }
        assert_eq!(ErrorKind::parse("something-else"), ErrorKind::Internal);
    }
}
