//! Core types for the synchronization core.
//!
//! - [`ResourceType`] - The closed set of canonical resource kinds
//! - [`SourceRow`] - One raw row read from a tenant's source database
//! - [`CanonicalDocument`], [`CanonicalResource`] - Mapped and persisted resources
//! - [`Watermark`], [`ChangePosition`], [`Lease`] - Progress tracking
//! - [`SyncRunRecord`] - The run audit trail
//! - [`FieldPath`] - Dotted paths into canonical payloads
//!
//! # Examples
//!
//! ```
//! use helios_sync::types::{CanonicalDocument, NaturalKey, ResourceType};
//! use serde_json::json;
//!
//! let doc = CanonicalDocument {
//!     key: NaturalKey::new("t1", ResourceType::Patient, "P100"),
//!     payload: json!({"resourceType": "Patient", "gender": "male"}),
//!     links: vec![],
//!     source_system: "his".to_string(),
//! };
//! assert_eq!(doc.key.to_string(), "t1:Patient/P100");
//! ```

mod canonical;
mod path;
mod resource_type;
mod run_record;
mod watermark;

use std::collections::BTreeMap;

use serde_json::Value;

pub use canonical::{
    CanonicalDocument, CanonicalResource, NaturalKey, ResourceLink, ResourceStatus,
    UpsertOutcome,
};
pub use path::{FieldPath, InvalidPath, prune_nulls};
pub use resource_type::{ResourceType, UnknownResourceType};
pub use run_record::{
    RowError, RunFailure, RunState, SyncMode, SyncOutcome, SyncRunRecord,
};
pub use watermark::{ChangePosition, Lease, Watermark};

/// A raw source row: column name to value. SQL `NULL` is [`Value::Null`].
pub type SourceRow = BTreeMap<String, Value>;
