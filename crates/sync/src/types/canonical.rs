//! Canonical resource types.
//!
//! The mapping engine produces a [`CanonicalDocument`]: the payload plus the
//! natural key it belongs under and the links it carries to other resources.
//! The store turns a document into a [`CanonicalResource`] by attaching the
//! surrogate id and synchronization metadata.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tenant::TenantId;

use super::{FieldPath, ResourceType};

/// The (tenant, resource type, source id) triple that identifies a source
/// row's canonical resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Resource type.
    pub resource_type: ResourceType,
    /// The row key in the tenant's source table.
    pub source_id: String,
}

impl NaturalKey {
    /// Creates a natural key.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        resource_type: ResourceType,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            resource_type,
            source_id: source_id.into(),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.tenant_id, self.resource_type, self.source_id
        )
    }
}

/// Whether the source row behind a canonical resource still exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// The source row exists.
    Active,
    /// The source row was deleted; the canonical row is kept.
    Inactive,
}

impl ResourceStatus {
    /// Returns the persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Active => "active",
            ResourceStatus::Inactive => "inactive",
        }
    }

    /// Parses the persisted string form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(ResourceStatus::Active),
            "inactive" => Some(ResourceStatus::Inactive),
            _ => None,
        }
    }
}

/// A reference from one canonical resource to another, by the target's
/// source id within the same tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLink {
    /// Where in the payload the reference object lives.
    pub path: FieldPath,
    /// The referenced resource type.
    pub target_type: ResourceType,
    /// The referenced row's source id.
    pub target_source_id: String,
}

/// Output of the mapping engine for one source row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDocument {
    /// Natural key for upsert matching.
    pub key: NaturalKey,
    /// The FHIR-shaped payload. Keys are sorted, absent fields omitted.
    pub payload: Value,
    /// References this document carries.
    pub links: Vec<ResourceLink>,
    /// Tag naming the source system the row came from.
    pub source_system: String,
}

impl CanonicalDocument {
    /// Serializes the payload. Identical documents give identical bytes.
    pub fn payload_bytes(&self) -> Vec<u8> {
        // serde_json's default map keeps keys sorted; Value serialization cannot fail.
        serde_json::to_vec(&self.payload).unwrap_or_default()
    }

    /// Returns the link to the owning Patient, if any.
    pub fn patient_link(&self) -> Option<&ResourceLink> {
        self.links
            .iter()
            .find(|link| link.target_type == ResourceType::Patient)
    }
}

/// A canonical resource as persisted in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResource {
    /// Surrogate identifier, generated once on first insert.
    pub id: String,
    /// Natural key.
    pub key: NaturalKey,
    /// The payload with references resolved to surrogate ids.
    pub payload: Value,
    /// Whether the source row still exists.
    pub status: ResourceStatus,
    /// Source system tag.
    pub source_system: String,
    /// When the resource was first synced.
    pub created_at: DateTime<Utc>,
    /// When the resource was last touched by a sync.
    pub last_synced_at: DateTime<Utc>,
    /// Incremented each time payload or status actually changes.
    pub version: u64,
}

impl CanonicalResource {
    /// Returns the FHIR-style `Type/id` reference for this resource.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.key.resource_type, self.id)
    }
}

/// What an upsert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new resource was created with this surrogate id.
    Inserted(String),
    /// The existing resource's payload or status changed.
    Updated(String),
    /// The write matched the stored resource; only sync metadata moved.
    Unchanged(String),
}

impl UpsertOutcome {
    /// Returns the surrogate id of the written resource.
    pub fn id(&self) -> &str {
        match self {
            UpsertOutcome::Inserted(id) => id,
            UpsertOutcome::Updated(id) => id,
            UpsertOutcome::Unchanged(id) => id,
        }
    }
}
