//! Change positions, watermarks and run leases.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tenant::TenantId;

use super::{ResourceType, SyncOutcome};

/// A position in a source's change log.
///
/// Positions are strictly increasing per source table. Zero is the origin:
/// a watermark at zero means nothing has been synchronized yet.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChangePosition(pub u64);

impl ChangePosition {
    /// The origin position.
    pub const ORIGIN: ChangePosition = ChangePosition(0);

    /// Creates a position.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns `true` if this is the origin.
    pub const fn is_origin(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ChangePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChangePosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// How far synchronization has progressed for one (tenant, resource type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Change-log position through which synchronization is complete.
    pub position: ChangePosition,
    /// Outcome of the run that last moved or confirmed this watermark.
    pub last_outcome: Option<SyncOutcome>,
    /// When the watermark was last written.
    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    /// The watermark of a pair that has never been synchronized.
    pub fn origin(tenant_id: TenantId, resource_type: ResourceType) -> Self {
        Self {
            tenant_id,
            resource_type,
            position: ChangePosition::ORIGIN,
            last_outcome: None,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// A held run lease for one (tenant, resource type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Leased tenant.
    pub tenant_id: TenantId,
    /// Leased resource type.
    pub resource_type: ResourceType,
    /// The run holding the lease.
    pub holder: String,
    /// When the lease was taken.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses if never released or renewed.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Returns `true` if the lease has lapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
