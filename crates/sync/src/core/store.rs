//! Traits for the shared canonical store.
//!
//! The store plays four roles for the sync core, each behind its own trait
//! so a backend can be exercised one concern at a time:
//!
//! - [`ResourceStore`] - the Upsert Writer's target
//! - [`WatermarkStore`] - per-key progress and run leases
//! - [`RunLedger`] - the append-only Sync Status Ledger
//! - [`TenantDirectory`] - onboarded tenants
//!
//! [`SyncStore`] bundles them; the orchestrator holds a [`DynSyncStore`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::tenant::{Tenant, TenantId};
use crate::types::{
    CanonicalDocument, CanonicalResource, ChangePosition, Lease, NaturalKey, ResourceType,
    SyncOutcome, SyncRunRecord, UpsertOutcome, Watermark,
};

/// Insert-or-update of canonical resources keyed on the natural key.
///
/// # Referential Integrity
///
/// Every [`ResourceLink`](crate::types::ResourceLink) a document carries must
/// point at a resource already present for the same tenant. When one does
/// not, `upsert` fails with
/// [`WriteError::DanglingReference`](crate::error::WriteError::DanglingReference)
/// and leaves the store unchanged.
///
/// # Atomicity
///
/// Each `upsert` is a single atomic operation. Concurrent upserts of the
/// same natural key never create two rows and leave the store as if they had
/// been applied in some serial order.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Returns a human-readable name for this storage backend.
    fn backend_name(&self) -> &'static str;

    /// Applies a canonical document.
    ///
    /// Inserts a new resource with a fresh surrogate id when the natural key
    /// is unknown. Otherwise replaces payload and metadata in place, keeping
    /// the surrogate id and creation time, and marks the resource active.
    async fn upsert(&self, document: &CanonicalDocument) -> SyncResult<UpsertOutcome>;

    /// Marks the resource for a deleted source row inactive.
    ///
    /// Returns `None` when the natural key was never synced. Never removes
    /// the row.
    async fn deactivate(&self, key: &NaturalKey) -> SyncResult<Option<UpsertOutcome>>;

    /// Looks up a resource by natural key.
    async fn find(&self, key: &NaturalKey) -> SyncResult<Option<CanonicalResource>>;

    /// Looks up a resource by surrogate id.
    async fn find_by_id(&self, id: &str) -> SyncResult<Option<CanonicalResource>>;

    /// Checks whether a resource exists for the natural key.
    async fn exists(&self, key: &NaturalKey) -> SyncResult<bool> {
        Ok(self.find(key).await?.is_some())
    }

    /// Counts a tenant's resources, optionally of one type.
    async fn count(
        &self,
        tenant_id: &TenantId,
        resource_type: Option<ResourceType>,
    ) -> SyncResult<u64>;

    /// Lists a tenant's resources of one type ordered by source id.
    async fn list(
        &self,
        tenant_id: &TenantId,
        resource_type: ResourceType,
        limit: usize,
        offset: usize,
    ) -> SyncResult<Vec<CanonicalResource>>;
}

/// Watermarks and run leases, keyed by (tenant, resource type).
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Returns the watermark, or the origin if the pair was never synced.
    async fn get_watermark(
        &self,
        tenant_id: &TenantId,
        resource_type: ResourceType,
    ) -> SyncResult<Watermark>;

    /// Moves the watermark forward to `position` and records `outcome`.
    ///
    /// The stored position never decreases: a `position` at or below the
    /// current one leaves it unchanged. A `None` outcome keeps the last one.
    async fn advance_watermark(
        &self,
        tenant_id: &TenantId,
        resource_type: ResourceType,
        position: ChangePosition,
        outcome: Option<SyncOutcome>,
    ) -> SyncResult<Watermark>;

    /// Takes the run lease for the pair.
    ///
    /// # Errors
    ///
    /// * `LeaseError::AlreadyRunning` - if an unexpired lease is held by
    ///   another holder
    async fn acquire_lease(
        &self,
        tenant_id: &TenantId,
        resource_type: ResourceType,
        holder: &str,
        ttl: Duration,
    ) -> SyncResult<Lease>;

    /// Extends a held lease.
    ///
    /// # Errors
    ///
    /// * `LeaseError::Lost` - if the lease is no longer held by `lease.holder`
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> SyncResult<Lease>;

    /// Releases a lease. Releasing a lease that was taken over is a no-op.
    async fn release_lease(&self, lease: &Lease) -> SyncResult<()>;
}

/// The append-only Sync Status Ledger.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Appends a finished run record.
    async fn append_run(&self, record: &SyncRunRecord) -> SyncResult<()>;

    /// Lists finished runs for a tenant, newest first.
    async fn list_runs(
        &self,
        tenant_id: &TenantId,
        resource_type: Option<ResourceType>,
        limit: usize,
    ) -> SyncResult<Vec<SyncRunRecord>>;
}

/// Onboarded tenants.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Registers a tenant, or updates its display name and active flag.
    async fn onboard(&self, tenant: &Tenant) -> SyncResult<()>;

    /// Looks up a tenant.
    async fn get_tenant(&self, tenant_id: &TenantId) -> SyncResult<Option<Tenant>>;

    /// Lists tenants ordered by id.
    async fn list_tenants(&self, active_only: bool) -> SyncResult<Vec<Tenant>>;

    /// Marks a tenant inactive. Its canonical rows are kept.
    async fn deactivate_tenant(&self, tenant_id: &TenantId) -> SyncResult<()>;
}

/// Everything the orchestrator needs from the shared store.
pub trait SyncStore: ResourceStore + WatermarkStore + RunLedger + TenantDirectory {}

impl<T> SyncStore for T where T: ResourceStore + WatermarkStore + RunLedger + TenantDirectory {}

/// A shared, type-erased [`SyncStore`].
pub type DynSyncStore = Arc<dyn SyncStore>;
