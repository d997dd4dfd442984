//! The body of one sync run: read, map, write, advance.

use std::sync::Arc;

use crate::core::{DynSyncStore, SourceConnection, TenantConnector};
use crate::error::{ErrorKind, RunError, SyncResult};
use crate::mapping::{MappingDescriptor, map_record};
use crate::source::{ChangeSource, SourceEntry, SourceRecord, open_source};
use crate::tenant::{Tenant, TenantId};
use crate::types::{ChangePosition, Lease, NaturalKey, RowError, SyncMode};

use super::config::{RetryConfig, SyncConfig};
use super::tracker::RunTracker;

/// Everything fixed before a run starts executing.
pub(crate) struct RunPlan {
    pub tenant: Tenant,
    pub descriptor: Arc<MappingDescriptor>,
    pub mode: SyncMode,
    pub start: ChangePosition,
    pub lease: Lease,
}

/// Runs the read-map-write loop until the source is exhausted.
///
/// Row-level failures are recorded on the tracker and do not stop the run.
/// Anything else aborts it. The lease is renewed before every batch is
/// written, so a run whose lease was taken over stops with
/// `LeaseError::Lost` before touching the store. In change-log mode the watermark is advanced
/// after every batch to the last position before the run's first failed
/// row; in full-scan mode it moves once, to the source's snapshot
/// position, and only if no row failed.
pub(crate) async fn execute(
    store: &DynSyncStore,
    connector: &dyn TenantConnector,
    config: &SyncConfig,
    plan: &RunPlan,
    tracker: &RunTracker,
) -> SyncResult<()> {
    let tenant_id = &plan.tenant.id;
    let resource_type = plan.descriptor.resource_type;

    let connection = connect_with_retry(connector, &plan.tenant, &config.retry).await?;
    let query = plan.descriptor.source_query(config.batch_size);
    let mut source = open_source(plan.mode, connection, query, plan.start);

    let mut blocked = false;
    let mut lease = plan.lease.clone();

    loop {
        if tracker.is_cancelled() {
            let (_, applied, _) = tracker.counts();
            return Err(RunError::Cancelled { applied }.into());
        }

        let Some(batch) = next_batch_with_retry(source.as_mut(), tenant_id, &config.retry).await?
        else {
            break;
        };
        lease = store.renew_lease(&lease, config.lease_ttl()).await?;

        let mut contiguous = None;
        for SourceEntry { position, record } in batch {
            let source_id = record.as_ref().ok().map(|r| r.source_id.clone());
            match apply(store, &plan.descriptor, record).await {
                Ok(()) => {
                    tracker.row_applied();
                    if !blocked {
                        contiguous = Some(position);
                    }
                }
                Err(err) if err.is_row_level() => {
                    tracing::warn!(
                        tenant = %tenant_id,
                        resource_type = %resource_type,
                        run_id = %lease.holder,
                        position = %position,
                        source_id = source_id.as_deref().unwrap_or(""),
                        error = %err,
                        "Row failed"
                    );
                    tracker.row_failed(RowError::from_error(position, source_id, &err));
                    blocked = true;
                }
                Err(err) => return Err(err),
            }
        }

        if plan.mode == SyncMode::Incremental {
            if let Some(position) = contiguous {
                store
                    .advance_watermark(tenant_id, resource_type, position, None)
                    .await?;
                tracker.watermark_advanced(position);
            }
        }
    }

    if plan.mode == SyncMode::Full && !blocked {
        if let Some(snapshot) = source.completion_position() {
            store.renew_lease(&lease, config.lease_ttl()).await?;
            store
                .advance_watermark(tenant_id, resource_type, snapshot, None)
                .await?;
            tracker.watermark_advanced(snapshot);
        }
    }

    Ok(())
}

/// Applies one source entry: upsert for live rows, deactivation for
/// deleted ones.
async fn apply(
    store: &DynSyncStore,
    descriptor: &MappingDescriptor,
    record: SyncResult<SourceRecord>,
) -> SyncResult<()> {
    let record = record?;
    if record.deleted {
        let key = NaturalKey::new(
            descriptor.tenant_id.clone(),
            descriptor.resource_type,
            record.source_id,
        );
        store.deactivate(&key).await?;
        return Ok(());
    }

    let document = map_record(descriptor, &record)?;
    store.upsert(&document).await?;
    Ok(())
}

async fn connect_with_retry(
    connector: &dyn TenantConnector,
    tenant: &Tenant,
    retry: &RetryConfig,
) -> SyncResult<Arc<dyn SourceConnection>> {
    let mut backoff = retry.backoff();
    loop {
        match connector.connect(tenant).await {
            Err(err) if err.kind() == ErrorKind::SourceUnavailable => {
                let Some(delay) = backoff.next_delay() else {
                    return Err(err);
                };
                tracing::warn!(
                    tenant = %tenant.id,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Source connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

async fn next_batch_with_retry(
    source: &mut dyn ChangeSource,
    tenant_id: &TenantId,
    retry: &RetryConfig,
) -> SyncResult<Option<Vec<SourceEntry>>> {
    let mut backoff = retry.backoff();
    loop {
        match source.next_batch().await {
            Err(err) if err.kind() == ErrorKind::SourceUnavailable => {
                let Some(delay) = backoff.next_delay() else {
                    return Err(err);
                };
                tracing::warn!(
                    tenant = %tenant_id,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Source read failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
