//! The Sync Orchestrator: run control, tenant passes and status.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{DynSyncStore, TenantConnector};
use crate::error::{
    BackendError, ErrorKind, LeaseError, RunError, SyncError, SyncResult, TenantError,
};
use crate::mapping::DescriptorRegistry;
use crate::tenant::{Tenant, TenantId};
use crate::types::{Lease, ResourceType, RunFailure, SyncMode, SyncOutcome, SyncRunRecord};

use super::config::SyncConfig;
use super::runner::{self, RunPlan};
use super::tracker::RunTracker;

/// Drives sync runs for every (tenant, resource type) pair.
///
/// At most one run per pair executes at a time. Within one orchestrator the
/// in-flight runs are checked first; across processes sharing a store, a
/// lease in the store is held and kept alive for the whole run, including
/// while it waits for a worker.
/// Runs across pairs execute concurrently, bounded by
/// [`SyncConfig::worker_pool_size`].
///
/// Cloning is cheap; clones share the worker pool and in-flight runs.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: DynSyncStore,
    connector: Arc<dyn TenantConnector>,
    registry: Arc<DescriptorRegistry>,
    config: SyncConfig,
    workers: Arc<Semaphore>,
    in_flight: Mutex<HashMap<String, Arc<RunTracker>>>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("backend", &self.inner.store.backend_name())
            .field("descriptors", &self.inner.registry.len())
            .field("in_flight", &self.inner.in_flight.lock().len())
            .finish()
    }
}

impl SyncOrchestrator {
    /// Creates an orchestrator over a store, a source connector and a set of
    /// mapping descriptors.
    pub fn new(
        store: DynSyncStore,
        connector: Arc<dyn TenantConnector>,
        registry: Arc<DescriptorRegistry>,
        config: SyncConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            inner: Arc::new(Inner {
                store,
                connector,
                registry,
                config,
                workers,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Returns the descriptor registry.
    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.inner.registry
    }

    /// Returns the shared store.
    pub fn store(&self) -> &DynSyncStore {
        &self.inner.store
    }

    /// Runs one sync for a (tenant, resource type) pair to completion.
    ///
    /// Returns the finished run record, which has already been appended to
    /// the ledger. A run that fails after it started is still `Ok`: the
    /// failure is in the record's outcome and error.
    ///
    /// # Errors
    ///
    /// Rejections before a run starts, none of which write a run record:
    ///
    /// * `TenantError::Unknown` / `TenantError::Inactive`
    /// * `ConfigError::ConfigurationMissing` - no descriptor for the pair
    /// * `LeaseError::AlreadyRunning` - another run holds the pair
    pub async fn run_sync(
        &self,
        tenant_id: &TenantId,
        resource_type: ResourceType,
        mode: SyncMode,
    ) -> SyncResult<SyncRunRecord> {
        self.spawn_sync(tenant_id, resource_type, mode)
            .await?
            .wait()
            .await
    }

    /// Starts a sync run in the background and returns a handle to it.
    ///
    /// Pre-run checks and lease acquisition happen before this returns, so
    /// the same rejections as [`run_sync`](Self::run_sync) apply.
    pub async fn spawn_sync(
        &self,
        tenant_id: &TenantId,
        resource_type: ResourceType,
        mode: SyncMode,
    ) -> SyncResult<RunHandle> {
        let inner = &self.inner;
        let tenant = self.active_tenant(tenant_id).await?;
        let descriptor = inner.registry.get(tenant_id, resource_type)?;
        self.check_not_in_flight(tenant_id, resource_type)?;

        let run_id = Uuid::new_v4().to_string();
        let lease = inner
            .store
            .acquire_lease(tenant_id, resource_type, &run_id, inner.config.lease_ttl())
            .await?;

        let watermark = match inner.store.get_watermark(tenant_id, resource_type).await {
            Ok(watermark) => watermark,
            Err(e) => {
                if let Err(release_err) = inner.store.release_lease(&lease).await {
                    warn!(run_id = %run_id, error = %release_err, "Failed to release lease");
                }
                return Err(e);
            }
        };

        let record = SyncRunRecord::started(
            run_id.clone(),
            tenant_id.clone(),
            resource_type,
            mode,
            watermark.position,
        );
        let tracker = Arc::new(RunTracker::new(record, inner.config.max_row_errors));
        inner
            .in_flight
            .lock()
            .insert(run_id.clone(), Arc::clone(&tracker));

        info!(
            tenant = %tenant_id,
            resource_type = %resource_type,
            run_id = %run_id,
            mode = %mode,
            watermark = %watermark.position,
            "Sync run started"
        );

        let plan = RunPlan {
            tenant,
            descriptor,
            mode,
            start: watermark.position,
            lease,
        };
        let task_inner = Arc::clone(inner);
        let task_tracker = Arc::clone(&tracker);
        let task = tokio::spawn(async move { task_inner.drive(plan, task_tracker).await });

        Ok(RunHandle { tracker, task })
    }

    /// Requests cancellation of an in-flight run.
    ///
    /// The run stops before its next batch. Returns `false` if no run with
    /// this id is in flight.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.inner.in_flight.lock().get(run_id) {
            Some(tracker) => {
                tracker.cancel();
                true
            }
            None => false,
        }
    }

    /// Returns run records for a tenant, newest first.
    ///
    /// In-flight runs come first with their live counters, followed by
    /// finished runs from the ledger.
    pub async fn sync_status(
        &self,
        tenant_id: &TenantId,
        resource_type: Option<ResourceType>,
    ) -> SyncResult<Vec<SyncRunRecord>> {
        let mut records: Vec<SyncRunRecord> = self
            .inner
            .in_flight
            .lock()
            .values()
            .map(|tracker| tracker.snapshot())
            .filter(|record| {
                &record.tenant_id == tenant_id
                    && resource_type.is_none_or(|rt| record.resource_type == rt)
            })
            .collect();
        records.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });

        let live: HashSet<String> = records.iter().map(|r| r.run_id.clone()).collect();
        let finished = self
            .inner
            .store
            .list_runs(tenant_id, resource_type, self.inner.config.status_limit)
            .await?;
        records.extend(finished.into_iter().filter(|r| !live.contains(&r.run_id)));

        Ok(records)
    }

    /// Syncs every configured resource type of one tenant.
    ///
    /// Resource types run tier by tier so that referenced resources land
    /// before the ones pointing at them; types within a tier run
    /// concurrently. A failed or rejected type does not stop later tiers.
    pub async fn sync_tenant(
        &self,
        tenant_id: &TenantId,
        mode: SyncMode,
    ) -> SyncResult<TenantSyncReport> {
        self.active_tenant(tenant_id).await?;
        let configured = self.inner.registry.resource_types(tenant_id);
        let mut report = TenantSyncReport::new(tenant_id.clone());

        for tier in ResourceType::tiers() {
            let mut runs = JoinSet::new();
            for resource_type in tier.into_iter().filter(|rt| configured.contains(rt)) {
                let this = self.clone();
                let tenant_id = tenant_id.clone();
                runs.spawn(async move {
                    let result = this.run_sync(&tenant_id, resource_type, mode).await;
                    (resource_type, result)
                });
            }

            while let Some(joined) = runs.join_next().await {
                let (resource_type, result) = joined.map_err(|e| join_error(&e))?;
                match result {
                    Ok(record) => report.runs.push(record),
                    Err(e) => {
                        warn!(
                            tenant = %tenant_id,
                            resource_type = %resource_type,
                            error = %e,
                            "Sync run rejected"
                        );
                        report.rejected.push((resource_type, e));
                    }
                }
            }
        }

        report
            .runs
            .sort_by_key(|r| (r.resource_type.tier(), r.resource_type));
        report
            .rejected
            .sort_by_key(|(rt, _)| (rt.tier(), *rt));
        Ok(report)
    }

    /// Syncs every active tenant concurrently.
    ///
    /// A tenant that cannot be synced at all is logged and left out of the
    /// result.
    pub async fn sync_all(&self, mode: SyncMode) -> SyncResult<Vec<TenantSyncReport>> {
        let tenants = self.inner.store.list_tenants(true).await?;
        debug!(tenants = tenants.len(), mode = %mode, "Starting sync pass");

        let mut passes = JoinSet::new();
        for tenant in tenants {
            let this = self.clone();
            passes.spawn(async move {
                let result = this.sync_tenant(&tenant.id, mode).await;
                (tenant.id, result)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = passes.join_next().await {
            let (tenant_id, result) = joined.map_err(|e| join_error(&e))?;
            match result {
                Ok(report) => reports.push(report),
                Err(e) => warn!(tenant = %tenant_id, error = %e, "Tenant sync skipped"),
            }
        }
        reports.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(reports)
    }

    fn check_not_in_flight(
        &self,
        tenant_id: &TenantId,
        resource_type: ResourceType,
    ) -> SyncResult<()> {
        let in_flight = self.inner.in_flight.lock();
        let running = in_flight.values().map(|tracker| tracker.snapshot()).find(|record| {
            &record.tenant_id == tenant_id && record.resource_type == resource_type
        });
        match running {
            Some(record) => Err(LeaseError::AlreadyRunning {
                tenant_id: tenant_id.clone(),
                resource_type,
                holder: record.run_id,
            }
            .into()),
            None => Ok(()),
        }
    }

    async fn active_tenant(&self, tenant_id: &TenantId) -> SyncResult<Tenant> {
        match self.inner.store.get_tenant(tenant_id).await? {
            None => Err(TenantError::Unknown {
                tenant_id: tenant_id.clone(),
            }
            .into()),
            Some(tenant) if !tenant.active => Err(TenantError::Inactive {
                tenant_id: tenant_id.clone(),
            }
            .into()),
            Some(tenant) => Ok(tenant),
        }
    }
}

impl Inner {
    /// Executes a started run and persists its terminal record.
    async fn drive(
        self: Arc<Self>,
        plan: RunPlan,
        tracker: Arc<RunTracker>,
    ) -> SyncResult<SyncRunRecord> {
        let heartbeat = tokio::spawn(keep_lease_alive(
            Arc::clone(&self.store),
            plan.lease.clone(),
            self.config.lease_ttl(),
        ));

        let result = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(_permit) => {
                let timeout = self.config.run_timeout();
                let body = runner::execute(
                    &self.store,
                    self.connector.as_ref(),
                    &self.config,
                    &plan,
                    &tracker,
                );
                match tokio::time::timeout(timeout, body).await {
                    Ok(result) => result,
                    Err(_) => Err(RunError::TimedOut {
                        timeout_ms: self.config.run_timeout_ms,
                    }
                    .into()),
                }
            }
            Err(_) => Err(BackendError::Unavailable {
                backend_name: "worker-pool".to_string(),
                message: "worker pool closed".to_string(),
            }
            .into()),
        };

        let (outcome, failure) = match result {
            Ok(()) => classify(&tracker),
            Err(e) => (SyncOutcome::Failed, Some(RunFailure::from(&e))),
        };
        let record = tracker.finish(outcome, failure);

        heartbeat.abort();
        let persisted = self.persist(&record).await;
        if let Err(e) = self.store.release_lease(&plan.lease).await {
            warn!(run_id = %record.run_id, error = %e, "Failed to release lease");
        }
        self.in_flight.lock().remove(&record.run_id);

        info!(
            tenant = %record.tenant_id,
            resource_type = %record.resource_type,
            run_id = %record.run_id,
            outcome = %outcome,
            examined = record.records_examined,
            applied = record.records_applied,
            row_errors = record.row_error_count(),
            watermark = %record.watermark_after,
            "Sync run finished"
        );

        persisted?;
        Ok(record)
    }

    async fn persist(&self, record: &SyncRunRecord) -> SyncResult<()> {
        self.store
            .advance_watermark(
                &record.tenant_id,
                record.resource_type,
                record.watermark_after,
                record.outcome(),
            )
            .await?;
        self.store.append_run(record).await
    }
}

/// Renews a run's lease every third of its TTL until aborted.
///
/// Starts before the run waits for a worker, so a queued run keeps its key.
/// Stops once the lease is lost; the run notices on its next renewal.
async fn keep_lease_alive(store: DynSyncStore, lease: Lease, ttl: Duration) {
    let period = (ttl / 3).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match store.renew_lease(&lease, ttl).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::LeaseLost => {
                warn!(run_id = %lease.holder, "Sync lease lost");
                break;
            }
            Err(e) => warn!(run_id = %lease.holder, error = %e, "Sync lease renewal failed"),
        }
    }
}

/// Outcome of a run whose body completed.
///
/// A run in which no row was written is `Failed` even when the failures were
/// row-level (dangling references, mapping errors): `PartiallySucceeded`
/// needs at least one applied row. Status consumers read the row errors for
/// the individual causes.
fn classify(tracker: &RunTracker) -> (SyncOutcome, Option<RunFailure>) {
    let (examined, applied, failures) = tracker.counts();
    if failures == 0 {
        (SyncOutcome::Succeeded, None)
    } else if applied == 0 {
        let err = SyncError::Run(RunError::AllRowsRejected { examined });
        (SyncOutcome::Failed, Some(RunFailure::from(&err)))
    } else {
        (SyncOutcome::PartiallySucceeded, None)
    }
}

fn join_error(err: &tokio::task::JoinError) -> SyncError {
    SyncError::Backend(BackendError::Internal {
        backend_name: "orchestrator".to_string(),
        message: format!("sync task failed: {err}"),
        source: None,
    })
}

/// A handle on a run started with [`SyncOrchestrator::spawn_sync`].
#[derive(Debug)]
pub struct RunHandle {
    tracker: Arc<RunTracker>,
    task: JoinHandle<SyncResult<SyncRunRecord>>,
}

impl RunHandle {
    /// Returns the run id.
    pub fn run_id(&self) -> String {
        self.tracker.run_id()
    }

    /// Returns a snapshot of the run record with its live counters.
    pub fn status(&self) -> SyncRunRecord {
        self.tracker.snapshot()
    }

    /// Requests cancellation. The run stops before its next batch.
    pub fn cancel(&self) {
        self.tracker.cancel();
    }

    /// Returns `true` once the run's record has been persisted.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the run to finish and returns its terminal record.
    pub async fn wait(self) -> SyncResult<SyncRunRecord> {
        self.task.await.map_err(|e| join_error(&e))?
    }
}

/// What a tenant pass did, per resource type.
#[derive(Debug, Serialize)]
pub struct TenantSyncReport {
    /// The tenant synced.
    pub tenant_id: TenantId,
    /// Finished runs, in tier order.
    pub runs: Vec<SyncRunRecord>,
    /// Resource types whose run was rejected before it started.
    #[serde(skip)]
    pub rejected: Vec<(ResourceType, SyncError)>,
}

impl TenantSyncReport {
    fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            runs: Vec::new(),
            rejected: Vec::new(),
        }
    }

    /// Returns `true` if every configured type ran and succeeded.
    pub fn is_success(&self) -> bool {
        self.rejected.is_empty()
            && self
                .runs
                .iter()
                .all(|r| r.outcome() == Some(SyncOutcome::Succeeded))
    }

    /// Total records applied across the pass.
    pub fn records_applied(&self) -> u64 {
        self.runs.iter().map(|r| r.records_applied).sum()
    }

    /// Returns the run for a resource type, if one finished.
    pub fn run(&self, resource_type: ResourceType) -> Option<&SyncRunRecord> {
        self.runs.iter().find(|r| r.resource_type == resource_type)
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::backends::sqlite::SqliteStore;
    use crate::core::{ResourceStore, TenantDirectory, WatermarkStore};
    use crate::error::ErrorKind;
    use crate::mapping::{FieldRule, MappingDescriptor, Transform};
    use crate::source::{MemorySourceDatabase, MemoryTenantConnector};
    use crate::types::{ChangePosition, FieldPath};
    use serde_json::json;

    fn patient_descriptor(tenant: &str) -> MappingDescriptor {
        MappingDescriptor {
            tenant_id: TenantId::new(tenant),
            resource_type: ResourceType::Patient,
            source_table: "patients".to_string(),
            source_id_column: "patient_id".to_string(),
            source_system: "his".to_string(),
            identifier_system: None,
            fields: vec![FieldRule {
                target: FieldPath::parse("gender").unwrap(),
                transform: Transform::DirectCopy {
                    column: "gender".to_string(),
                },
                required: false,
            }],
        }
    }

    async fn setup() -> (SyncOrchestrator, Arc<MemorySourceDatabase>) {
        let store = SqliteStore::in_memory().unwrap();
        store.init_schema().unwrap();
        store.onboard(&Tenant::new("t1", "General")).await.unwrap();

        let db = Arc::new(MemorySourceDatabase::new());
        let connector = MemoryTenantConnector::new();
        connector.register(TenantId::new("t1"), Arc::clone(&db));

        let registry = DescriptorRegistry::new();
        registry.register(patient_descriptor("t1")).unwrap();

        let orchestrator = SyncOrchestrator::new(
            Arc::new(store),
            Arc::new(connector),
            Arc::new(registry),
            SyncConfig::default(),
        );
        (orchestrator, db)
    }

    #[tokio::test]
    async fn test_run_sync_applies_and_records() {
        let (orchestrator, db) = setup().await;
        db.insert("patients", "patient_id", json!({"patient_id": "P100", "gender": "male"}));

        let tenant = TenantId::new("t1");
        let record = orchestrator
            .run_sync(&tenant, ResourceType::Patient, SyncMode::Incremental)
            .await
            .unwrap();

        assert_eq!(record.outcome(), Some(SyncOutcome::Succeeded));
        assert_eq!(record.records_applied, 1);
        assert_eq!(record.watermark_after, ChangePosition::new(1));
        assert_eq!(orchestrator.store().count(&tenant, None).await.unwrap(), 1);

        let status = orchestrator.sync_status(&tenant, None).await.unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].run_id, record.run_id);
        assert_eq!(status[0].outcome(), Some(SyncOutcome::Succeeded));
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_tenants_are_rejected() {
        let (orchestrator, _db) = setup().await;
        let err = orchestrator
            .run_sync(&TenantId::new("nope"), ResourceType::Patient, SyncMode::Full)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TenantUnavailable);

        orchestrator
            .store()
            .deactivate_tenant(&TenantId::new("t1"))
            .await
            .unwrap();
        let err = orchestrator
            .run_sync(&TenantId::new("t1"), ResourceType::Patient, SyncMode::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Tenant(TenantError::Inactive { .. })));
    }

    #[tokio::test]
    async fn test_missing_descriptor_writes_no_record() {
        let (orchestrator, _db) = setup().await;
        let tenant = TenantId::new("t1");
        let err = orchestrator
            .run_sync(&tenant, ResourceType::Encounter, SyncMode::Incremental)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationMissing);
        assert!(orchestrator.sync_status(&tenant, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_held_lease_rejects_second_run() {
        let (orchestrator, _db) = setup().await;
        let tenant = TenantId::new("t1");
        orchestrator
            .store()
            .acquire_lease(
                &tenant,
                ResourceType::Patient,
                "other-process",
                std::time::Duration::from_secs(60),
            )
            .await
            .unwrap();

        let err = orchestrator
            .run_sync(&tenant, ResourceType::Patient, SyncMode::Incremental)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
    }

    #[tokio::test]
    async fn test_unavailable_source_fails_run_after_retries() {
        let (orchestrator, db) = setup().await;
        db.set_available(false);

        let tenant = TenantId::new("t1");
        let record = orchestrator
            .run_sync(&tenant, ResourceType::Patient, SyncMode::Incremental)
            .await
            .unwrap();
        assert_eq!(record.outcome(), Some(SyncOutcome::Failed));
        assert_eq!(
            record.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::SourceUnavailable)
        );

        let watermark = orchestrator
            .store()
            .get_watermark(&tenant, ResourceType::Patient)
            .await
            .unwrap();
        assert!(watermark.position.is_origin());
        assert_eq!(watermark.last_outcome, Some(SyncOutcome::Failed));
    }
}
