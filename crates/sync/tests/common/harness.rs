//! A wired-up orchestrator over an in-memory store and in-memory sources.

use std::sync::Arc;

use helios_sync::backends::sqlite::SqliteStore;
use helios_sync::core::{ResourceStore, TenantDirectory, WatermarkStore};
use helios_sync::mapping::DescriptorRegistry;
use helios_sync::source::{MemorySourceDatabase, MemoryTenantConnector};
use helios_sync::sync::{RetryConfig, SyncConfig, SyncOrchestrator};
use helios_sync::tenant::{Tenant, TenantId};
use helios_sync::types::{CanonicalResource, ChangePosition, NaturalKey, ResourceType, Watermark};

use super::fixtures::{encounter_descriptor, observation_descriptor, patient_descriptor};

/// Store, sources, descriptors and the orchestrator over them.
pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub connector: Arc<MemoryTenantConnector>,
    pub registry: Arc<DescriptorRegistry>,
    pub orchestrator: SyncOrchestrator,
}

/// Default configuration with retries fast enough for tests.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        retry: RetryConfig {
            max_retries: 3,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            backoff_multiplier: 2.0,
        },
        ..SyncConfig::default()
    }
}

impl Harness {
    /// Creates a harness with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a harness with a custom configuration.
    pub fn with_config(config: SyncConfig) -> Self {
        let store = Arc::new(SqliteStore::in_memory().expect("in-memory store"));
        store.init_schema().expect("schema");
        let connector = Arc::new(MemoryTenantConnector::new());
        let registry = Arc::new(DescriptorRegistry::new());
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            connector.clone(),
            registry.clone(),
            config,
        );
        Self {
            store,
            connector,
            registry,
            orchestrator,
        }
    }

    /// Onboards a tenant with a fresh source database and the Patient,
    /// Encounter and Observation descriptors.
    pub async fn add_tenant(&self, id: &str) -> Arc<MemorySourceDatabase> {
        self.store
            .onboard(&Tenant::new(id, format!("Hospital {id}")))
            .await
            .expect("onboard");
        let db = Arc::new(MemorySourceDatabase::new());
        self.connector.register(TenantId::new(id), db.clone());
        for descriptor in [
            patient_descriptor(id),
            encounter_descriptor(id),
            observation_descriptor(id),
        ] {
            self.registry.register(descriptor).expect("valid descriptor");
        }
        db
    }

    /// Looks up a canonical resource by natural key.
    pub async fn resource(
        &self,
        tenant: &str,
        resource_type: ResourceType,
        source_id: &str,
    ) -> Option<CanonicalResource> {
        self.store
            .find(&NaturalKey::new(tenant, resource_type, source_id))
            .await
            .expect("find")
    }

    /// Returns the stored watermark.
    pub async fn watermark(&self, tenant: &str, resource_type: ResourceType) -> Watermark {
        self.store
            .get_watermark(&TenantId::new(tenant), resource_type)
            .await
            .expect("watermark")
    }

    /// Returns the stored watermark position.
    pub async fn position(&self, tenant: &str, resource_type: ResourceType) -> ChangePosition {
        self.watermark(tenant, resource_type).await.position
    }

    /// Counts a tenant's canonical resources.
    pub async fn count(&self, tenant: &str, resource_type: Option<ResourceType>) -> u64 {
        self.store
            .count(&TenantId::new(tenant), resource_type)
            .await
            .expect("count")
    }
}
