//! Descriptor registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::tenant::TenantId;
use crate::types::ResourceType;

use super::descriptor::MappingDescriptor;

/// Holds the active descriptor per (tenant, resource type).
///
/// Descriptors are validated on registration; a later registration for the
/// same pair replaces the earlier one.
#[derive(Default)]
pub struct DescriptorRegistry {
    descriptors: RwLock<HashMap<(TenantId, ResourceType), Arc<MappingDescriptor>>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorFile {
    Many(Vec<MappingDescriptor>),
    One(Box<MappingDescriptor>),
}

impl DescriptorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a descriptor.
    pub fn register(&self, descriptor: MappingDescriptor) -> Result<(), ConfigError> {
        descriptor.validate()?;
        let key = (descriptor.tenant_id.clone(), descriptor.resource_type);
        tracing::debug!(
            tenant = %key.0,
            resource_type = %key.1,
            table = %descriptor.source_table,
            "Registered mapping descriptor"
        );
        self.descriptors.write().insert(key, Arc::new(descriptor));
        Ok(())
    }

    /// Returns the descriptor for the pair.
    ///
    /// # Errors
    ///
    /// `ConfigError::ConfigurationMissing` when none is registered.
    pub fn get(
        &self,
        tenant_id: &TenantId,
        resource_type: ResourceType,
    ) -> Result<Arc<MappingDescriptor>, ConfigError> {
        self.descriptors
            .read()
            .get(&(tenant_id.clone(), resource_type))
            .cloned()
            .ok_or_else(|| ConfigError::ConfigurationMissing {
                tenant_id: tenant_id.clone(),
                resource_type,
            })
    }

    /// Removes the descriptor for the pair, returning it.
    pub fn remove(
        &self,
        tenant_id: &TenantId,
        resource_type: ResourceType,
    ) -> Option<Arc<MappingDescriptor>> {
        self.descriptors
            .write()
            .remove(&(tenant_id.clone(), resource_type))
    }

    /// Resource types with a descriptor for the tenant, in tier order.
    pub fn resource_types(&self, tenant_id: &TenantId) -> Vec<ResourceType> {
        let mut types: Vec<ResourceType> = self
            .descriptors
            .read()
            .keys()
            .filter(|(tenant, _)| tenant == tenant_id)
            .map(|(_, resource_type)| *resource_type)
            .collect();
        types.sort_by_key(|rt| (rt.tier(), *rt));
        types
    }

    /// Every registered pair, sorted.
    pub fn pairs(&self) -> Vec<(TenantId, ResourceType)> {
        let mut pairs: Vec<_> = self.descriptors.read().keys().cloned().collect();
        pairs.sort();
        pairs
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.read().len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.read().is_empty()
    }

    /// Loads every `*.json` file in `dir`, in file-name order.
    ///
    /// A file holds one descriptor or an array of them. Returns how many
    /// descriptors were registered. Loading stops at the first bad file;
    /// descriptors from earlier files stay registered.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize, ConfigError> {
        let dir = dir.as_ref();
        let load_failed = |path: &Path, message: String| ConfigError::LoadFailed {
            path: path.display().to_string(),
            message,
        };

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| load_failed(dir, e.to_string()))? {
            let path = entry.map_err(|e| load_failed(dir, e.to_string()))?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();

        let mut loaded = 0;
        for path in files {
            let text =
                std::fs::read_to_string(&path).map_err(|e| load_failed(&path, e.to_string()))?;
            let descriptors = match serde_json::from_str::<DescriptorFile>(&text)
                .map_err(|e| load_failed(&path, e.to_string()))?
            {
                DescriptorFile::Many(many) => many,
                DescriptorFile::One(one) => vec![*one],
            };
            for descriptor in descriptors {
                self.register(descriptor)
                    .map_err(|e| load_failed(&path, e.to_string()))?;
                loaded += 1;
            }
        }

        tracing::info!(dir = %dir.display(), loaded, "Loaded mapping descriptors");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patient(tenant: &str) -> serde_json::Value {
        json!({
            "tenant_id": tenant,
            "resource_type": "Patient",
            "source_table": "patients",
            "source_id_column": "patient_id",
            "fields": [
                {"target": "gender", "transform": {"kind": "direct_copy", "column": "gender"}}
            ]
        })
    }

    fn encounter(tenant: &str) -> serde_json::Value {
        json!({
            "tenant_id": tenant,
            "resource_type": "Encounter",
            "source_table": "admissions",
            "source_id_column": "admission_id",
            "fields": [
                {"target": "subject",
                 "transform": {"kind": "reference", "column": "patient_id", "target_type": "Patient"}}
            ]
        })
    }

    #[test]
    fn test_register_and_get() {
        let registry = DescriptorRegistry::new();
        let t1 = TenantId::new("t1");

        let err = registry.get(&t1, ResourceType::Patient).unwrap_err();
        assert!(matches!(err, ConfigError::ConfigurationMissing { .. }));

        registry
            .register(serde_json::from_value(patient("t1")).unwrap())
            .unwrap();
        registry
            .register(serde_json::from_value(encounter("t1")).unwrap())
            .unwrap();

        assert_eq!(
            registry.get(&t1, ResourceType::Patient).unwrap().source_table,
            "patients"
        );
        assert_eq!(
            registry.resource_types(&t1),
            vec![ResourceType::Patient, ResourceType::Encounter]
        );
        assert!(registry.resource_types(&TenantId::new("t2")).is_empty());

        assert!(registry.remove(&t1, ResourceType::Patient).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_invalid() {
        let registry = DescriptorRegistry::new();
        let mut bad = encounter("t1");
        bad["fields"] = json!([]);
        let err = registry
            .register(serde_json::from_value(bad).unwrap())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDescriptor { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a-patients.json"),
            patient("t1").to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b-more.json"),
            json!([encounter("t1"), patient("t2")]).to_string(),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = DescriptorRegistry::new();
        assert_eq!(registry.load_dir(dir.path()).unwrap(), 3);
        assert_eq!(registry.pairs().len(), 3);
    }

    #[test]
    fn test_load_dir_reports_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

        let err = DescriptorRegistry::new().load_dir(dir.path()).unwrap_err();
        match err {
            ConfigError::LoadFailed { path, .. } => assert!(path.ends_with("broken.json")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
