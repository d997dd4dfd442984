//! Tenant list loading.
//!
//! The tenants file is a JSON array:
//!
//! ```json
//! [
//!   {"id": "general", "display_name": "General Hospital", "source": "general.db"},
//!   {"id": "st-mary", "display_name": "St. Mary's", "source": "st-mary.db", "active": false}
//! ]
//! ```
//!
//! Relative `source` paths resolve against the tenants file's directory.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use helios_sync::core::TenantDirectory;
use helios_sync::source::SqliteTenantConnector;
use helios_sync::tenant::{Tenant, TenantId};

/// One hospital and where its source database lives.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantEntry {
    pub id: TenantId,
    pub display_name: String,
    pub source: PathBuf,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl TenantEntry {
    fn to_tenant(&self) -> Tenant {
        let tenant = Tenant::new(self.id.clone(), self.display_name.clone());
        if self.active {
            tenant
        } else {
            tenant.deactivated()
        }
    }
}

/// Reads the tenants file, resolving source paths.
pub fn load_tenants(path: &Path) -> anyhow::Result<Vec<TenantEntry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading tenants file {}", path.display()))?;
    let mut entries: Vec<TenantEntry> = serde_json::from_str(&text)
        .with_context(|| format!("parsing tenants file {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for entry in &mut entries {
        if entry.source.is_relative() {
            entry.source = base.join(&entry.source);
        }
    }

    let mut seen = std::collections::HashSet::new();
    for entry in &entries {
        anyhow::ensure!(
            seen.insert(entry.id.clone()),
            "tenant '{}' is listed twice in {}",
            entry.id,
            path.display()
        );
    }
    Ok(entries)
}

/// Onboards every entry and registers its source with the connector.
pub async fn register_tenants(
    entries: &[TenantEntry],
    directory: &dyn TenantDirectory,
    connector: &SqliteTenantConnector,
) -> anyhow::Result<()> {
    for entry in entries {
        directory
            .onboard(&entry.to_tenant())
            .await
            .with_context(|| format!("onboarding tenant '{}'", entry.id))?;
        connector.register(entry.id.clone(), &entry.source);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(content.as_bytes())
            .unwrap();
        path
    }

    #[test]
    fn test_load_resolves_relative_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "tenants.json",
            r#"[
                {"id": "general", "display_name": "General", "source": "general.db"},
                {"id": "north", "display_name": "North", "source": "/data/north.db", "active": false}
            ]"#,
        );

        let entries = load_tenants(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].source, dir.path().join("general.db"));
        assert!(entries[0].active);
        assert_eq!(entries[1].source, PathBuf::from("/data/north.db"));
        assert!(!entries[1].to_tenant().active);
    }

    #[test]
    fn test_duplicate_tenant_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "tenants.json",
            r#"[
                {"id": "general", "display_name": "General", "source": "a.db"},
                {"id": "general", "display_name": "Again", "source": "b.db"}
            ]"#,
        );

        let err = load_tenants(&path).unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn test_missing_file_names_the_path() {
        let err = load_tenants(Path::new("/nonexistent/tenants.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/tenants.json"));
    }
}
