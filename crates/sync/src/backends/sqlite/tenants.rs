//! [`TenantDirectory`] for SQLite.

use async_trait::async_trait;
use rusqlite::{OptionalExtension, Row, params};

use crate::core::TenantDirectory;
use crate::error::{SyncError, SyncResult, TenantError};
use crate::tenant::{Tenant, TenantId};

use super::SqliteStore;
use super::backend::{format_timestamp, parse_timestamp};

#[async_trait]
impl TenantDirectory for SqliteStore {
    async fn onboard(&self, tenant: &Tenant) -> SyncResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO tenants (id, display_name, active, onboarded_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                active = excluded.active",
            params![
                tenant.id.as_str(),
                tenant.display_name,
                tenant.active,
                format_timestamp(tenant.onboarded_at)
            ],
        )?;
        tracing::info!(tenant = %tenant.id, active = tenant.active, "Onboarded tenant");
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: &TenantId) -> SyncResult<Option<Tenant>> {
        let conn = self.get_connection()?;
        let tenant = conn
            .query_row(
                "SELECT id, display_name, active, onboarded_at FROM tenants WHERE id = ?1",
                [tenant_id.as_str()],
                read_tenant,
            )
            .optional()?;
        Ok(tenant)
    }

    async fn list_tenants(&self, active_only: bool) -> SyncResult<Vec<Tenant>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, display_name, active, onboarded_at FROM tenants
             WHERE (?1 = 0 OR active = 1)
             ORDER BY id",
        )?;
        let tenants = stmt
            .query_map([active_only], read_tenant)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tenants)
    }

    async fn deactivate_tenant(&self, tenant_id: &TenantId) -> SyncResult<()> {
        let conn = self.get_connection()?;
        let updated = conn.execute("UPDATE tenants SET active = 0 WHERE id = ?1", [
            tenant_id.as_str(),
        ])?;
        if updated == 0 {
            return Err(SyncError::Tenant(TenantError::Unknown {
                tenant_id: tenant_id.clone(),
            }));
        }
        tracing::info!(tenant = %tenant_id, "Deactivated tenant");
        Ok(())
    }
}

fn read_tenant(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    let id: String = row.get(0)?;
    let onboarded_at: String = row.get(3)?;
    Ok(Tenant {
        id: TenantId::new(id),
        display_name: row.get(1)?,
        active: row.get(2)?,
        onboarded_at: parse_timestamp(3, &onboarded_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.init_schema().unwrap();
        store
    }

    #[tokio::test]
    async fn test_onboard_and_deactivate() {
        let store = store();
        let t1 = Tenant::new("t1", "General Hospital");
        store.onboard(&t1).await.unwrap();
        store.onboard(&Tenant::new("t2", "City Clinic")).await.unwrap();

        let found = store.get_tenant(&t1.id).await.unwrap().unwrap();
        assert_eq!(found.display_name, "General Hospital");
        assert!(found.active);

        store.deactivate_tenant(&t1.id).await.unwrap();
        assert!(!store.get_tenant(&t1.id).await.unwrap().unwrap().active);

        let active: Vec<_> = store
            .list_tenants(true)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id.to_string())
            .collect();
        assert_eq!(active, vec!["t2"]);
        assert_eq!(store.list_tenants(false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_onboard_updates_existing() {
        let store = store();
        let original = Tenant::new("t1", "General");
        store.onboard(&original).await.unwrap();
        store
            .onboard(&Tenant::new("t1", "General Hospital"))
            .await
            .unwrap();

        let found = store.get_tenant(&original.id).await.unwrap().unwrap();
        assert_eq!(found.display_name, "General Hospital");
        assert_eq!(
            found.onboarded_at.timestamp_micros(),
            original.onboarded_at.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn test_deactivate_unknown_tenant() {
        let err = store()
            .deactivate_tenant(&TenantId::new("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TenantUnavailable);
    }
}
