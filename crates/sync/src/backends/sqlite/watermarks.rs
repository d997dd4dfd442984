//! [`WatermarkStore`] for SQLite: watermarks and run leases.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, TransactionBehavior, params};

use crate::core::WatermarkStore;
use crate::error::{LeaseError, SyncError, SyncResult};
use crate::tenant::TenantId;
use crate::types::{ChangePosition, Lease, ResourceType, SyncOutcome, Watermark};

use super::SqliteStore;
use super::backend::{format_timestamp, from_sql_int, parse_timestamp, to_sql_int};

#[async_trait]
impl WatermarkStore for SqliteStore {
    async fn get_watermark(
        &self,
        tenant_id: &TenantId,
        resource_type: ResourceType,
    ) -> SyncResult<Watermark> {
        let conn = self.get_connection()?;
        let watermark = conn
            .query_row(
                "SELECT position, last_outcome, updated_at FROM watermarks
                 WHERE tenant_id = ?1 AND resource_type = ?2",
                params![tenant_id.as_str(), resource_type.as_str()],
                |row| read_watermark(row, tenant_id, resource_type),
            )
            .optional()?;
        Ok(watermark.unwrap_or_else(|| Watermark::origin(tenant_id.clone(), resource_type)))
    }

    async fn advance_watermark(
        &self,
        tenant_id: &TenantId,
        resource_type: ResourceType,
        position: ChangePosition,
        outcome: Option<SyncOutcome>,
    ) -> SyncResult<Watermark> {
        let conn = self.get_connection()?;
        let watermark = conn.query_row(
            "INSERT INTO watermarks (tenant_id, resource_type, position, last_outcome, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tenant_id, resource_type) DO UPDATE SET
                position = MAX(watermarks.position, excluded.position),
                last_outcome = COALESCE(excluded.last_outcome, watermarks.last_outcome),
                updated_at = excluded.updated_at
             RETURNING position, last_outcome, updated_at",
            params![
                tenant_id.as_str(),
                resource_type.as_str(),
                to_sql_int(position.value()),
                outcome.map(|o| o.as_str()),
                format_timestamp(Utc::now())
            ],
            |row| read_watermark(row, tenant_id, resource_type),
        )?;

        tracing::debug!(
            tenant = %tenant_id,
            resource_type = %resource_type,
            position = %watermark.position,
            "Advanced watermark"
        );
        Ok(watermark)
    }

    async fn acquire_lease(
        &self,
        tenant_id: &TenantId,
        resource_type: ResourceType,
        holder: &str,
        ttl: Duration,
    ) -> SyncResult<Lease> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let current: Option<(String, String)> = tx
            .query_row(
                "SELECT holder, expires_at FROM sync_leases
                 WHERE tenant_id = ?1 AND resource_type = ?2",
                params![tenant_id.as_str(), resource_type.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((current_holder, expires_at)) = current {
            let expired = parse_timestamp(1, &expires_at)? <= now;
            if current_holder != holder && !expired {
                return Err(SyncError::Lease(LeaseError::AlreadyRunning {
                    tenant_id: tenant_id.clone(),
                    resource_type,
                    holder: current_holder,
                }));
            }
            if expired && current_holder != holder {
                tracing::warn!(
                    tenant = %tenant_id,
                    resource_type = %resource_type,
                    previous = %current_holder,
                    "Taking over expired sync lease"
                );
            }
        }

        let lease = Lease {
            tenant_id: tenant_id.clone(),
            resource_type,
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + ttl_delta(ttl),
        };
        tx.execute(
            "INSERT OR REPLACE INTO sync_leases
                (tenant_id, resource_type, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tenant_id.as_str(),
                resource_type.as_str(),
                lease.holder,
                format_timestamp(lease.acquired_at),
                format_timestamp(lease.expires_at)
            ],
        )?;
        tx.commit()?;

        Ok(lease)
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> SyncResult<Lease> {
        let conn = self.get_connection()?;
        let expires_at = Utc::now() + ttl_delta(ttl);
        let updated = conn.execute(
            "UPDATE sync_leases SET expires_at = ?1
             WHERE tenant_id = ?2 AND resource_type = ?3 AND holder = ?4",
            params![
                format_timestamp(expires_at),
                lease.tenant_id.as_str(),
                lease.resource_type.as_str(),
                lease.holder
            ],
        )?;

        if updated == 0 {
            return Err(SyncError::Lease(LeaseError::Lost {
                tenant_id: lease.tenant_id.clone(),
                resource_type: lease.resource_type,
            }));
        }

        Ok(Lease {
            expires_at,
            ..lease.clone()
        })
    }

    async fn release_lease(&self, lease: &Lease) -> SyncResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "DELETE FROM sync_leases
             WHERE tenant_id = ?1 AND resource_type = ?2 AND holder = ?3",
            params![
                lease.tenant_id.as_str(),
                lease.resource_type.as_str(),
                lease.holder
            ],
        )?;
        Ok(())
    }
}

fn read_watermark(
    row: &rusqlite::Row<'_>,
    tenant_id: &TenantId,
    resource_type: ResourceType,
) -> rusqlite::Result<Watermark> {
    let position: i64 = row.get(0)?;
    let last_outcome: Option<String> = row.get(1)?;
    let updated_at: String = row.get(2)?;
    Ok(Watermark {
        tenant_id: tenant_id.clone(),
        resource_type,
        position: ChangePosition::new(from_sql_int(position)),
        last_outcome: last_outcome.as_deref().and_then(SyncOutcome::parse),
        updated_at: parse_timestamp(2, &updated_at)?,
    })
}

fn ttl_delta(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
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
    async fn test_watermark_starts_at_origin() {
        let store = store();
        let wm = store
            .get_watermark(&TenantId::new("t1"), ResourceType::Patient)
            .await
            .unwrap();
        assert!(wm.position.is_origin());
        assert_eq!(wm.last_outcome, None);
    }

    #[tokio::test]
    async fn test_watermark_never_moves_backwards() {
        let store = store();
        let t1 = TenantId::new("t1");

        store
            .advance_watermark(&t1, ResourceType::Patient, ChangePosition::new(5), None)
            .await
            .unwrap();
        let wm = store
            .advance_watermark(
                &t1,
                ResourceType::Patient,
                ChangePosition::new(3),
                Some(SyncOutcome::PartiallySucceeded),
            )
            .await
            .unwrap();
        assert_eq!(wm.position, ChangePosition::new(5));
        assert_eq!(wm.last_outcome, Some(SyncOutcome::PartiallySucceeded));

        // A None outcome keeps the last one.
        let wm = store
            .advance_watermark(&t1, ResourceType::Patient, ChangePosition::new(9), None)
            .await
            .unwrap();
        assert_eq!(wm.position, ChangePosition::new(9));
        assert_eq!(wm.last_outcome, Some(SyncOutcome::PartiallySucceeded));

        // Other keys are untouched.
        let other = store
            .get_watermark(&t1, ResourceType::Encounter)
            .await
            .unwrap();
        assert!(other.position.is_origin());
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let store = store();
        let t1 = TenantId::new("t1");
        let ttl = Duration::from_secs(60);

        let lease = store
            .acquire_lease(&t1, ResourceType::Patient, "run-a", ttl)
            .await
            .unwrap();

        let err = store
            .acquire_lease(&t1, ResourceType::Patient, "run-b", ttl)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

        // Different key, different lease.
        store
            .acquire_lease(&t1, ResourceType::Encounter, "run-b", ttl)
            .await
            .unwrap();

        store.release_lease(&lease).await.unwrap();
        store
            .acquire_lease(&t1, ResourceType::Patient, "run-b", ttl)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let store = store();
        let t1 = TenantId::new("t1");

        let stale = store
            .acquire_lease(&t1, ResourceType::Patient, "run-a", Duration::ZERO)
            .await
            .unwrap();
        let fresh = store
            .acquire_lease(&t1, ResourceType::Patient, "run-b", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(fresh.holder, "run-b");

        let err = store
            .renew_lease(&stale, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseLost);

        // Releasing the stale lease does not drop the new holder's lease.
        store.release_lease(&stale).await.unwrap();
        let renewed = store
            .renew_lease(&fresh, Duration::from_secs(120))
            .await
            .unwrap();
        assert!(renewed.expires_at > fresh.expires_at);
    }
}
