//! [`ResourceStore`] for SQLite: the upsert writer.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use serde_json::Value;

use crate::core::ResourceStore;
use crate::error::{SyncError, SyncResult, WriteError};
use crate::tenant::TenantId;
use crate::types::{
    CanonicalDocument, CanonicalResource, NaturalKey, ResourceStatus, ResourceType,
    UpsertOutcome,
};

use super::SqliteStore;
use super::backend::{
    BACKEND_NAME, conversion_error, format_timestamp, from_sql_int, parse_timestamp, to_sql_int,
};

const RESOURCE_COLUMNS: &str = "id, tenant_id, resource_type, source_id, payload, status, \
     source_system, created_at, last_synced_at, version";

/// Existing row state that decides between `Updated` and `Unchanged`.
struct Existing {
    id: String,
    payload: String,
    status: String,
    source_system: String,
}

#[async_trait]
impl ResourceStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn upsert(&self, document: &CanonicalDocument) -> SyncResult<UpsertOutcome> {
        match self.upsert_once(document) {
            Err(SyncError::Write(WriteError::WriteConflict { .. })) => {
                tracing::warn!(key = %document.key, "Write conflict, retrying upsert once");
                self.upsert_once(document)
            }
            other => other,
        }
    }

    async fn deactivate(&self, key: &NaturalKey) -> SyncResult<Option<UpsertOutcome>> {
        let mut conn = self.get_connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| write_error(e, key))?;

        let Some(existing) = find_existing(&tx, key)? else {
            return Ok(None);
        };

        if existing.status == ResourceStatus::Inactive.as_str() {
            return Ok(Some(UpsertOutcome::Unchanged(existing.id)));
        }

        tx.execute(
            "UPDATE canonical_resources
             SET status = ?1, last_synced_at = ?2, version = version + 1
             WHERE id = ?3",
            params![
                ResourceStatus::Inactive.as_str(),
                format_timestamp(Utc::now()),
                existing.id
            ],
        )
        .map_err(|e| write_error(e, key))?;
        tx.commit().map_err(|e| write_error(e, key))?;

        tracing::debug!(key = %key, id = %existing.id, "Deactivated canonical resource");
        Ok(Some(UpsertOutcome::Updated(existing.id)))
    }

    async fn find(&self, key: &NaturalKey) -> SyncResult<Option<CanonicalResource>> {
        let conn = self.get_connection()?;
        let sql = format!(
            "SELECT {RESOURCE_COLUMNS} FROM canonical_resources
             WHERE tenant_id = ?1 AND resource_type = ?2 AND source_id = ?3"
        );
        let resource = conn
            .query_row(
                &sql,
                params![
                    key.tenant_id.as_str(),
                    key.resource_type.as_str(),
                    key.source_id
                ],
                read_resource,
            )
            .optional()?;
        Ok(resource)
    }

    async fn find_by_id(&self, id: &str) -> SyncResult<Option<CanonicalResource>> {
        let conn = self.get_connection()?;
        let sql = format!("SELECT {RESOURCE_COLUMNS} FROM canonical_resources WHERE id = ?1");
        let resource = conn.query_row(&sql, [id], read_resource).optional()?;
        Ok(resource)
    }

    async fn count(
        &self,
        tenant_id: &TenantId,
        resource_type: Option<ResourceType>,
    ) -> SyncResult<u64> {
        let conn = self.get_connection()?;
        let count: i64 = match resource_type {
            Some(rt) => conn.query_row(
                "SELECT COUNT(*) FROM canonical_resources
                 WHERE tenant_id = ?1 AND resource_type = ?2",
                params![tenant_id.as_str(), rt.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM canonical_resources WHERE tenant_id = ?1",
                [tenant_id.as_str()],
                |row| row.get(0),
            )?,
        };
        Ok(from_sql_int(count))
    }

    async fn list(
        &self,
        tenant_id: &TenantId,
        resource_type: ResourceType,
        limit: usize,
        offset: usize,
    ) -> SyncResult<Vec<CanonicalResource>> {
        let conn = self.get_connection()?;
        let sql = format!(
            "SELECT {RESOURCE_COLUMNS} FROM canonical_resources
             WHERE tenant_id = ?1 AND resource_type = ?2
             ORDER BY source_id
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let resources = stmt
            .query_map(
                params![
                    tenant_id.as_str(),
                    resource_type.as_str(),
                    to_sql_int(limit as u64),
                    to_sql_int(offset as u64)
                ],
                read_resource,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(resources)
    }
}

impl SqliteStore {
    /// One attempt at an upsert, inside a single immediate transaction.
    fn upsert_once(&self, document: &CanonicalDocument) -> SyncResult<UpsertOutcome> {
        let key = &document.key;
        let mut conn = self.get_connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| write_error(e, key))?;

        let mut payload = document.payload.clone();
        for link in &document.links {
            let target_id: Option<String> = tx
                .query_row(
                    "SELECT id FROM canonical_resources
                     WHERE tenant_id = ?1 AND resource_type = ?2 AND source_id = ?3",
                    params![
                        key.tenant_id.as_str(),
                        link.target_type.as_str(),
                        link.target_source_id
                    ],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(target_id) = target_id else {
                return Err(SyncError::Write(WriteError::DanglingReference {
                    resource_type: key.resource_type,
                    source_id: key.source_id.clone(),
                    target_type: link.target_type,
                    target_source_id: link.target_source_id.clone(),
                }));
            };

            if let Some(Value::Object(reference)) = link.path.get_mut(&mut payload) {
                reference.insert(
                    "reference".to_string(),
                    Value::String(format!("{}/{}", link.target_type, target_id)),
                );
            }
        }
        let payload = serde_json::to_string(&payload)?;

        let existing = find_existing(&tx, key)?;
        let now = format_timestamp(Utc::now());

        let id: String = tx
            .query_row(
                "INSERT INTO canonical_resources
                    (id, tenant_id, resource_type, source_id, payload, status,
                     source_system, created_at, last_synced_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7, ?7, 1)
                 ON CONFLICT(tenant_id, resource_type, source_id) DO UPDATE SET
                    payload = excluded.payload,
                    source_system = excluded.source_system,
                    last_synced_at = excluded.last_synced_at,
                    version = CASE
                        WHEN canonical_resources.payload = excluded.payload
                         AND canonical_resources.status = 'active'
                         AND canonical_resources.source_system = excluded.source_system
                        THEN canonical_resources.version
                        ELSE canonical_resources.version + 1
                    END,
                    status = 'active'
                 RETURNING id",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    key.tenant_id.as_str(),
                    key.resource_type.as_str(),
                    key.source_id,
                    payload,
                    document.source_system,
                    now
                ],
                |row| row.get(0),
            )
            .map_err(|e| write_error(e, key))?;

        tx.commit().map_err(|e| write_error(e, key))?;

        let outcome = match existing {
            None => UpsertOutcome::Inserted(id),
            Some(existing)
                if existing.payload == payload
                    && existing.status == ResourceStatus::Active.as_str()
                    && existing.source_system == document.source_system =>
            {
                UpsertOutcome::Unchanged(id)
            }
            Some(_) => UpsertOutcome::Updated(id),
        };
        Ok(outcome)
    }
}

fn find_existing(conn: &Connection, key: &NaturalKey) -> SyncResult<Option<Existing>> {
    let existing = conn
        .query_row(
            "SELECT id, payload, status, source_system FROM canonical_resources
             WHERE tenant_id = ?1 AND resource_type = ?2 AND source_id = ?3",
            params![
                key.tenant_id.as_str(),
                key.resource_type.as_str(),
                key.source_id
            ],
            |row| {
                Ok(Existing {
                    id: row.get(0)?,
                    payload: row.get(1)?,
                    status: row.get(2)?,
                    source_system: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(existing)
}

/// Busy and unique-constraint failures are races on the natural key.
fn write_error(err: rusqlite::Error, key: &NaturalKey) -> SyncError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation)
        | Some(ErrorCode::DatabaseBusy)
        | Some(ErrorCode::DatabaseLocked) => SyncError::Write(WriteError::WriteConflict {
            resource_type: key.resource_type,
            source_id: key.source_id.clone(),
        }),
        _ => err.into(),
    }
}

fn read_resource(row: &Row<'_>) -> rusqlite::Result<CanonicalResource> {
    let tenant_id: String = row.get(1)?;
    let resource_type: String = row.get(2)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    let last_synced_at: String = row.get(8)?;
    let version: i64 = row.get(9)?;

    Ok(CanonicalResource {
        id: row.get(0)?,
        key: NaturalKey {
            tenant_id: TenantId::new(tenant_id),
            resource_type: resource_type
                .parse::<ResourceType>()
                .map_err(|e| conversion_error(2, e))?,
            source_id: row.get(3)?,
        },
        payload: row.get::<_, Value>(4)?,
        status: ResourceStatus::parse(&status).unwrap_or(ResourceStatus::Active),
        source_system: row.get(6)?,
        created_at: parse_timestamp(7, &created_at)?,
        last_synced_at: parse_timestamp(8, &last_synced_at)?,
        version: from_sql_int(version),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldPath, ResourceLink};
    use serde_json::json;

    fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.init_schema().unwrap();
        store
    }

    fn patient(source_id: &str, gender: &str) -> CanonicalDocument {
        CanonicalDocument {
            key: NaturalKey::new("t1", ResourceType::Patient, source_id),
            payload: json!({
                "resourceType": "Patient",
                "identifier": [{"system": "urn:helios:t1:patients", "value": source_id}],
                "gender": gender
            }),
            links: Vec::new(),
            source_system: "general-his".to_string(),
        }
    }

    fn encounter(source_id: &str, patient: &str) -> CanonicalDocument {
        CanonicalDocument {
            key: NaturalKey::new("t1", ResourceType::Encounter, source_id),
            payload: json!({
                "resourceType": "Encounter",
                "identifier": [{"value": source_id}],
                "subject": {"type": "Patient", "identifier": {"value": patient}}
            }),
            links: vec![ResourceLink {
                path: FieldPath::parse("subject").unwrap(),
                target_type: ResourceType::Patient,
                target_source_id: patient.to_string(),
            }],
            source_system: "general-his".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_then_update_keeps_id() {
        let store = store();

        let inserted = store.upsert(&patient("P100", "male")).await.unwrap();
        assert!(matches!(inserted, UpsertOutcome::Inserted(_)));

        let first = store
            .find(&NaturalKey::new("t1", ResourceType::Patient, "P100"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.status, ResourceStatus::Active);

        let updated = store.upsert(&patient("P100", "female")).await.unwrap();
        assert_eq!(updated, UpsertOutcome::Updated(inserted.id().to_string()));

        let second = store.find_by_id(inserted.id()).await.unwrap().unwrap();
        assert_eq!(second.payload["gender"], "female");
        assert_eq!(second.version, 2);
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_reapply_is_unchanged() {
        let store = store();
        let doc = patient("P1", "male");

        let first = store.upsert(&doc).await.unwrap();
        let second = store.upsert(&doc).await.unwrap();
        assert_eq!(second, UpsertOutcome::Unchanged(first.id().to_string()));

        let tenant = TenantId::new("t1");
        assert_eq!(store.count(&tenant, None).await.unwrap(), 1);
        let resource = store.find_by_id(first.id()).await.unwrap().unwrap();
        assert_eq!(resource.version, 1);
    }

    #[tokio::test]
    async fn test_dangling_reference_leaves_store_unchanged() {
        let store = store();

        let err = store.upsert(&encounter("E1", "P999")).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Write(WriteError::DanglingReference { ref target_source_id, .. })
                if target_source_id == "P999"
        ));
        assert_eq!(store.count(&TenantId::new("t1"), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_links_resolve_to_surrogate_id() {
        let store = store();
        let patient_id = store.upsert(&patient("P1", "male")).await.unwrap();
        let encounter_id = store.upsert(&encounter("E1", "P1")).await.unwrap();

        let stored = store.find_by_id(encounter_id.id()).await.unwrap().unwrap();
        assert_eq!(
            stored.payload["subject"]["reference"],
            format!("Patient/{}", patient_id.id())
        );
        assert_eq!(stored.payload["subject"]["identifier"]["value"], "P1");
    }

    #[tokio::test]
    async fn test_references_are_tenant_scoped() {
        let store = store();
        let mut other = patient("P1", "male");
        other.key.tenant_id = TenantId::new("t2");
        store.upsert(&other).await.unwrap();

        let err = store.upsert(&encounter("E1", "P1")).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Write(WriteError::DanglingReference { .. })
        ));
    }

    #[tokio::test]
    async fn test_deactivate() {
        let store = store();
        let key = NaturalKey::new("t1", ResourceType::Patient, "P1");

        assert_eq!(store.deactivate(&key).await.unwrap(), None);

        let id = store.upsert(&patient("P1", "male")).await.unwrap();
        let off = store.deactivate(&key).await.unwrap().unwrap();
        assert_eq!(off, UpsertOutcome::Updated(id.id().to_string()));
        assert_eq!(
            store.deactivate(&key).await.unwrap(),
            Some(UpsertOutcome::Unchanged(id.id().to_string()))
        );

        let resource = store.find(&key).await.unwrap().unwrap();
        assert_eq!(resource.status, ResourceStatus::Inactive);
        assert_eq!(resource.version, 2);

        // Re-created at the source: the same row comes back active.
        let back = store.upsert(&patient("P1", "male")).await.unwrap();
        assert_eq!(back, UpsertOutcome::Updated(id.id().to_string()));
        let resource = store.find(&key).await.unwrap().unwrap();
        assert_eq!(resource.status, ResourceStatus::Active);
        assert_eq!(resource.version, 3);
    }

    #[tokio::test]
    async fn test_list_and_count() {
        let store = store();
        for id in ["P3", "P1", "P2"] {
            store.upsert(&patient(id, "male")).await.unwrap();
        }
        store.upsert(&encounter("E1", "P1")).await.unwrap();

        let tenant = TenantId::new("t1");
        assert_eq!(store.count(&tenant, None).await.unwrap(), 4);
        assert_eq!(
            store
                .count(&tenant, Some(ResourceType::Patient))
                .await
                .unwrap(),
            3
        );

        let page = store
            .list(&tenant, ResourceType::Patient, 2, 1)
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|r| r.key.source_id.as_str()).collect();
        assert_eq!(ids, vec!["P2", "P3"]);
        assert!(store.exists(&page[0].key).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_single_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(SqliteStore::open(dir.path().join("store.db")).unwrap());
        store.init_schema().unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let gender = if i % 2 == 0 { "male" } else { "female" };
                store.upsert(&patient("P1", gender)).await
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().id().to_string());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.count(&TenantId::new("t1"), None).await.unwrap(), 1);
    }
}
