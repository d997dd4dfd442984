//! Sync runs against SQLite hospital databases with trigger-based change
//! capture, into a file-backed canonical store.

#![cfg(feature = "sqlite")]

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{Connection, params};
use tempfile::TempDir;

use helios_sync::backends::sqlite::SqliteStore;
use helios_sync::core::{ResourceStore, TenantDirectory};
use helios_sync::error::ErrorKind;
use helios_sync::mapping::DescriptorRegistry;
use helios_sync::source::{SqliteTenantConnector, install_change_capture};
use helios_sync::sync::SyncOrchestrator;
use helios_sync::tenant::{Tenant, TenantId};
use helios_sync::types::{NaturalKey, ResourceStatus, ResourceType, SyncMode, SyncOutcome};

use common::{observation_descriptor, patient_descriptor, test_config};

fn hospital_db(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE patients (
            patient_id TEXT PRIMARY KEY,
            name TEXT,
            gender TEXT,
            dob TEXT
        );
        CREATE TABLE lab_results (
            lab_id INTEGER PRIMARY KEY,
            patient_id TEXT,
            visit_id TEXT,
            test_name TEXT,
            result REAL,
            unit TEXT
        );",
    )
    .unwrap();
    install_change_capture(&conn, "patients", "patient_id").unwrap();
    install_change_capture(&conn, "lab_results", "lab_id").unwrap();
    path
}

fn execute(path: &Path, sql: &str, values: &[&dyn rusqlite::ToSql]) {
    Connection::open(path).unwrap().execute(sql, values).unwrap();
}

struct Setup {
    _dir: TempDir,
    source: PathBuf,
    store: Arc<SqliteStore>,
    orchestrator: SyncOrchestrator,
}

async fn setup() -> Setup {
    let dir = TempDir::new().unwrap();
    let source = hospital_db(&dir, "hospital.db");

    let store = Arc::new(SqliteStore::open(dir.path().join("canonical.db")).unwrap());
    store.init_schema().unwrap();
    store.onboard(&Tenant::new("t1", "General")).await.unwrap();

    let connector = Arc::new(SqliteTenantConnector::new());
    connector.register(TenantId::new("t1"), &source);

    let registry = Arc::new(DescriptorRegistry::new());
    registry.register(patient_descriptor("t1")).unwrap();
    registry.register(observation_descriptor("t1")).unwrap();

    let orchestrator =
        SyncOrchestrator::new(store.clone(), connector, registry, test_config());
    Setup {
        _dir: dir,
        source,
        store,
        orchestrator,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_captured_changes_sync_end_to_end() {
    let s = setup().await;
    let tenant = TenantId::new("t1");
    execute(
        &s.source,
        "INSERT INTO patients VALUES (?1, ?2, ?3, ?4)",
        params!["P100", "Ali Khan", "M", "1995-04-12"],
    );
    execute(
        &s.source,
        "INSERT INTO lab_results (patient_id, test_name, result, unit) VALUES (?1, ?2, ?3, ?4)",
        params!["P100", "Glucose", 5.4, "mmol/L"],
    );

    let report = s
        .orchestrator
        .sync_tenant(&tenant, SyncMode::Incremental)
        .await
        .unwrap();
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.records_applied(), 2);

    let patient = s
        .store
        .find(&NaturalKey::new("t1", ResourceType::Patient, "P100"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(patient.payload["gender"], "male");
    assert_eq!(patient.payload["birthDate"], "1995-04-12");

    // Integer keys become string source ids.
    let lab = s
        .store
        .find(&NaturalKey::new("t1", ResourceType::Observation, "1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lab.payload["valueQuantity"]["value"], 5.4);
    assert_eq!(lab.payload["valueQuantity"]["unit"], "mmol/L");
    assert_eq!(lab.payload["subject"]["reference"], format!("Patient/{}", patient.id));

    execute(
        &s.source,
        "UPDATE patients SET name = ?1 WHERE patient_id = ?2",
        params!["Ali R. Khan", "P100"],
    );
    execute(&s.source, "DELETE FROM lab_results WHERE lab_id = 1", &[]);
    s.orchestrator
        .sync_tenant(&tenant, SyncMode::Incremental)
        .await
        .unwrap();

    let renamed = s.store.find_by_id(&patient.id).await.unwrap().unwrap();
    assert_eq!(renamed.payload["name"][0]["text"], "Ali R. Khan");
    assert_eq!(renamed.version, 2);

    let removed = s.store.find_by_id(&lab.id).await.unwrap().unwrap();
    assert_eq!(removed.status, ResourceStatus::Inactive);
}

#[tokio::test]
async fn test_rows_loaded_before_capture_need_a_full_sync() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("legacy.db");
    {
        let conn = Connection::open(&source).unwrap();
        conn.execute_batch(
            "CREATE TABLE patients (patient_id TEXT PRIMARY KEY, name TEXT, gender TEXT, dob TEXT);
             INSERT INTO patients VALUES ('P1', 'Legacy', 'F', '1940-05-05');",
        )
        .unwrap();
        install_change_capture(&conn, "patients", "patient_id").unwrap();
    }

    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.init_schema().unwrap();
    store.onboard(&Tenant::new("t1", "Legacy")).await.unwrap();
    let connector = Arc::new(SqliteTenantConnector::new());
    connector.register(TenantId::new("t1"), &source);
    let registry = Arc::new(DescriptorRegistry::new());
    registry.register(patient_descriptor("t1")).unwrap();
    let orchestrator = SyncOrchestrator::new(store.clone(), connector, registry, test_config());

    let tenant = TenantId::new("t1");
    let incremental = orchestrator
        .run_sync(&tenant, ResourceType::Patient, SyncMode::Incremental)
        .await
        .unwrap();
    assert_eq!(incremental.records_examined, 0);

    let full = orchestrator
        .run_sync(&tenant, ResourceType::Patient, SyncMode::Full)
        .await
        .unwrap();
    assert_eq!(full.outcome(), Some(SyncOutcome::Succeeded));
    assert_eq!(store.count(&tenant, None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_schema_drift_is_reported_per_row() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("drifted.db");
    {
        let conn = Connection::open(&source).unwrap();
        // No `dob` column: the descriptor reads one.
        conn.execute_batch(
            "CREATE TABLE patients (patient_id TEXT PRIMARY KEY, name TEXT, gender TEXT);
             INSERT INTO patients VALUES ('P1', 'Drifted', 'M');",
        )
        .unwrap();
    }

    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.init_schema().unwrap();
    store.onboard(&Tenant::new("t1", "Drifted")).await.unwrap();
    let connector = Arc::new(SqliteTenantConnector::new());
    connector.register(TenantId::new("t1"), &source);
    let registry = Arc::new(DescriptorRegistry::new());
    registry.register(patient_descriptor("t1")).unwrap();
    let orchestrator = SyncOrchestrator::new(store.clone(), connector, registry, test_config());

    let record = orchestrator
        .run_sync(&TenantId::new("t1"), ResourceType::Patient, SyncMode::Full)
        .await
        .unwrap();
    assert_eq!(record.outcome(), Some(SyncOutcome::Failed));
    assert_eq!(record.row_errors.len(), 1);
    assert_eq!(record.row_errors[0].kind, ErrorKind::SchemaMismatch);
    assert!(record.row_errors[0].message.contains("dob"));
}

#[tokio::test]
async fn test_missing_source_file_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.init_schema().unwrap();
    store.onboard(&Tenant::new("t1", "Nowhere")).await.unwrap();
    let connector = Arc::new(SqliteTenantConnector::new());
    connector.register(TenantId::new("t1"), dir.path().join("missing.db"));
    let registry = Arc::new(DescriptorRegistry::new());
    registry.register(patient_descriptor("t1")).unwrap();
    let orchestrator = SyncOrchestrator::new(store.clone(), connector, registry, test_config());

    let record = orchestrator
        .run_sync(&TenantId::new("t1"), ResourceType::Patient, SyncMode::Incremental)
        .await
        .unwrap();
    assert_eq!(record.outcome(), Some(SyncOutcome::Failed));
    assert_eq!(
        record.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::SourceUnavailable)
    );
}

#[tokio::test]
async fn test_descriptor_naming_absent_table_fails_without_retry() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("clinic.db");
    Connection::open(&source)
        .unwrap()
        .execute_batch("CREATE TABLE patients (patient_id TEXT PRIMARY KEY, name TEXT);")
        .unwrap();

    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.init_schema().unwrap();
    store.onboard(&Tenant::new("t1", "Clinic")).await.unwrap();
    let connector = Arc::new(SqliteTenantConnector::new());
    connector.register(TenantId::new("t1"), &source);
    let registry = Arc::new(DescriptorRegistry::new());
    registry.register(observation_descriptor("t1")).unwrap();
    let orchestrator = SyncOrchestrator::new(store.clone(), connector, registry, test_config());

    let record = orchestrator
        .run_sync(&TenantId::new("t1"), ResourceType::Observation, SyncMode::Full)
        .await
        .unwrap();
    assert_eq!(record.outcome(), Some(SyncOutcome::Failed));
    let failure = record.error.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::SchemaMismatch);
    assert!(failure.message.contains("lab_results"));
    assert!(record.row_errors.is_empty());
}
