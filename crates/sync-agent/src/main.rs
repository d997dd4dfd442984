//! Helios Sync agent
//!
//! Pulls hospital source databases into the shared canonical store, either
//! once or on a schedule.

mod config;
mod tenants;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use helios_sync::backends::sqlite::SqliteStore;
use helios_sync::mapping::DescriptorRegistry;
use helios_sync::source::{SqliteTenantConnector, install_change_capture};
use helios_sync::sync::{SyncOrchestrator, SyncScheduler, TenantSyncReport};
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::tenants::{TenantEntry, load_tenants, register_tenants};

/// Initializes the tracing subscriber.
fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("helios_sync={level},helios_sync_agent={level}"))
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Opens the canonical store and creates its schema.
fn create_store(config: &AgentConfig) -> anyhow::Result<SqliteStore> {
    info!(database = %config.database_url, "Initializing canonical store");
    let store = if config.is_memory_store() {
        SqliteStore::in_memory()?
    } else {
        SqliteStore::open(&config.database_url)?
    };
    store.init_schema()?;
    Ok(store)
}

/// Installs change capture on every mapped table of every tenant source.
fn install_capture(entries: &[TenantEntry], registry: &DescriptorRegistry) -> anyhow::Result<()> {
    for entry in entries {
        let resource_types = registry.resource_types(&entry.id);
        if resource_types.is_empty() {
            warn!(tenant = %entry.id, "No mapping descriptors for tenant");
            continue;
        }
        let conn = rusqlite::Connection::open(&entry.source)
            .with_context(|| format!("opening source {}", entry.source.display()))?;
        for resource_type in resource_types {
            let descriptor = registry.get(&entry.id, resource_type)?;
            install_change_capture(&conn, &descriptor.source_table, &descriptor.source_id_column)
                .with_context(|| {
                    format!("installing change capture on {}", descriptor.source_table)
                })?;
            info!(
                tenant = %entry.id,
                table = %descriptor.source_table,
                "Change capture installed"
            );
        }
    }
    Ok(())
}

fn log_report(report: &TenantSyncReport) {
    for run in &report.runs {
        info!(
            tenant = %report.tenant_id,
            resource_type = %run.resource_type,
            outcome = ?run.outcome(),
            examined = run.records_examined,
            applied = run.records_applied,
            failed = run.row_error_count(),
            "Run finished"
        );
    }
    for (resource_type, error) in &report.rejected {
        warn!(
            tenant = %report.tenant_id,
            resource_type = %resource_type,
            error = %error,
            "Run rejected"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::parse();
    init_logging(&config.log_level);

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    info!(
        mode = %config.mode,
        interval = %humantime::format_duration(config.interval),
        workers = config.workers,
        once = config.once,
        "Starting Helios Sync agent"
    );

    let store = Arc::new(create_store(&config)?);

    let registry = Arc::new(DescriptorRegistry::new());
    let loaded = registry
        .load_dir(&config.mappings_dir)
        .with_context(|| format!("loading mappings from {}", config.mappings_dir.display()))?;
    info!(descriptors = loaded, "Mapping descriptors loaded");

    let entries = load_tenants(&config.tenants_file)?;
    let connector = Arc::new(SqliteTenantConnector::new());
    register_tenants(&entries, store.as_ref(), &connector).await?;
    info!(tenants = entries.len(), "Tenants registered");

    if config.install_capture {
        install_capture(&entries, &registry)?;
    }

    let orchestrator = SyncOrchestrator::new(store, connector, registry, config.sync_config());

    if config.once {
        let reports = orchestrator.sync_all(config.mode).await?;
        reports.iter().for_each(log_report);
        println!("{}", serde_json::to_string_pretty(&reports)?);
        if !reports.iter().all(TenantSyncReport::is_success) {
            std::process::exit(2);
        }
        return Ok(());
    }

    let handle = SyncScheduler::new(orchestrator, config.interval, config.mode).start();
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let stats = handle.stats();
    handle.stop().await;
    info!(
        passes = stats.total_passes,
        runs = stats.total_runs,
        changes_synced = stats.changes_synced,
        "Helios Sync agent stopped"
    );
    Ok(())
}
