//! Agent configuration.
//!
//! Every option can be given on the command line or through the
//! environment.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SYNC_DATABASE_URL` | sync.db | Canonical store file (`:memory:` for a throwaway store) |
//! | `SYNC_MAPPINGS_DIR` | mappings | Directory of mapping descriptor files |
//! | `SYNC_TENANTS_FILE` | tenants.json | Tenant list with each tenant's source database |
//! | `SYNC_MODE` | incremental | Sync mode for scheduled passes (full, incremental) |
//! | `SYNC_INTERVAL` | 5m | Time between scheduled passes |
//! | `SYNC_WORKERS` | 4 | Maximum concurrent runs |
//! | `SYNC_BATCH_SIZE` | 500 | Rows fetched per source batch |
//! | `SYNC_RUN_TIMEOUT` | 15m | Maximum duration of one run |
//! | `SYNC_MAX_RETRIES` | 3 | Retries for an unreachable source |
//! | `SYNC_INSTALL_CAPTURE` | false | Install change-capture triggers on source tables at startup |
//! | `SYNC_ONCE` | false | Run one pass, print the reports and exit |
//! | `SYNC_LOG_LEVEL` | info | Log level |

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use helios_sync::sync::{RetryConfig, SyncConfig};
use helios_sync::types::SyncMode;

/// Command-line and environment configuration for the sync agent.
#[derive(Debug, Clone, Parser)]
#[command(name = "helios-sync")]
#[command(about = "Multi-tenant clinical data sync agent")]
pub struct AgentConfig {
    /// Canonical store database file.
    #[arg(long, env = "SYNC_DATABASE_URL", default_value = "sync.db")]
    pub database_url: String,

    /// Directory holding mapping descriptor JSON files.
    #[arg(long, env = "SYNC_MAPPINGS_DIR", default_value = "mappings")]
    pub mappings_dir: PathBuf,

    /// JSON file listing tenants and their source databases.
    #[arg(long, env = "SYNC_TENANTS_FILE", default_value = "tenants.json")]
    pub tenants_file: PathBuf,

    /// Sync mode (full, incremental).
    #[arg(long, env = "SYNC_MODE", default_value = "incremental")]
    pub mode: SyncMode,

    /// Time between scheduled passes, e.g. `30s` or `5m`.
    #[arg(long, env = "SYNC_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
    pub interval: Duration,

    /// Maximum number of runs executing at once.
    #[arg(long, env = "SYNC_WORKERS", default_value = "4")]
    pub workers: usize,

    /// Rows fetched per source batch.
    #[arg(long, env = "SYNC_BATCH_SIZE", default_value = "500")]
    pub batch_size: usize,

    /// Maximum duration of one run.
    #[arg(long, env = "SYNC_RUN_TIMEOUT", default_value = "15m", value_parser = humantime::parse_duration)]
    pub run_timeout: Duration,

    /// Retries for a source that cannot be reached.
    #[arg(long, env = "SYNC_MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// Install change-capture triggers on every mapped source table.
    #[arg(long, env = "SYNC_INSTALL_CAPTURE", default_value = "false")]
    pub install_capture: bool,

    /// Run a single pass and exit.
    #[arg(long, env = "SYNC_ONCE", default_value = "false")]
    pub once: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "SYNC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl AgentConfig {
    /// Validates the configuration and returns errors if any.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database_url.is_empty() {
            errors.push("Database URL cannot be empty".to_string());
        }

        if self.interval.is_zero() {
            errors.push("Sync interval cannot be 0".to_string());
        }

        if let Err(mut sync_errors) = self.sync_config().validate() {
            errors.append(&mut sync_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Builds the orchestrator configuration.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            batch_size: self.batch_size,
            worker_pool_size: self.workers,
            run_timeout_ms: u64::try_from(self.run_timeout.as_millis()).unwrap_or(u64::MAX),
            retry: RetryConfig {
                max_retries: self.max_retries,
                ..RetryConfig::default()
            },
            ..SyncConfig::default()
        }
    }

    /// Returns `true` when the store should live only in memory.
    pub fn is_memory_store(&self) -> bool {
        self.database_url == ":memory:"
    }
}
