//! Orchestrator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::source::SourceQuery;

/// Configuration for sync runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Source rows per batch. The watermark moves at most once per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum number of runs executing at once across all tenants.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Maximum duration of one run in milliseconds.
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,

    /// Lifetime of a run lease in milliseconds. Renewed after every batch.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Row errors kept on a run record; further ones are only counted.
    #[serde(default = "default_max_row_errors")]
    pub max_row_errors: usize,

    /// Ledger rows returned by a status query.
    #[serde(default = "default_status_limit")]
    pub status_limit: usize,

    /// Retry policy for an unreachable source.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_batch_size() -> usize {
    SourceQuery::DEFAULT_BATCH_SIZE
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_run_timeout_ms() -> u64 {
    15 * 60 * 1000
}

fn default_lease_ttl_ms() -> u64 {
    60 * 1000
}

fn default_max_row_errors() -> usize {
    100
}

fn default_status_limit() -> usize {
    50
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            worker_pool_size: default_worker_pool_size(),
            run_timeout_ms: default_run_timeout_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            max_row_errors: default_max_row_errors(),
            status_limit: default_status_limit(),
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Maximum duration of one run.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Lifetime of a run lease.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Returns every problem with the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.batch_size == 0 {
            errors.push("batch_size must be at least 1".to_string());
        }
        if self.worker_pool_size == 0 {
            errors.push("worker_pool_size must be at least 1".to_string());
        }
        if self.run_timeout_ms == 0 {
            errors.push("run_timeout_ms must be positive".to_string());
        }
        if self.lease_ttl_ms == 0 {
            errors.push("lease_ttl_ms must be positive".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            errors.push("retry.backoff_multiplier must be at least 1.0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Retry configuration for an unreachable source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Starts a fresh backoff sequence.
    pub(crate) fn backoff(&self) -> Backoff {
        Backoff {
            remaining: self.max_retries,
            delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.backoff_multiplier,
        }
    }
}

/// Exponential backoff state for one retried operation.
#[derive(Debug)]
pub(crate) struct Backoff {
    remaining: u32,
    delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Returns the delay before the next attempt, or `None` once retries
    /// are exhausted.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.delay.min(self.max_delay);
        self.delay = std::cmp::min(
            Duration::from_secs_f64(self.delay.as_secs_f64() * self.multiplier),
            self.max_delay,
        );
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let config = SyncConfig {
            batch_size: 0,
            worker_pool_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().len(), 2);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_retries: 4,
            initial_delay_ms: 100,
            max_delay_ms: 300,
            backoff_multiplier: 2.0,
        };
        let mut backoff = retry.backoff();
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 300, 300]);
    }
}
