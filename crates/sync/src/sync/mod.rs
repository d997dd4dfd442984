//! The Sync Orchestrator and its scheduler.
//!
//! [`SyncOrchestrator`] drives one run per (tenant, resource type): it takes
//! the pair's lease, reads from a [`ChangeSource`](crate::source::ChangeSource),
//! maps every row, upserts the result, advances the watermark and appends a
//! [`SyncRunRecord`](crate::types::SyncRunRecord) to the ledger.
//!
//! # Run Lifecycle
//!
//! ```text
//! Idle ──trigger──▶ Running ──▶ Succeeded          ──persist──▶ Idle
//!                          ├──▶ PartiallySucceeded ──persist──▶ Idle
//!                          └──▶ Failed             ──persist──▶ Idle
//! ```
//!
//! A trigger for an unknown or inactive tenant, a pair without a mapping
//! descriptor, or a pair whose lease is held is rejected before `Running`
//! and leaves no record.
//!
//! # Tenant Passes
//!
//! [`SyncOrchestrator::sync_tenant`] runs a tenant's configured types in
//! dependency tiers (Patient, then Encounter, then everything else).
//! [`SyncOrchestrator::sync_all`] runs every active tenant concurrently, and
//! [`SyncScheduler`] repeats that on an interval.

mod config;
mod orchestrator;
mod runner;
mod scheduler;
mod tracker;

pub use config::{RetryConfig, SyncConfig};
pub use orchestrator::{RunHandle, SyncOrchestrator, TenantSyncReport};
pub use scheduler::{SchedulerHandle, SchedulerStats, SyncScheduler};
