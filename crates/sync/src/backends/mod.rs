//! Storage backend implementations.
//!
//! Each backend implements the traits in [`crate::core`]. Backends are
//! feature-gated:
//!
//! - `sqlite` (default): [`sqlite::SqliteStore`]

#[cfg(feature = "sqlite")]
pub mod sqlite;
