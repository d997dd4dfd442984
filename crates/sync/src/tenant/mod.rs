//! Tenant identity for multi-hospital synchronization.
//!
//! Every operation in the sync core is scoped by a [`TenantId`]. The
//! canonical store's natural key, the watermark key and the lease key all
//! start with it, which is what keeps one hospital's data and progress
//! isolated from every other hospital's.
//!
//! # Examples
//!
//! ```
//! use helios_sync::tenant::{Tenant, TenantId};
//!
//! let tenant = Tenant::new("t1", "General Hospital");
//! assert_eq!(tenant.id, TenantId::new("t1"));
//! assert!(tenant.active);
//! ```

mod id;
#[allow(clippy::module_inception)]
mod tenant;

pub use id::TenantId;
pub use tenant::Tenant;
