//! Onboarded tenant records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TenantId;

/// One onboarded hospital.
///
/// Tenants are deactivated rather than deleted when a hospital is
/// offboarded, so the canonical rows they contributed keep a valid owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// Stable tenant identifier.
    pub id: TenantId,

    /// Human-readable hospital name.
    pub display_name: String,

    /// Whether syncs may run for this tenant.
    pub active: bool,

    /// When the tenant was onboarded.
    pub onboarded_at: DateTime<Utc>,
}

impl Tenant {
    /// Creates an active tenant onboarded now.
    pub fn new(id: impl Into<TenantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            active: true,
            onboarded_at: Utc::now(),
        }
    }

    /// Returns a copy of this tenant marked inactive.
    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tenant_is_active() {
        let tenant = Tenant::new("t1", "General Hospital");
        assert!(tenant.active);
        assert_eq!(tenant.id.as_str(), "t1");

        let off = tenant.clone().deactivated();
        assert!(!off.active);
        assert_eq!(off.onboarded_at, tenant.onboarded_at);
    }
}
