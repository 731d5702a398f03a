use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resource quotas enforced per tenant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantQuotas {
    /// Sessions in any non-terminal state at one time
    pub max_concurrent_sessions: u32,
    /// Rolling 24 h token budget
    pub max_tokens_per_day: u64,
    /// Registered agents
    pub max_agents: u32,
}

impl Default for TenantQuotas {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 100,
            max_tokens_per_day: 10_000_000,
            max_agents: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TenantTier {
    Free,
    Standard,
    Enterprise,
}

/// The top-level isolation boundary. Tenants are created out-of-band; the
/// core only ever reads them and edits their quotas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub quotas: TenantQuotas,
    pub tier: TenantTier,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Tenant {
    pub fn new(name: impl Into<String>, quotas: TenantQuotas, tier: TenantTier) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            quotas,
            tier,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tenant_defaults() {
        let tenant = Tenant::new("acme", TenantQuotas::default(), TenantTier::Standard);
        assert_eq!(tenant.version, 1);
        assert!(tenant.deleted_at.is_none());
        assert_eq!(tenant.quotas.max_concurrent_sessions, 100);
    }
}
