//! Per-tenant quota enforcement
//!
//! Session concurrency is counted straight off the persistence store
//! (sessions in any non-terminal state) and checked inside the tenant quota
//! lock. The daily token budget is a rolling 24 h window of hourly buckets
//! under `tenant_tokens:{tenant}:{hour}` in the coordination store.

use crate::coordination::CoordinationStore;
use crate::store::{SessionRepository, TenantRepository};
use crate::{tenant, OrchestratorError, Result};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const BUCKET_SECS: i64 = 3_600;
const WINDOW_BUCKETS: i64 = 24;

#[derive(Clone)]
pub struct QuotaEnforcer {
    tenants: TenantRepository,
    sessions: SessionRepository,
    coordination: Arc<dyn CoordinationStore>,
    /// Process-wide ceiling from `MAX_CONCURRENT_SESSIONS`; the effective
    /// limit is the smaller of this and the tenant quota.
    max_concurrent_sessions: u32,
}

impl QuotaEnforcer {
    pub fn new(
        tenants: TenantRepository,
        sessions: SessionRepository,
        coordination: Arc<dyn CoordinationStore>,
        max_concurrent_sessions: u32,
    ) -> Self {
        Self {
            tenants,
            sessions,
            coordination,
            max_concurrent_sessions,
        }
    }

    /// The effective concurrent-session limit for the current tenant.
    pub async fn session_limit(&self) -> Result<u32> {
        let tenant_id = tenant::current_tenant()?;
        let quota = self.tenants.get(tenant_id).await?.quotas;
        Ok(quota
            .max_concurrent_sessions
            .min(self.max_concurrent_sessions))
    }

    /// Admission check for a new concurrent session. Call while holding the
    /// tenant quota lock so two creates cannot both observe headroom.
    pub async fn check_session_admission(&self) -> Result<()> {
        let tenant_id = tenant::current_tenant()?;
        let allowed = self.session_limit().await?;
        let active = self.sessions.active_count().await?;
        if active >= allowed as u64 {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "tenant has {active} active sessions of {allowed} allowed"
            )));
        }
        debug!("session admission ok for tenant {tenant_id}: {active}/{allowed}");
        Ok(())
    }

    fn bucket_key(tenant_id: Uuid, bucket: i64) -> String {
        format!("tenant_tokens:{tenant_id}:{bucket}")
    }

    fn current_bucket() -> i64 {
        chrono::Utc::now().timestamp() / BUCKET_SECS
    }

    /// Tokens consumed by the tenant over the rolling 24 h window.
    pub async fn tokens_used_today(&self) -> Result<u64> {
        let tenant_id = tenant::current_tenant()?;
        let newest = Self::current_bucket();
        let mut total: u64 = 0;
        for bucket in (newest - WINDOW_BUCKETS + 1)..=newest {
            if let Some(value) = self
                .coordination
                .get(&Self::bucket_key(tenant_id, bucket))
                .await?
            {
                total += value.parse::<u64>().unwrap_or(0);
            }
        }
        Ok(total)
    }

    /// Admission check for new work: fail once the daily budget is spent.
    pub async fn ensure_token_headroom(&self) -> Result<()> {
        let tenant_id = tenant::current_tenant()?;
        let quota = self.tenants.get(tenant_id).await?.quotas;
        let used = self.tokens_used_today().await?;
        if used >= quota.max_tokens_per_day {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "token budget exhausted: {used} used of {} per day",
                quota.max_tokens_per_day
            )));
        }
        Ok(())
    }

    /// Fail when spending `tokens` more would cross the daily budget.
    pub async fn check_token_budget(&self, tokens: u64) -> Result<()> {
        let tenant_id = tenant::current_tenant()?;
        let quota = self.tenants.get(tenant_id).await?.quotas;
        let used = self.tokens_used_today().await?;
        if used.saturating_add(tokens) > quota.max_tokens_per_day {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "token budget exhausted: {used} used of {} per day",
                quota.max_tokens_per_day
            )));
        }
        Ok(())
    }

    /// Record spent tokens into the current window bucket.
    pub async fn charge_tokens(&self, tokens: u64) -> Result<u64> {
        let tenant_id = tenant::current_tenant()?;
        let key = Self::bucket_key(tenant_id, Self::current_bucket());
        // Buckets live one hour past the window so sums stay complete.
        let ttl = std::time::Duration::from_secs(
            crate::constants::TOKEN_QUOTA_WINDOW_SECS + BUCKET_SECS as u64,
        );
        let value = self.coordination.incr_by_ex(&key, tokens as i64, ttl).await?;
        Ok(value as u64)
    }
}
