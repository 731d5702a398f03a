//! Call-scoped tenant context
//!
//! A task-local carrier that binds the current tenant to the logical
//! execution of a request without threading it through every signature. The
//! persistence and coordination layers read it to scope queries; work spawned
//! on behalf of the same request must be wrapped with [`spawn_scoped`] so the
//! binding survives the spawn boundary.

use crate::{OrchestratorError, Result};
use std::future::Future;
use tokio::task::JoinHandle;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_TENANT: Uuid;
}

/// Run `fut` with `tenant_id` bound as the current tenant.
pub async fn with_tenant<F>(tenant_id: Uuid, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_TENANT.scope(tenant_id, fut).await
}

/// The tenant bound to the current execution, or `TENANT_REQUIRED`.
///
/// Only explicitly global operations (health checks, tenant provisioning)
/// may proceed without a binding; they use [`try_current_tenant`] instead.
pub fn current_tenant() -> Result<Uuid> {
    CURRENT_TENANT
        .try_with(|tenant| *tenant)
        .map_err(|_| OrchestratorError::TenantRequired)
}

/// The tenant bound to the current execution, if any.
pub fn try_current_tenant() -> Option<Uuid> {
    CURRENT_TENANT.try_with(|tenant| *tenant).ok()
}

/// Spawn concurrent work that keeps the given tenant binding.
///
/// `tokio::spawn` does not inherit task-locals; any spawned unit of work on
/// behalf of a request must rebind explicitly, and work for a different
/// tenant must pass that tenant here instead.
pub fn spawn_scoped<F>(tenant_id: Uuid, fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(CURRENT_TENANT.scope(tenant_id, fut))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_context_is_bound_inside_scope() {
        let tenant = Uuid::new_v4();
        with_tenant(tenant, async move {
            assert_eq!(current_tenant().unwrap(), tenant);
        })
        .await;
    }

    #[tokio::test]
    async fn test_missing_context_fails_with_tenant_required() {
        let err = current_tenant().unwrap_err();
        assert_eq!(err.code(), "TENANT_REQUIRED");
        assert!(try_current_tenant().is_none());
    }

    #[tokio::test]
    async fn test_context_survives_await_points() {
        let tenant = Uuid::new_v4();
        with_tenant(tenant, async move {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            assert_eq!(current_tenant().unwrap(), tenant);
        })
        .await;
    }

    #[tokio::test]
    async fn test_spawn_scoped_rebinds() {
        let tenant = Uuid::new_v4();
        let handle = spawn_scoped(tenant, async move { current_tenant().unwrap() });
        assert_eq!(handle.await.unwrap(), tenant);
    }

    #[tokio::test]
    async fn test_plain_spawn_does_not_leak_context() {
        let tenant = Uuid::new_v4();
        with_tenant(tenant, async move {
            let handle = tokio::spawn(async { try_current_tenant() });
            assert_eq!(handle.await.unwrap(), None);
        })
        .await;
    }

    #[tokio::test]
    async fn test_nested_scope_shadows_outer() {
        let outer = Uuid::new_v4();
        let inner = Uuid::new_v4();
        with_tenant(outer, async move {
            with_tenant(inner, async move {
                assert_eq!(current_tenant().unwrap(), inner);
            })
            .await;
            assert_eq!(current_tenant().unwrap(), outer);
        })
        .await;
    }
}
