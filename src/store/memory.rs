use super::{Entity, Page, Query, Store};
use crate::models::{Agent, Session, Task, Tenant};
use crate::{tenant, OrchestratorError, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Whether a collection injects the current tenant into every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantScope {
    Scoped,
    Global,
}

/// In-memory reference implementation of the persistence contract
///
/// Rows live in an ordered map keyed by id. The store silently adds the
/// tenant predicate read from the call context; rows of other tenants are
/// invisible rather than forbidden so ids cannot be probed across the
/// boundary.
pub struct MemoryStore<T: Entity> {
    rows: Arc<RwLock<BTreeMap<Uuid, T>>>,
    scope: TenantScope,
}

impl<T: Entity> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            rows: self.rows.clone(),
            scope: self.scope,
        }
    }
}

impl<T: Entity> MemoryStore<T> {
    pub fn new(scope: TenantScope) -> Self {
        Self {
            rows: Arc::new(RwLock::new(BTreeMap::new())),
            scope,
        }
    }

    fn current_scope(&self) -> Result<Option<Uuid>> {
        match self.scope {
            TenantScope::Scoped => tenant::current_tenant().map(Some),
            TenantScope::Global => Ok(None),
        }
    }

    fn visible(row: &T, scope: Option<Uuid>, include_deleted: bool) -> bool {
        if let Some(tenant_id) = scope {
            if row.tenant_id() != tenant_id {
                return false;
            }
        }
        include_deleted || row.deleted_at().is_none()
    }

    async fn snapshot(&self) -> BTreeMap<Uuid, T> {
        self.rows.read().await.clone()
    }

    async fn restore(&self, snapshot: BTreeMap<Uuid, T>) {
        *self.rows.write().await = snapshot;
    }

    fn apply_query(mut rows: Vec<T>, query: &Query<T>) -> Vec<T> {
        if let Some(predicate) = &query.predicate {
            rows.retain(|row| predicate(row));
        }
        if let Some(comparator) = &query.sort {
            rows.sort_by(|a, b| comparator(a, b));
        }
        let offset = query.offset.min(rows.len());
        let mut rows = rows.split_off(offset);
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        rows
    }

    fn filtered(&self, all: &BTreeMap<Uuid, T>, query: &Query<T>, scope: Option<Uuid>) -> Vec<T> {
        all.values()
            .filter(|row| Self::visible(row, scope, query.include_deleted))
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl<T: Entity> Store<T> for MemoryStore<T> {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<T>> {
        let scope = self.current_scope()?;
        let rows = self.rows.read().await;
        Ok(rows
            .get(&id)
            .filter(|row| Self::visible(row, scope, false))
            .cloned())
    }

    async fn get_by_id_including_deleted(&self, id: Uuid) -> Result<Option<T>> {
        let scope = self.current_scope()?;
        let rows = self.rows.read().await;
        Ok(rows
            .get(&id)
            .filter(|row| Self::visible(row, scope, true))
            .cloned())
    }

    async fn find(&self, query: Query<T>) -> Result<Vec<T>> {
        let scope = self.current_scope()?;
        let rows = self.rows.read().await;
        let matched = self.filtered(&rows, &query, scope);
        Ok(Self::apply_query(matched, &query))
    }

    async fn paginate(&self, query: Query<T>, page: u32, page_size: u32) -> Result<Page<T>> {
        let scope = self.current_scope()?;
        let page = page.max(1);
        let rows = self.rows.read().await;
        let mut matched = self.filtered(&rows, &query, scope);
        if let Some(predicate) = &query.predicate {
            matched.retain(|row| predicate(row));
        }
        if let Some(comparator) = &query.sort {
            matched.sort_by(|a, b| comparator(a, b));
        }
        let total = matched.len() as u64;
        let offset = ((page - 1) as usize).saturating_mul(page_size as usize);
        let items = matched
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .collect();
        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    async fn insert(&self, row: T) -> Result<T> {
        let scope = self.current_scope()?;
        if let Some(tenant_id) = scope {
            if row.tenant_id() != tenant_id {
                return Err(OrchestratorError::Forbidden(format!(
                    "{} belongs to a different tenant",
                    T::NAME
                )));
            }
        }
        let mut rows = self.rows.write().await;
        if rows.contains_key(&row.id()) {
            return Err(OrchestratorError::Validation(format!(
                "{} {} already exists",
                T::NAME,
                row.id()
            )));
        }
        rows.insert(row.id(), row.clone());
        Ok(row)
    }

    async fn update(&self, mut row: T) -> Result<T> {
        let scope = self.current_scope()?;
        let mut rows = self.rows.write().await;
        let existing = rows
            .get(&row.id())
            .filter(|existing| Self::visible(existing, scope, true))
            .ok_or_else(|| OrchestratorError::NotFound(format!("{} {}", T::NAME, row.id())))?;

        if existing.version() != row.version() {
            return Err(OrchestratorError::StaleVersion {
                entity: T::NAME,
                id: row.id(),
                expected: row.version(),
                actual: existing.version(),
            });
        }

        row.set_version(row.version() + 1);
        row.touch();
        rows.insert(row.id(), row.clone());
        Ok(row)
    }

    async fn soft_delete(&self, id: Uuid, expected_version: u64) -> Result<()> {
        let scope = self.current_scope()?;
        let mut rows = self.rows.write().await;
        let existing = rows
            .get_mut(&id)
            .filter(|existing| Self::visible(existing, scope, true))
            .ok_or_else(|| OrchestratorError::NotFound(format!("{} {id}", T::NAME)))?;

        if existing.version() != expected_version {
            return Err(OrchestratorError::StaleVersion {
                entity: T::NAME,
                id,
                expected: expected_version,
                actual: existing.version(),
            });
        }

        existing.set_deleted_at(Some(Utc::now()));
        existing.set_version(expected_version + 1);
        existing.touch();
        Ok(())
    }

    async fn hard_delete(&self, id: Uuid) -> Result<bool> {
        let scope = self.current_scope()?;
        let mut rows = self.rows.write().await;
        let visible = rows
            .get(&id)
            .map(|row| Self::visible(row, scope, true))
            .unwrap_or(false);
        if !visible {
            return Ok(false);
        }
        Ok(rows.remove(&id).is_some())
    }

    async fn count(&self, query: Query<T>) -> Result<u64> {
        let scope = self.current_scope()?;
        let rows = self.rows.read().await;
        let mut matched = self.filtered(&rows, &query, scope);
        if let Some(predicate) = &query.predicate {
            matched.retain(|row| predicate(row));
        }
        Ok(matched.len() as u64)
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        Ok(self.get_by_id(id).await?.is_some())
    }

    async fn bulk_insert(&self, rows: Vec<T>) -> Result<Vec<T>> {
        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            inserted.push(self.insert(row).await?);
        }
        Ok(inserted)
    }

    async fn bulk_update(&self, rows: Vec<T>) -> Result<Vec<T>> {
        let mut updated = Vec::with_capacity(rows.len());
        for row in rows {
            updated.push(self.update(row).await?);
        }
        Ok(updated)
    }
}

/// The full persistence engine: one collection per record type plus a
/// transactional unit-of-work scope.
pub struct MemoryEngine {
    pub sessions: MemoryStore<Session>,
    pub tasks: MemoryStore<Task>,
    pub agents: MemoryStore<Agent>,
    pub tenants: MemoryStore<Tenant>,
    commit_lock: Arc<Mutex<()>>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            sessions: MemoryStore::new(TenantScope::Scoped),
            tasks: MemoryStore::new(TenantScope::Scoped),
            agents: MemoryStore::new(TenantScope::Scoped),
            tenants: MemoryStore::new(TenantScope::Global),
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Run several repository operations as one atomic unit.
    ///
    /// Writers are serialized by the commit lock; if the closure fails, every
    /// collection is restored to its pre-transaction snapshot.
    pub async fn unit_of_work<F, Fut, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let _guard = self.commit_lock.lock().await;
        let sessions = self.sessions.snapshot().await;
        let tasks = self.tasks.snapshot().await;
        let agents = self.agents.snapshot().await;
        let tenants = self.tenants.snapshot().await;

        match work().await {
            Ok(result) => Ok(result),
            Err(error) => {
                self.sessions.restore(sessions).await;
                self.tasks.restore(tasks).await;
                self.agents.restore(agents).await;
                self.tenants.restore(tenants).await;
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateSession, Priority, SessionType};
    use crate::tenant::with_tenant;

    fn session_for(tenant_id: Uuid, title: &str) -> Session {
        Session::from_request(
            tenant_id,
            CreateSession::new(
                title,
                "prompt",
                SessionType::Execution,
                Priority::Medium,
            ),
        )
    }

    #[tokio::test]
    async fn test_insert_then_get_roundtrip() {
        let store = MemoryStore::<Session>::new(TenantScope::Scoped);
        let tenant_id = Uuid::new_v4();
        with_tenant(tenant_id, async {
            let session = session_for(tenant_id, "Implement retries");
            let inserted = store.insert(session.clone()).await.unwrap();
            let fetched = store.get_by_id(inserted.id).await.unwrap().unwrap();
            assert_eq!(fetched.id, session.id);
            assert_eq!(fetched.title, session.title);
            assert_eq!(fetched.version, 1);
        })
        .await;
    }

    #[tokio::test]
    async fn test_reads_require_tenant_context() {
        let store = MemoryStore::<Session>::new(TenantScope::Scoped);
        let err = store.get_by_id(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), "TENANT_REQUIRED");
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let store = MemoryStore::<Session>::new(TenantScope::Scoped);
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();

        let session = with_tenant(tenant_a, async {
            store
                .insert(session_for(tenant_a, "Implement retries"))
                .await
                .unwrap()
        })
        .await;

        with_tenant(tenant_b, async {
            assert!(store.get_by_id(session.id).await.unwrap().is_none());
            assert_eq!(store.count(Query::new()).await.unwrap(), 0);
        })
        .await;

        with_tenant(tenant_a, async {
            assert!(store.get_by_id(session.id).await.unwrap().is_some());
        })
        .await;
    }

    #[tokio::test]
    async fn test_optimistic_locking_rejects_stale_writes() {
        let store = MemoryStore::<Session>::new(TenantScope::Scoped);
        let tenant_id = Uuid::new_v4();
        with_tenant(tenant_id, async {
            let session = store
                .insert(session_for(tenant_id, "Implement retries"))
                .await
                .unwrap();

            let mut first = session.clone();
            first.title = "Implement retries with backoff".into();
            let updated = store.update(first).await.unwrap();
            assert_eq!(updated.version, 2);

            // Second writer still holds version 1.
            let mut stale = session.clone();
            stale.title = "Implement retries differently".into();
            let err = store.update(stale).await.unwrap_err();
            assert_eq!(err.code(), "STALE_VERSION");
        })
        .await;
    }

    #[tokio::test]
    async fn test_soft_delete_hides_from_default_reads() {
        let store = MemoryStore::<Session>::new(TenantScope::Scoped);
        let tenant_id = Uuid::new_v4();
        with_tenant(tenant_id, async {
            let session = store
                .insert(session_for(tenant_id, "Implement retries"))
                .await
                .unwrap();

            store.soft_delete(session.id, 1).await.unwrap();

            assert!(store.get_by_id(session.id).await.unwrap().is_none());
            assert_eq!(store.find(Query::new()).await.unwrap().len(), 0);
            assert!(store
                .get_by_id_including_deleted(session.id)
                .await
                .unwrap()
                .is_some());
            assert_eq!(
                store
                    .find(Query::new().include_deleted())
                    .await
                    .unwrap()
                    .len(),
                1
            );
        })
        .await;
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryStore::<Session>::new(TenantScope::Scoped);
        let tenant_id = Uuid::new_v4();
        with_tenant(tenant_id, async {
            let session = session_for(tenant_id, "Implement retries");
            store.insert(session.clone()).await.unwrap();
            assert!(store.insert(session).await.is_err());
        })
        .await;
    }

    #[tokio::test]
    async fn test_pagination_window() {
        let store = MemoryStore::<Session>::new(TenantScope::Scoped);
        let tenant_id = Uuid::new_v4();
        with_tenant(tenant_id, async {
            for i in 0..25 {
                store
                    .insert(session_for(tenant_id, &format!("Implement step {i}")))
                    .await
                    .unwrap();
            }

            let query = Query::new()
                .sort_by(|a: &Session, b: &Session| a.created_at.cmp(&b.created_at));
            let page = store.paginate(query, 2, 10).await.unwrap();
            assert_eq!(page.items.len(), 10);
            assert_eq!(page.total, 25);
            assert_eq!(page.total_pages(), 3);

            let query = Query::new();
            let last = store.paginate(query, 3, 10).await.unwrap();
            assert_eq!(last.items.len(), 5);
        })
        .await;
    }

    #[tokio::test]
    async fn test_bulk_ops() {
        let store = MemoryStore::<Session>::new(TenantScope::Scoped);
        let tenant_id = Uuid::new_v4();
        with_tenant(tenant_id, async {
            let rows = vec![
                session_for(tenant_id, "Implement step one"),
                session_for(tenant_id, "Implement step two"),
            ];
            let inserted = store.bulk_insert(rows).await.unwrap();
            assert_eq!(inserted.len(), 2);

            let updated = store.bulk_update(inserted).await.unwrap();
            assert!(updated.iter().all(|s| s.version == 2));
        })
        .await;
    }

    #[tokio::test]
    async fn test_unit_of_work_rolls_back_on_error() {
        let engine = Arc::new(MemoryEngine::new());
        let tenant_id = Uuid::new_v4();

        with_tenant(tenant_id, async {
            let outcome: Result<()> = engine
                .unit_of_work(|| async {
                    engine
                        .sessions
                        .insert(session_for(tenant_id, "Implement half a change"))
                        .await?;
                    Err(OrchestratorError::Validation("boom".into()))
                })
                .await;

            assert!(outcome.is_err());
            assert_eq!(engine.sessions.count(Query::new()).await.unwrap(), 0);
        })
        .await;
    }

    #[tokio::test]
    async fn test_unit_of_work_commits_on_success() {
        let engine = Arc::new(MemoryEngine::new());
        let tenant_id = Uuid::new_v4();

        with_tenant(tenant_id, async {
            engine
                .unit_of_work(|| async {
                    engine
                        .sessions
                        .insert(session_for(tenant_id, "Implement a change"))
                        .await?;
                    Ok(())
                })
                .await
                .unwrap();

            assert_eq!(engine.sessions.count(Query::new()).await.unwrap(), 1);
        })
        .await;
    }
}
