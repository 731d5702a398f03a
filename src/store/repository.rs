use super::{Page, Query, Store};
use crate::models::{
    Agent, Priority, Session, SessionStatus, SessionType, Task, Tenant, TenantQuotas,
};
use crate::{OrchestratorError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Per-repository read cache
///
/// Keys follow the `id:{uuid}` / `list:{shape}` convention; any mutation
/// invalidates the touched id and every `list:*` key, so list reads never
/// observe a stale world after a write.
struct RepoCache<T: Clone> {
    entries: Arc<RwLock<HashMap<String, CacheSlot<T>>>>,
}

#[derive(Clone)]
enum CacheSlot<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> RepoCache<T> {
    fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_one(&self, key: &str) -> Option<T> {
        match self.entries.read().await.get(key) {
            Some(CacheSlot::One(value)) => Some(value.clone()),
            _ => None,
        }
    }

    async fn get_many(&self, key: &str) -> Option<Vec<T>> {
        match self.entries.read().await.get(key) {
            Some(CacheSlot::Many(values)) => Some(values.clone()),
            _ => None,
        }
    }

    async fn put_one(&self, key: String, value: T) {
        self.entries.write().await.insert(key, CacheSlot::One(value));
    }

    async fn put_many(&self, key: String, values: Vec<T>) {
        self.entries
            .write()
            .await
            .insert(key, CacheSlot::Many(values));
    }

    /// Drop the id entry and every list under this prefix.
    async fn invalidate(&self, id: Uuid) {
        let mut entries = self.entries.write().await;
        entries.remove(&format!("id:{id}"));
        entries.retain(|key, _| !key.starts_with("list:"));
    }
}

/// Filter shape for session list reads, mirroring the query parameters the
/// presentation layer accepts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionListFilter {
    pub status: Option<SessionStatus>,
    pub session_type: Option<SessionType>,
    pub priority: Option<Priority>,
}

impl SessionListFilter {
    fn cache_key(&self, page: u32, page_size: u32) -> String {
        format!(
            "list:{:?}:{:?}:{:?}:{page}:{page_size}",
            self.status, self.session_type, self.priority
        )
    }

    fn matches(&self, session: &Session) -> bool {
        self.status.map(|s| session.status == s).unwrap_or(true)
            && self
                .session_type
                .map(|t| session.session_type == t)
                .unwrap_or(true)
            && self.priority.map(|p| session.priority == p).unwrap_or(true)
    }
}

/// Tenant-scoped session access with caching and full-text search.
#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn Store<Session>>,
    cache: Arc<RepoCache<Session>>,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn Store<Session>>) -> Self {
        Self {
            store,
            cache: Arc::new(RepoCache::new()),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Session> {
        if let Some(cached) = self.cache.get_one(&format!("id:{id}")).await {
            return Ok(cached);
        }
        let session = self
            .store
            .get_by_id(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {id}")))?;
        self.cache
            .put_one(format!("id:{id}"), session.clone())
            .await;
        Ok(session)
    }

    pub async fn try_get(&self, id: Uuid) -> Result<Option<Session>> {
        self.store.get_by_id(id).await
    }

    pub async fn insert(&self, session: Session) -> Result<Session> {
        let session = self.store.insert(session).await?;
        self.cache.invalidate(session.id).await;
        Ok(session)
    }

    pub async fn update(&self, session: Session) -> Result<Session> {
        let session = self.store.update(session).await?;
        self.cache.invalidate(session.id).await;
        debug!("session {} updated to version {}", session.id, session.version);
        Ok(session)
    }

    pub async fn soft_delete(&self, id: Uuid, expected_version: u64) -> Result<()> {
        self.store.soft_delete(id, expected_version).await?;
        self.cache.invalidate(id).await;
        Ok(())
    }

    pub async fn list(
        &self,
        filter: SessionListFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Page<Session>> {
        let key = filter.cache_key(page, page_size);
        if let Some(items) = self.cache.get_many(&key).await {
            // Cached pages keep their window but recount lazily.
            return Ok(Page {
                total: items.len() as u64,
                items,
                page,
                page_size,
            });
        }

        let query = Query::new()
            .filter(move |session: &Session| filter.matches(session))
            .sort_by(|a: &Session, b: &Session| b.created_at.cmp(&a.created_at));
        let result = self.store.paginate(query, page, page_size).await?;
        self.cache.put_many(key, result.items.clone()).await;
        Ok(result)
    }

    /// Sessions of the current tenant in any non-terminal state.
    pub async fn active_count(&self) -> Result<u64> {
        self.store
            .count(Query::new().filter(|session: &Session| !session.status.is_terminal()))
            .await
    }

    /// Token-AND full-text match over title and initial prompt.
    pub async fn search(&self, text: &str) -> Result<Vec<Session>> {
        let needles: Vec<String> = text
            .split_whitespace()
            .map(|token| token.to_lowercase())
            .filter(|token| !token.is_empty())
            .collect();
        if needles.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .find(Query::new().filter(move |session: &Session| {
                let haystack =
                    format!("{} {}", session.title, session.initial_prompt).to_lowercase();
                needles.iter().all(|needle| haystack.contains(needle))
            }))
            .await
    }
}

/// Tenant-scoped task access; maintains the parent/child denormalization.
#[derive(Clone)]
pub struct TaskRepository {
    store: Arc<dyn Store<Task>>,
}

impl TaskRepository {
    pub fn new(store: Arc<dyn Store<Task>>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: Uuid) -> Result<Task> {
        self.store
            .get_by_id(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {id}")))
    }

    /// Insert a task, registering it in its parent's child list.
    pub async fn insert(&self, task: Task) -> Result<Task> {
        let task = self.store.insert(task).await?;
        if let Some(parent_id) = task.parent_task_id {
            self.attach_child(parent_id, task.id).await?;
        }
        Ok(task)
    }

    pub async fn update(&self, task: Task) -> Result<Task> {
        self.store.update(task).await
    }

    /// Move a task under a new parent, keeping both child lists consistent.
    pub async fn reparent(&self, task_id: Uuid, new_parent: Option<Uuid>) -> Result<Task> {
        let mut task = self.get(task_id).await?;
        let old_parent = task.parent_task_id;
        if old_parent == new_parent {
            return Ok(task);
        }

        task.parent_task_id = new_parent;
        let task = self.store.update(task).await?;

        if let Some(parent_id) = old_parent {
            self.detach_child(parent_id, task_id).await?;
        }
        if let Some(parent_id) = new_parent {
            self.attach_child(parent_id, task_id).await?;
        }
        Ok(task)
    }

    pub async fn soft_delete(&self, id: Uuid, expected_version: u64) -> Result<()> {
        let task = self.get(id).await?;
        self.store.soft_delete(id, expected_version).await?;
        if let Some(parent_id) = task.parent_task_id {
            self.detach_child(parent_id, id).await?;
        }
        Ok(())
    }

    pub async fn list_by_session(&self, session_id: Uuid) -> Result<Vec<Task>> {
        self.store
            .find(
                Query::new()
                    .filter(move |task: &Task| task.session_id == session_id)
                    .sort_by(|a: &Task, b: &Task| {
                        a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))
                    }),
            )
            .await
    }

    pub async fn children_of(&self, parent_id: Uuid) -> Result<Vec<Task>> {
        self.store
            .find(Query::new().filter(move |task: &Task| task.parent_task_id == Some(parent_id)))
            .await
    }

    async fn attach_child(&self, parent_id: Uuid, child_id: Uuid) -> Result<()> {
        let mut parent = self.get(parent_id).await?;
        if !parent.children.contains(&child_id) {
            parent.children.push(child_id);
            self.store.update(parent).await?;
        }
        Ok(())
    }

    async fn detach_child(&self, parent_id: Uuid, child_id: Uuid) -> Result<()> {
        match self.store.get_by_id(parent_id).await? {
            Some(mut parent) => {
                parent.children.retain(|id| *id != child_id);
                self.store.update(parent).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Tenant-scoped agent access.
#[derive(Clone)]
pub struct AgentRepository {
    store: Arc<dyn Store<Agent>>,
    cache: Arc<RepoCache<Agent>>,
}

impl AgentRepository {
    pub fn new(store: Arc<dyn Store<Agent>>) -> Self {
        Self {
            store,
            cache: Arc::new(RepoCache::new()),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Agent> {
        if let Some(cached) = self.cache.get_one(&format!("id:{id}")).await {
            return Ok(cached);
        }
        let agent = self
            .store
            .get_by_id(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent {id}")))?;
        self.cache.put_one(format!("id:{id}"), agent.clone()).await;
        Ok(agent)
    }

    pub async fn insert(&self, agent: Agent) -> Result<Agent> {
        let agent = self.store.insert(agent).await?;
        self.cache.invalidate(agent.id).await;
        Ok(agent)
    }

    pub async fn update(&self, agent: Agent) -> Result<Agent> {
        let agent = self.store.update(agent).await?;
        self.cache.invalidate(agent.id).await;
        Ok(agent)
    }

    pub async fn soft_delete(&self, id: Uuid, expected_version: u64) -> Result<()> {
        self.store.soft_delete(id, expected_version).await?;
        self.cache.invalidate(id).await;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Agent>> {
        if let Some(cached) = self.cache.get_many("list:all").await {
            return Ok(cached);
        }
        let agents = self
            .store
            .find(Query::new().sort_by(|a: &Agent, b: &Agent| a.created_at.cmp(&b.created_at)))
            .await?;
        self.cache
            .put_many("list:all".to_string(), agents.clone())
            .await;
        Ok(agents)
    }

    pub async fn list_active(&self) -> Result<Vec<Agent>> {
        self.store
            .find(Query::new().filter(|agent: &Agent| agent.is_active && !agent.maintenance_mode))
            .await
    }

    pub async fn count(&self) -> Result<u64> {
        self.store.count(Query::new()).await
    }
}

/// Global (unscoped) tenant access. Tenants are provisioned out-of-band;
/// the core reads them and edits quotas only.
#[derive(Clone)]
pub struct TenantRepository {
    store: Arc<dyn Store<Tenant>>,
}

impl TenantRepository {
    pub fn new(store: Arc<dyn Store<Tenant>>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: Uuid) -> Result<Tenant> {
        self.store
            .get_by_id(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("tenant {id}")))
    }

    pub async fn insert(&self, tenant: Tenant) -> Result<Tenant> {
        self.store.insert(tenant).await
    }

    pub async fn list(&self) -> Result<Vec<Tenant>> {
        self.store
            .find(Query::new().sort_by(|a: &Tenant, b: &Tenant| a.id.cmp(&b.id)))
            .await
    }

    pub async fn update_quotas(&self, id: Uuid, quotas: TenantQuotas) -> Result<Tenant> {
        let mut tenant = self.get(id).await?;
        tenant.quotas = quotas;
        self.store.update(tenant).await
    }
}
