//! Persistence store contract
//!
//! An ordered, transactional record store for sessions, tasks, agents, and
//! tenants. The contract is backend-neutral: every operation is expressed
//! against the [`Store`] trait and the in-memory engine in [`memory`] is the
//! reference implementation. Mutations obey optimistic locking through the
//! record's `version` column; reads are tenant-scoped through the call
//! context and exclude soft-deleted rows by default.

pub mod memory;
pub mod repository;

pub use memory::{MemoryEngine, MemoryStore};
pub use repository::{
    AgentRepository, SessionListFilter, SessionRepository, TaskRepository, TenantRepository,
};

use crate::models::{Agent, Session, Task, Tenant};
use crate::Result;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use uuid::Uuid;

/// A persisted record: identity, tenancy, soft deletion, optimistic version.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Entity name used in error messages and cache keys.
    const NAME: &'static str;

    fn id(&self) -> Uuid;
    fn tenant_id(&self) -> Uuid;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
    fn deleted_at(&self) -> Option<DateTime<Utc>>;
    fn set_deleted_at(&mut self, at: Option<DateTime<Utc>>);
    fn touch(&mut self);
}

macro_rules! impl_entity {
    ($type:ty, $name:literal, $tenant:expr) => {
        impl Entity for $type {
            const NAME: &'static str = $name;

            fn id(&self) -> Uuid {
                self.id
            }

            fn tenant_id(&self) -> Uuid {
                let scope_of = $tenant;
                scope_of(self)
            }

            fn version(&self) -> u64 {
                self.version
            }

            fn set_version(&mut self, version: u64) {
                self.version = version;
            }

            fn deleted_at(&self) -> Option<DateTime<Utc>> {
                self.deleted_at
            }

            fn set_deleted_at(&mut self, at: Option<DateTime<Utc>>) {
                self.deleted_at = at;
            }

            fn touch(&mut self) {
                self.updated_at = Utc::now();
            }
        }
    };
}

impl_entity!(Session, "session", |s: &Session| s.tenant_id);
impl_entity!(Task, "task", |t: &Task| t.tenant_id);
impl_entity!(Agent, "agent", |a: &Agent| a.tenant_id);
// Tenants are themselves the isolation boundary; they scope to their own id.
impl_entity!(Tenant, "tenant", |t: &Tenant| t.id);

/// Row filter applied inside the store, after tenant scoping.
pub type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Comparator used to order result sets.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Declarative read shape: filter, sort, window, deleted-row visibility.
#[derive(Clone)]
pub struct Query<T> {
    pub predicate: Option<Predicate<T>>,
    pub sort: Option<Comparator<T>>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl<T> Default for Query<T> {
    fn default() -> Self {
        Self {
            predicate: None,
            sort: None,
            include_deleted: false,
            limit: None,
            offset: 0,
        }
    }
}

impl<T> Query<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn sort_by<F>(mut self, comparator: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        self.sort = Some(Arc::new(comparator));
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// One page of a paginated read.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u32 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(self.page_size as u64) as u32
    }
}

/// Backend contract for one record collection.
///
/// `update`, `soft_delete`, and `bulk_update` reject with `STALE_VERSION`
/// when the caller's observed version no longer matches, and increment the
/// version on success.
#[async_trait::async_trait]
pub trait Store<T: Entity>: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<T>>;

    /// Like `get_by_id` but returns soft-deleted rows as well.
    async fn get_by_id_including_deleted(&self, id: Uuid) -> Result<Option<T>>;

    async fn find(&self, query: Query<T>) -> Result<Vec<T>>;

    async fn paginate(&self, query: Query<T>, page: u32, page_size: u32) -> Result<Page<T>>;

    async fn insert(&self, row: T) -> Result<T>;

    async fn update(&self, row: T) -> Result<T>;

    async fn soft_delete(&self, id: Uuid, expected_version: u64) -> Result<()>;

    async fn hard_delete(&self, id: Uuid) -> Result<bool>;

    async fn count(&self, query: Query<T>) -> Result<u64>;

    async fn exists(&self, id: Uuid) -> Result<bool>;

    async fn bulk_insert(&self, rows: Vec<T>) -> Result<Vec<T>>;

    async fn bulk_update(&self, rows: Vec<T>) -> Result<Vec<T>>;
}
