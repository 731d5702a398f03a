//! Distributed lock built on the coordination store
//!
//! A fair, renewable, owner-verified mutex keyed by resource name. Waiters
//! queue in a priority-ordered sorted set; the head of the queue is the only
//! request allowed to take the key, which makes acquisition order
//! priority-descending with arrival-order tie-breaks. A background heartbeat
//! renews the TTL at a third of its length; an owner whose record-level
//! expiry has passed is treated as abandoned and evicted by the next taker.
//!
//! Store outages trip [`CoordinationBreaker`]; while it is open every
//! acquisition fails fast with `COORDINATION_UNAVAILABLE`.

pub mod circuit_breaker;

pub use circuit_breaker::{BreakerConfig, BreakerState, CoordinationBreaker};

use crate::coordination::{CoordinationStore, LockRecord};
use crate::{OrchestratorError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Separation between priority bands in queue scores. Arrival sequence
/// numbers stay far below this, so priority always dominates.
const PRIORITY_BAND: f64 = 1e12;

fn lock_key(resource: &str) -> String {
    format!("lock:{resource}")
}

fn queue_key(resource: &str) -> String {
    format!("lock_queue:{resource}")
}

fn waiting_key(owner_id: &str) -> String {
    format!("lock_metadata:waiting:{owner_id}")
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub acquire_timeout: Duration,
    pub lock_ttl: Duration,
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(crate::constants::LOCK_ACQUIRE_TIMEOUT_SECS),
            lock_ttl: Duration::from_secs(crate::constants::LOCK_TTL_SECS),
            retry_interval: Duration::from_millis(crate::constants::LOCK_RETRY_INTERVAL_MS),
        }
    }
}

/// Per-acquisition options; unset fields fall back to the manager config.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub timeout: Option<Duration>,
    pub blocking: bool,
    pub ttl: Option<Duration>,
    pub priority: i64,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            blocking: true,
            ttl: None,
            priority: 0,
        }
    }
}

impl AcquireOptions {
    pub fn with_priority(priority: i64) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn non_blocking() -> Self {
        Self {
            blocking: false,
            ..Self::default()
        }
    }
}

/// Manager for distributed locks over one coordination store.
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    breaker: Arc<CoordinationBreaker>,
    config: LockConfig,
    node_id: String,
    arrival_seq: AtomicU64,
    /// In-process view of which owner holds which resources, for lock
    /// ordering checks and diagnostics.
    held: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl LockManager {
    pub fn new(store: Arc<dyn CoordinationStore>, config: LockConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            breaker: Arc::new(CoordinationBreaker::default()),
            config,
            node_id: format!("node-{}", Uuid::new_v4().simple()),
            arrival_seq: AtomicU64::new(0),
            held: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn with_breaker(
        store: Arc<dyn CoordinationStore>,
        config: LockConfig,
        breaker: Arc<CoordinationBreaker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            breaker,
            config,
            node_id: format!("node-{}", Uuid::new_v4().simple()),
            arrival_seq: AtomicU64::new(0),
            held: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn breaker(&self) -> Arc<CoordinationBreaker> {
        self.breaker.clone()
    }

    /// Acquire with a fresh owner identity (the common single-lock case).
    pub async fn acquire(&self, resource: &str, options: AcquireOptions) -> Result<LockGuard> {
        let owner_id = format!("{}:{}", self.node_id, Uuid::new_v4().simple());
        self.acquire_as(&owner_id, resource, options).await
    }

    /// Acquire on behalf of a named owner. Owners holding several locks must
    /// acquire them in ascending resource-name order.
    pub async fn acquire_as(
        &self,
        owner_id: &str,
        resource: &str,
        options: AcquireOptions,
    ) -> Result<LockGuard> {
        if !self.breaker.allow_request().await {
            return Err(OrchestratorError::CoordinationUnavailable(
                "circuit breaker open".to_string(),
            ));
        }

        self.check_lock_ordering(owner_id, resource).await;

        let ttl = options.ttl.unwrap_or(self.config.lock_ttl);
        let timeout = options.timeout.unwrap_or(self.config.acquire_timeout);
        let deadline = Instant::now() + timeout;
        let deadline_ms = chrono::Utc::now().timestamp_millis() + timeout.as_millis() as i64;

        let request_id = Uuid::new_v4().simple().to_string();
        let member = format!("{request_id}:{deadline_ms}");
        let sequence = self.arrival_seq.fetch_add(1, Ordering::SeqCst);
        let score = -(options.priority as f64) * PRIORITY_BAND + sequence as f64;

        let queue = queue_key(resource);
        self.track(self.store.zadd(&queue, &member, score).await)?;

        loop {
            self.prune_queue(&queue).await?;

            if self.is_queue_head(&queue, &request_id).await? {
                let record = LockRecord::new(owner_id, ttl);
                match self.store.acquire_lock(&lock_key(resource), &record, ttl).await {
                    Ok(true) => {
                        let _ = self.store.zrem(&queue, &member).await;
                        let _ = self.store.delete(&waiting_key(owner_id)).await;
                        self.breaker.record_success().await;
                        return Ok(self.build_guard(owner_id, resource, record, ttl).await);
                    }
                    Ok(false) => {}
                    Err(error) => {
                        self.breaker.record_failure().await;
                        let _ = self.store.zrem(&queue, &member).await;
                        return Err(error);
                    }
                }
            }

            if !options.blocking {
                let _ = self.store.zrem(&queue, &member).await;
                return Err(OrchestratorError::LockTimeout {
                    resource: resource.to_string(),
                });
            }

            // Publish what we are waiting for, then look for a circular wait
            // through the holders' own waiting markers.
            let _ = self
                .store
                .set(
                    &waiting_key(owner_id),
                    resource,
                    Some(self.config.retry_interval * 20),
                )
                .await;
            if self.detect_deadlock(owner_id, resource).await? {
                let _ = self.store.zrem(&queue, &member).await;
                let _ = self.store.delete(&waiting_key(owner_id)).await;
                return Err(OrchestratorError::DeadlockDetected {
                    resource: resource.to_string(),
                });
            }

            if Instant::now() >= deadline {
                let _ = self.store.zrem(&queue, &member).await;
                let _ = self.store.delete(&waiting_key(owner_id)).await;
                return Err(OrchestratorError::LockTimeout {
                    resource: resource.to_string(),
                });
            }

            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// Resources currently held by an owner, from the in-process view.
    pub async fn held_by(&self, owner_id: &str) -> Vec<String> {
        let held = self.held.read().await;
        held.get(owner_id)
            .map(|set| {
                let mut resources: Vec<String> = set.iter().cloned().collect();
                resources.sort();
                resources
            })
            .unwrap_or_default()
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(OrchestratorError::CoordinationUnavailable(_))) {
            let breaker = self.breaker.clone();
            tokio::spawn(async move { breaker.record_failure().await });
        }
        result
    }

    async fn check_lock_ordering(&self, owner_id: &str, resource: &str) {
        let held = self.held.read().await;
        if let Some(resources) = held.get(owner_id) {
            if resources.iter().any(|existing| existing.as_str() > resource) {
                warn!(
                    "owner {owner_id} acquiring '{resource}' out of ascending order while holding {:?}",
                    resources
                );
            }
        }
    }

    /// Drop queue entries whose embedded deadline has passed.
    async fn prune_queue(&self, queue: &str) -> Result<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let entries = self.store.zrange_withscores(queue, 0, -1).await?;
        for (member, _) in entries {
            let expired = member
                .rsplit_once(':')
                .and_then(|(_, deadline)| deadline.parse::<i64>().ok())
                .map(|deadline| deadline < now_ms)
                .unwrap_or(true);
            if expired {
                let _ = self.store.zrem(queue, &member).await;
            }
        }
        Ok(())
    }

    async fn is_queue_head(&self, queue: &str, request_id: &str) -> Result<bool> {
        let head = self.store.zrange_withscores(queue, 0, 0).await?;
        Ok(head
            .first()
            .map(|(member, _)| member.starts_with(request_id))
            .unwrap_or(false))
    }

    /// Walk the wait-for graph starting from the resource this owner wants.
    /// Returns true when the walk leads back to the owner.
    async fn detect_deadlock(&self, owner_id: &str, resource: &str) -> Result<bool> {
        let mut current = resource.to_string();
        for _ in 0..crate::constants::DEADLOCK_SCAN_DEPTH {
            let holder = match self.store.get(&lock_key(&current)).await? {
                Some(value) => match serde_json::from_str::<LockRecord>(&value) {
                    Ok(record) => record.owner_id,
                    Err(_) => return Ok(false),
                },
                None => return Ok(false),
            };
            if holder == owner_id {
                return Ok(true);
            }
            current = match self.store.get(&waiting_key(&holder)).await? {
                Some(resource) => resource,
                None => return Ok(false),
            };
        }
        Ok(false)
    }

    async fn build_guard(
        &self,
        owner_id: &str,
        resource: &str,
        record: LockRecord,
        ttl: Duration,
    ) -> LockGuard {
        {
            let mut held = self.held.write().await;
            held.entry(owner_id.to_string())
                .or_default()
                .insert(resource.to_string());
        }

        let released = Arc::new(AtomicBool::new(false));
        let lost = Arc::new(AtomicBool::new(false));
        let renew_handle = self.spawn_renewal(owner_id, resource, ttl, released.clone(), lost.clone());

        debug!("lock '{resource}' acquired by {owner_id} (lock_id {})", record.lock_id);
        LockGuard {
            resource: resource.to_string(),
            owner_id: owner_id.to_string(),
            lock_id: record.lock_id,
            store: self.store.clone(),
            breaker: self.breaker.clone(),
            held: self.held.clone(),
            released,
            lost,
            renew_handle: Some(renew_handle),
        }
    }

    fn spawn_renewal(
        &self,
        owner_id: &str,
        resource: &str,
        ttl: Duration,
        released: Arc<AtomicBool>,
        lost: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let breaker = self.breaker.clone();
        let owner_id = owner_id.to_string();
        let key = lock_key(resource);
        let resource = resource.to_string();
        let interval = ttl / 3;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if released.load(Ordering::SeqCst) {
                    break;
                }
                match store.renew_lock(&key, &owner_id, ttl).await {
                    Ok(Some(record)) => {
                        breaker.record_success().await;
                        debug!(
                            "lock '{resource}' renewed by {owner_id} (renewal {})",
                            record.renewal_count
                        );
                    }
                    Ok(None) => {
                        warn!("lock '{resource}' lost by {owner_id}, stopping heartbeat");
                        lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(error) => {
                        // Transient outage: keep trying until the TTL decides.
                        breaker.record_failure().await;
                        warn!("lock '{resource}' renewal failed: {error}");
                    }
                }
            }
        })
    }
}

/// Proof of lock ownership. Release explicitly via [`LockGuard::release`];
/// dropping the guard triggers a best-effort release.
pub struct LockGuard {
    resource: String,
    owner_id: String,
    lock_id: Uuid,
    store: Arc<dyn CoordinationStore>,
    breaker: Arc<CoordinationBreaker>,
    held: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    released: Arc<AtomicBool>,
    lost: Arc<AtomicBool>,
    renew_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("owner_id", &self.owner_id)
            .field("lock_id", &self.lock_id)
            .field("released", &self.released)
            .field("lost", &self.lost)
            .finish()
    }
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn lock_id(&self) -> Uuid {
        self.lock_id
    }

    /// Whether the heartbeat observed the lock missing or stolen.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Release the lock. Returns false (without failing) when the lock was
    /// no longer owned at release time.
    pub async fn release(mut self) -> Result<bool> {
        self.release_inner().await
    }

    async fn release_inner(&mut self) -> Result<bool> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(true);
        }
        if let Some(handle) = self.renew_handle.take() {
            handle.abort();
        }
        {
            let mut held = self.held.write().await;
            if let Some(set) = held.get_mut(&self.owner_id) {
                set.remove(&self.resource);
                if set.is_empty() {
                    held.remove(&self.owner_id);
                }
            }
        }
        match self
            .store
            .release_lock(&lock_key(&self.resource), &self.owner_id)
            .await
        {
            Ok(true) => {
                debug!("lock '{}' released by {}", self.resource, self.owner_id);
                Ok(true)
            }
            Ok(false) => {
                warn!(
                    "release of lock '{}' by {} found it not owned",
                    self.resource, self.owner_id
                );
                Ok(false)
            }
            Err(error) => {
                self.breaker.record_failure().await;
                Err(error)
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.renew_handle.take() {
            handle.abort();
        }
        let store = self.store.clone();
        let held = self.held.clone();
        let resource = self.resource.clone();
        let owner_id = self.owner_id.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                {
                    let mut held = held.write().await;
                    if let Some(set) = held.get_mut(&owner_id) {
                        set.remove(&resource);
                        if set.is_empty() {
                            held.remove(&owner_id);
                        }
                    }
                }
                let _ = store.release_lock(&lock_key(&resource), &owner_id).await;
            });
        }
    }
}
