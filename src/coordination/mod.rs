//! Coordination store contract
//!
//! An ephemeral key/value store with atomic compare-and-set, TTLs, sorted
//! sets, and pub/sub. It backs the distributed lock, the agent load cache,
//! per-tenant token counters, and cross-node event fan-out under the prefix
//! namespaces `lock:*`, `lock_queue:*`, `lock_metadata:*`, `agent_load:*`,
//! `tenant_tokens:*`, and `events:*`.
//!
//! The named lock/load operations are the store's atomic primitives: a Redis
//! backend runs them as server-side scripts, the in-memory engine under one
//! table mutex. Callers never compose them from weaker reads.

pub mod memory;
pub mod redis;

pub use memory::MemoryCoordinationStore;
pub use redis::RedisCoordinationStore;

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The record stored under `lock:{resource}` while a lock is held.
///
/// `expires_at_ms` mirrors `expires_at` as epoch milliseconds so that
/// server-side scripts can compare expiry without parsing timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockRecord {
    pub lock_id: Uuid,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expires_at_ms: i64,
    pub renewal_count: u32,
}

impl LockRecord {
    pub fn new(owner_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        let expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            lock_id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            acquired_at: now,
            expires_at,
            expires_at_ms: expires_at.timestamp_millis(),
            renewal_count: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Backend contract for the coordination store.
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set only if the key is absent, with an expiry. Returns whether the
    /// write happened.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Increment a counter, attaching the TTL when the key is created.
    async fn incr_by_ex(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Members ordered by ascending (score, member), inclusive index range;
    /// `-1` addresses the last element.
    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    async fn zcard(&self, key: &str) -> Result<u64>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64>;

    /// Subscribe to a channel. Messages arrive on the returned receiver
    /// until it is dropped; delivery is best-effort.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;

    /// Take the lock if the key is free or its current record has expired.
    async fn acquire_lock(&self, key: &str, record: &LockRecord, ttl: Duration) -> Result<bool>;

    /// Owner-checked renewal: extend expiry and bump `renewal_count`.
    /// Returns the updated record, or `None` when the lock is missing or
    /// owned by someone else.
    async fn renew_lock(
        &self,
        key: &str,
        owner_id: &str,
        extend: Duration,
    ) -> Result<Option<LockRecord>>;

    /// Owner-checked delete. Returns whether this owner held the lock.
    async fn release_lock(&self, key: &str, owner_id: &str) -> Result<bool>;

    /// Atomically add `amount` to a load counter if it stays within
    /// `capacity`. Returns whether the reservation was admitted.
    async fn reserve_load(&self, key: &str, amount: f64, capacity: f64) -> Result<bool>;

    /// Decrement a load counter, flooring at zero. Returns the new value.
    async fn release_load(&self, key: &str, amount: f64) -> Result<f64>;
}
