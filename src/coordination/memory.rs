use super::{CoordinationStore, LockRecord};
use crate::{OrchestratorError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::debug;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, Entry>,
    zsets: HashMap<String, HashMap<String, f64>>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl Inner {
    fn prune(&mut self, key: &str, now: Instant) {
        if let Some(entry) = self.kv.get(key) {
            if !entry.live(now) {
                self.kv.remove(key);
            }
        }
    }

    fn live_value(&mut self, key: &str, now: Instant) -> Option<&Entry> {
        self.prune(key, now);
        self.kv.get(key)
    }
}

/// Single-process implementation of the coordination contract
///
/// Everything sits behind one table mutex, which is exactly what makes the
/// named lock/load operations atomic. TTLs are enforced lazily on access.
/// The authoritative engine for tests; production cross-node deployments use
/// the Redis backend behind the same trait.
pub struct MemoryCoordinationStore {
    inner: Arc<Mutex<Inner>>,
    failing: Arc<AtomicBool>,
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate a coordination outage: while set, every operation fails
    /// with `COORDINATION_UNAVAILABLE`. Drives the circuit-breaker paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OrchestratorError::CoordinationUnavailable(
                "simulated outage".to_string(),
            ));
        }
        Ok(())
    }

    fn parse_record(value: &str) -> Option<LockRecord> {
        serde_json::from_str(value).ok()
    }
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner
            .live_value(key, Instant::now())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if inner.live_value(key, now).is_some() {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.prune(key, Instant::now());
        Ok(inner.kv.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.live_value(key, now).is_some() {
            true => {
                if let Some(entry) = inner.kv.get_mut(key) {
                    entry.expires_at = Some(now + ttl);
                }
                Ok(true)
            }
            false => Ok(false),
        }
    }

    async fn incr_by_ex(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let current = inner
            .live_value(key, now)
            .and_then(|entry| entry.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        // Keep the original expiry; only a fresh key gets the TTL.
        let expires_at = inner
            .kv
            .get(key)
            .and_then(|entry| entry.expires_at)
            .unwrap_or(now + ttl);
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(next)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut members: Vec<(String, f64)> = inner
            .zsets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let len = members.len() as isize;
        let resolve = |index: isize| -> isize {
            if index < 0 {
                (len + index).max(0)
            } else {
                index
            }
        };
        let from = resolve(start).min(len);
        let to = (resolve(stop) + 1).min(len);
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(members[from as usize..to as usize].to_vec())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let removed = inner
            .zsets
            .get_mut(key)
            .map(|set| set.remove(member).is_some())
            .unwrap_or(false);
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.zsets.get(key).map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        match inner.channels.get(channel) {
            Some(sender) => Ok(sender.send(payload.to_string()).unwrap_or(0) as u64),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let sender = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(crate::constants::EVENT_CHANNEL_CAPACITY).0)
            .clone();
        drop(inner);

        let (tx, rx) = mpsc::channel(crate::constants::EVENT_CHANNEL_CAPACITY);
        let mut source = sender.subscribe();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("coordination subscriber lagged, dropped {missed} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn acquire_lock(&self, key: &str, record: &LockRecord, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        if let Some(entry) = inner.live_value(key, now) {
            // An abandoned holder whose record-level expiry passed is evicted
            // before the set, even if the physical TTL has not fired yet.
            let abandoned = Self::parse_record(&entry.value)
                .map(|held| held.is_expired(Utc::now()))
                .unwrap_or(true);
            if !abandoned {
                return Ok(false);
            }
            inner.kv.remove(key);
        }

        inner.kv.insert(
            key.to_string(),
            Entry {
                value: serde_json::to_string(record)?,
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn renew_lock(
        &self,
        key: &str,
        owner_id: &str,
        extend: Duration,
    ) -> Result<Option<LockRecord>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let Some(entry) = inner.live_value(key, now) else {
            return Ok(None);
        };
        let Some(mut record) = Self::parse_record(&entry.value) else {
            return Ok(None);
        };
        if record.owner_id != owner_id {
            return Ok(None);
        }

        record.expires_at = Utc::now()
            + chrono::Duration::from_std(extend).unwrap_or_else(|_| chrono::Duration::zero());
        record.expires_at_ms = record.expires_at.timestamp_millis();
        record.renewal_count += 1;
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: serde_json::to_string(&record)?,
                expires_at: Some(now + extend),
            },
        );
        Ok(Some(record))
    }

    async fn release_lock(&self, key: &str, owner_id: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let owned = inner
            .live_value(key, now)
            .and_then(|entry| Self::parse_record(&entry.value))
            .map(|record| record.owner_id == owner_id)
            .unwrap_or(false);
        if owned {
            inner.kv.remove(key);
        }
        Ok(owned)
    }

    async fn reserve_load(&self, key: &str, amount: f64, capacity: f64) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let current = inner
            .live_value(key, now)
            .and_then(|entry| entry.value.parse::<f64>().ok())
            .unwrap_or(0.0);
        if current + amount > capacity + f64::EPSILON {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: (current + amount).to_string(),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn release_load(&self, key: &str, amount: f64) -> Result<f64> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let current = inner
            .live_value(key, now)
            .and_then(|entry| entry.value.parse::<f64>().ok())
            .unwrap_or(0.0);
        let next = (current - amount).max(0.0);
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_respects_existing_key() {
        let store = MemoryCoordinationStore::new();
        assert!(store
            .set_nx_ex("lock:r", "a", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!store
            .set_nx_ex("lock:r", "b", Duration::from_secs(5))
            .await
            .unwrap());
        assert_eq!(store.get("lock:r").await.unwrap().unwrap(), "a");
    }

    #[tokio::test]
    async fn test_ttl_expiry_frees_key() {
        let store = MemoryCoordinationStore::new();
        store
            .set_nx_ex("lock:r", "a", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("lock:r").await.unwrap().is_none());
        assert!(store
            .set_nx_ex("lock:r", "b", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_incr_keeps_original_window() {
        let store = MemoryCoordinationStore::new();
        let first = store
            .incr_by_ex("tenant_tokens:t", 100, Duration::from_secs(60))
            .await
            .unwrap();
        let second = store
            .incr_by_ex("tenant_tokens:t", 50, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(first, 100);
        assert_eq!(second, 150);
    }

    #[tokio::test]
    async fn test_zset_ordering_and_range() {
        let store = MemoryCoordinationStore::new();
        store.zadd("queue", "c", 3.0).await.unwrap();
        store.zadd("queue", "a", 1.0).await.unwrap();
        store.zadd("queue", "b", 2.0).await.unwrap();

        let all = store.zrange_withscores("queue", 0, -1).await.unwrap();
        assert_eq!(
            all.iter().map(|(m, _)| m.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );

        let head = store.zrange_withscores("queue", 0, 0).await.unwrap();
        assert_eq!(head[0].0, "a");

        assert!(store.zrem("queue", "a").await.unwrap());
        assert_eq!(store.zcard("queue").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_zset_ties_break_on_member() {
        let store = MemoryCoordinationStore::new();
        store.zadd("queue", "later", 1.0).await.unwrap();
        store.zadd("queue", "early", 1.0).await.unwrap();
        let all = store.zrange_withscores("queue", 0, -1).await.unwrap();
        assert_eq!(all[0].0, "early");
    }

    #[tokio::test]
    async fn test_acquire_takes_over_abandoned_lock() {
        let store = MemoryCoordinationStore::new();
        // Holder record already expired at the record level, physical TTL not.
        let mut stale = LockRecord::new("node-a", Duration::from_secs(60));
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store
            .set(
                "lock:r",
                &serde_json::to_string(&stale).unwrap(),
                Some(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let fresh = LockRecord::new("node-b", Duration::from_secs(30));
        assert!(store
            .acquire_lock("lock:r", &fresh, Duration::from_secs(30))
            .await
            .unwrap());
        let held: LockRecord =
            serde_json::from_str(&store.get("lock:r").await.unwrap().unwrap()).unwrap();
        assert_eq!(held.owner_id, "node-b");
    }

    #[tokio::test]
    async fn test_renew_is_owner_checked() {
        let store = MemoryCoordinationStore::new();
        let record = LockRecord::new("node-a", Duration::from_secs(30));
        store
            .acquire_lock("lock:r", &record, Duration::from_secs(30))
            .await
            .unwrap();

        let renewed = store
            .renew_lock("lock:r", "node-a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renewed.renewal_count, 1);

        assert!(store
            .renew_lock("lock:r", "node-b", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_release_is_owner_checked() {
        let store = MemoryCoordinationStore::new();
        let record = LockRecord::new("node-a", Duration::from_secs(30));
        store
            .acquire_lock("lock:r", &record, Duration::from_secs(30))
            .await
            .unwrap();

        assert!(!store.release_lock("lock:r", "node-b").await.unwrap());
        assert!(store.get("lock:r").await.unwrap().is_some());
        assert!(store.release_lock("lock:r", "node-a").await.unwrap());
        assert!(store.get("lock:r").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acquire_release_leaves_no_residual_keys() {
        let store = MemoryCoordinationStore::new();
        let record = LockRecord::new("node-a", Duration::from_secs(30));
        assert!(store
            .acquire_lock("lock:r", &record, Duration::from_secs(30))
            .await
            .unwrap());
        assert!(store.release_lock("lock:r", "node-a").await.unwrap());
        assert!(store.get("lock:r").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reserve_load_enforces_capacity() {
        let store = MemoryCoordinationStore::new();
        assert!(store
            .reserve_load("agent_load:a", 3.0, 5.0)
            .await
            .unwrap());
        assert!(!store
            .reserve_load("agent_load:a", 3.0, 5.0)
            .await
            .unwrap());
        assert!(store
            .reserve_load("agent_load:a", 2.0, 5.0)
            .await
            .unwrap());

        let remaining = store.release_load("agent_load:a", 4.0).await.unwrap();
        assert!((remaining - 1.0).abs() < 1e-9);
        let floored = store.release_load("agent_load:a", 10.0).await.unwrap();
        assert_eq!(floored, 0.0);
    }

    #[tokio::test]
    async fn test_pubsub_delivers_in_order() {
        let store = MemoryCoordinationStore::new();
        let mut rx = store.subscribe("events:t1").await.unwrap();
        // Give the forwarder a tick to attach.
        tokio::time::sleep(Duration::from_millis(5)).await;

        store.publish("events:t1", "one").await.unwrap();
        store.publish("events:t1", "two").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_simulated_outage_fails_fast() {
        let store = MemoryCoordinationStore::new();
        store.set_failing(true);
        let err = store.get("k").await.unwrap_err();
        assert_eq!(err.code(), "COORDINATION_UNAVAILABLE");
        store.set_failing(false);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
