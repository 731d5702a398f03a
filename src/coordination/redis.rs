use super::{CoordinationStore, LockRecord};
use crate::{OrchestratorError, Result};
use chrono::Utc;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Redis-backed implementation of the coordination contract
///
/// The named lock/load operations run as server-side Lua scripts so the
/// check-and-mutate step is a single round trip with no interleaving.
/// Connection failures surface as `COORDINATION_UNAVAILABLE`; the lock
/// manager's circuit breaker decides what to do with them.
pub struct RedisCoordinationStore {
    client: redis::Client,
    manager: ConnectionManager,
    acquire_script: Script,
    renew_script: Script,
    release_script: Script,
    reserve_script: Script,
    release_load_script: Script,
    incr_script: Script,
}

fn coord_err(error: redis::RedisError) -> OrchestratorError {
    OrchestratorError::CoordinationUnavailable(error.to_string())
}

const ACQUIRE_LUA: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
  local held = cjson.decode(existing)
  if tonumber(held['expires_at_ms']) > tonumber(ARGV[2]) then
    return 0
  end
  redis.call('DEL', KEYS[1])
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[3])
return 1
"#;

const RENEW_LUA: &str = r#"
local existing = redis.call('GET', KEYS[1])
if not existing then
  return false
end
local held = cjson.decode(existing)
if held['owner_id'] ~= ARGV[1] then
  return false
end
held['expires_at'] = ARGV[2]
held['expires_at_ms'] = tonumber(ARGV[3])
held['renewal_count'] = held['renewal_count'] + 1
local encoded = cjson.encode(held)
redis.call('SET', KEYS[1], encoded, 'PX', ARGV[4])
return encoded
"#;

const RELEASE_LUA: &str = r#"
local existing = redis.call('GET', KEYS[1])
if not existing then
  return 0
end
local held = cjson.decode(existing)
if held['owner_id'] ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

const RESERVE_LUA: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
if current + amount > tonumber(ARGV[2]) then
  return 0
end
redis.call('SET', KEYS[1], tostring(current + amount))
return 1
"#;

const RELEASE_LOAD_LUA: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local remaining = current - tonumber(ARGV[1])
if remaining < 0 then
  remaining = 0
end
redis.call('SET', KEYS[1], tostring(remaining))
return tostring(remaining)
"#;

const INCR_EX_LUA: &str = r#"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return value
"#;

impl RedisCoordinationStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(coord_err)?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(coord_err)?;
        debug!("connected coordination store at {url}");
        Ok(Self {
            client,
            manager,
            acquire_script: Script::new(ACQUIRE_LUA),
            renew_script: Script::new(RENEW_LUA),
            release_script: Script::new(RELEASE_LUA),
            reserve_script: Script::new(RESERVE_LUA),
            release_load_script: Script::new(RELEASE_LOAD_LUA),
            incr_script: Script::new(INCR_EX_LUA),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait::async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let set: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(set > 0)
    }

    async fn incr_by_ex(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn();
        let value: i64 = self
            .incr_script
            .key(key)
            .arg(delta)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(value)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(())
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn();
        let members: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        let count: u64 = redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(count)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let mut conn = self.conn();
        let receivers: u64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        #[allow(deprecated)]
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(coord_err)?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await.map_err(coord_err)?;

        let channel = channel.to_string();
        let (tx, rx) = mpsc::channel(crate::constants::EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!("dropping undecodable message on {channel}: {error}");
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn acquire_lock(&self, key: &str, record: &LockRecord, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let payload = serde_json::to_string(record)?;
        let admitted: i64 = self
            .acquire_script
            .key(key)
            .arg(payload)
            .arg(Utc::now().timestamp_millis())
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(admitted == 1)
    }

    async fn renew_lock(
        &self,
        key: &str,
        owner_id: &str,
        extend: Duration,
    ) -> Result<Option<LockRecord>> {
        let mut conn = self.conn();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(extend).unwrap_or_else(|_| chrono::Duration::zero());
        let encoded: Option<String> = self
            .renew_script
            .key(key)
            .arg(owner_id)
            .arg(expires_at.to_rfc3339())
            .arg(expires_at.timestamp_millis())
            .arg(extend.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(coord_err)?;
        match encoded {
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }

    async fn release_lock(&self, key: &str, owner_id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let released: i64 = self
            .release_script
            .key(key)
            .arg(owner_id)
            .invoke_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(released == 1)
    }

    async fn reserve_load(&self, key: &str, amount: f64, capacity: f64) -> Result<bool> {
        let mut conn = self.conn();
        let admitted: i64 = self
            .reserve_script
            .key(key)
            .arg(amount)
            .arg(capacity)
            .invoke_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(admitted == 1)
    }

    async fn release_load(&self, key: &str, amount: f64) -> Result<f64> {
        let mut conn = self.conn();
        let remaining: String = self
            .release_load_script
            .key(key)
            .arg(amount)
            .invoke_async(&mut conn)
            .await
            .map_err(coord_err)?;
        remaining
            .parse::<f64>()
            .map_err(|e| OrchestratorError::CoordinationUnavailable(e.to_string()))
    }
}
