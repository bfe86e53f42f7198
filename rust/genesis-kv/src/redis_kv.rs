//! Redis-compatible KV backend
//!
//! Every multi-key mutation runs as a Lua script so that concurrent
//! control-plane instances sharing the backend observe atomic queue moves
//! and cannot overshoot governor caps.

use async_trait::async_trait;
use futures::StreamExt;
use genesis_types::{ControlError, ControlResult, JobId, QueueName};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::mpsc;
use tracing::warn;

use crate::{keys, DequeuedJob, KvStore};

const ENQUEUE: &str = r#"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
if tonumber(ARGV[4]) <= tonumber(ARGV[5]) then
  redis.call('ZADD', KEYS[3], ARGV[6], ARGV[1])
else
  redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
end
return 1
"#;

const DEQUEUE: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, 128)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  local prio = tonumber(redis.call('HGET', KEYS[5], id) or '5')
  redis.call('ZADD', KEYS[2], prio * 1e13 + now, id)
end
local popped = redis.call('ZPOPMIN', KEYS[2], 1)
if #popped == 0 then return false end
local id = popped[1]
local payload = redis.call('HGET', KEYS[4], id)
if not payload then return false end
redis.call('ZADD', KEYS[3], now + tonumber(ARGV[2]), id)
return {id, payload}
"#;

const ACK: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return 1
"#;

const RETRY: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
return 1
"#;

const DEAD_LETTER: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
redis.call('HSET', KEYS[5], ARGV[1], ARGV[2])
return 1
"#;

const RECLAIM: &str = r#"
local now = tonumber(ARGV[1])
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, 128)
local n = 0
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[1], id)
  if redis.call('HEXISTS', KEYS[2], id) == 1 then
    local prio = tonumber(redis.call('HGET', KEYS[3], id) or '5')
    redis.call('ZADD', KEYS[4], prio * 1e13 + now, id)
    n = n + 1
  end
end
return n
"#;

const TRY_ACQUIRE: &str = r#"
for i, key in ipairs(KEYS) do
  local current = tonumber(redis.call('GET', key) or '0')
  if current >= tonumber(ARGV[i]) then return 0 end
end
for _, key in ipairs(KEYS) do
  redis.call('INCR', key)
end
return 1
"#;

const RELEASE: &str = r#"
for _, key in ipairs(KEYS) do
  local current = tonumber(redis.call('GET', key) or '0')
  if current > 0 then redis.call('DECR', key) end
end
return 1
"#;

const RATE_ACQUIRE: &str = r#"
local window = tonumber(ARGV[1])
local max = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count < max then
  redis.call('ZADD', KEYS[1], now, ARGV[4])
  redis.call('PEXPIRE', KEYS[1], window * 2)
  return -1
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local retry = tonumber(oldest[2]) + window - now
if retry < 1 then retry = 1 end
return retry
"#;

const DLQ_REMOVE: &str = r#"
local existed = redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[1], ARGV[1])
return existed
"#;

const DLQ_PRUNE: &str = r#"
local cutoff = tonumber(ARGV[1])
local stale = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. cutoff, 'LIMIT', 0, 512)
for _, id in ipairs(stale) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
end
return #stale
"#;

fn kv_err(err: redis::RedisError) -> ControlError {
    ControlError::Kv(err.to_string())
}

/// Production backend over a Redis-compatible server.
pub struct RedisKv {
    client: Client,
    conn: ConnectionManager,
    enqueue: Script,
    dequeue: Script,
    ack: Script,
    retry: Script,
    dead_letter: Script,
    reclaim: Script,
    try_acquire: Script,
    release: Script,
    rate_acquire: Script,
    dlq_remove: Script,
    dlq_prune: Script,
}

impl RedisKv {
    pub async fn connect(url: &str) -> ControlResult<Self> {
        let client = Client::open(url).map_err(kv_err)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(kv_err)?;
        Ok(Self {
            client,
            conn,
            enqueue: Script::new(ENQUEUE),
            dequeue: Script::new(DEQUEUE),
            ack: Script::new(ACK),
            retry: Script::new(RETRY),
            dead_letter: Script::new(DEAD_LETTER),
            reclaim: Script::new(RECLAIM),
            try_acquire: Script::new(TRY_ACQUIRE),
            release: Script::new(RELEASE),
            rate_acquire: Script::new(RATE_ACQUIRE),
            dlq_remove: Script::new(DLQ_REMOVE),
            dlq_prune: Script::new(DLQ_PRUNE),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn enqueue(
        &self,
        queue: QueueName,
        job_id: JobId,
        payload_json: &str,
        priority: u8,
        ready_at_ms: u64,
        now_ms: u64,
    ) -> ControlResult<()> {
        let mut conn = self.conn();
        let _: i64 = self
            .enqueue
            .key(keys::payloads(queue))
            .key(keys::priorities(queue))
            .key(keys::ready(queue))
            .key(keys::delayed(queue))
            .arg(job_id.to_string())
            .arg(payload_json)
            .arg(priority as i64)
            .arg(ready_at_ms)
            .arg(now_ms)
            .arg(crate::ready_score(priority, now_ms))
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        now_ms: u64,
        lease_ms: u64,
    ) -> ControlResult<Option<DequeuedJob>> {
        let mut conn = self.conn();
        let popped: Option<(String, String)> = self
            .dequeue
            .key(keys::delayed(queue))
            .key(keys::ready(queue))
            .key(keys::inflight(queue))
            .key(keys::payloads(queue))
            .key(keys::priorities(queue))
            .arg(now_ms)
            .arg(lease_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        match popped {
            None => Ok(None),
            Some((raw_id, payload_json)) => {
                let job_id = raw_id
                    .parse::<uuid::Uuid>()
                    .map(JobId)
                    .map_err(|e| ControlError::Kv(format!("bad job id on queue: {}", e)))?;
                Ok(Some(DequeuedJob {
                    job_id,
                    payload_json,
                }))
            }
        }
    }

    async fn ack(&self, queue: QueueName, job_id: JobId) -> ControlResult<()> {
        let mut conn = self.conn();
        let _: i64 = self
            .ack
            .key(keys::inflight(queue))
            .key(keys::payloads(queue))
            .key(keys::priorities(queue))
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn retry(
        &self,
        queue: QueueName,
        job_id: JobId,
        payload_json: &str,
        priority: u8,
        ready_at_ms: u64,
    ) -> ControlResult<()> {
        let mut conn = self.conn();
        let _: i64 = self
            .retry
            .key(keys::inflight(queue))
            .key(keys::payloads(queue))
            .key(keys::priorities(queue))
            .key(keys::delayed(queue))
            .arg(job_id.to_string())
            .arg(payload_json)
            .arg(priority as i64)
            .arg(ready_at_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        queue: QueueName,
        job_id: JobId,
        entry_json: &str,
        failed_at_ms: u64,
    ) -> ControlResult<()> {
        let mut conn = self.conn();
        let _: i64 = self
            .dead_letter
            .key(keys::inflight(queue))
            .key(keys::payloads(queue))
            .key(keys::priorities(queue))
            .key(keys::dlq_index(queue))
            .key(keys::dlq_entries(queue))
            .arg(job_id.to_string())
            .arg(entry_json)
            .arg(failed_at_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn reclaim_expired(&self, queue: QueueName, now_ms: u64) -> ControlResult<u64> {
        let mut conn = self.conn();
        let reclaimed: i64 = self
            .reclaim
            .key(keys::inflight(queue))
            .key(keys::payloads(queue))
            .key(keys::priorities(queue))
            .key(keys::ready(queue))
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(reclaimed.max(0) as u64)
    }

    async fn queue_depth(&self, queue: QueueName) -> ControlResult<u64> {
        let mut conn = self.conn();
        let ready: u64 = conn.zcard(keys::ready(queue)).await.map_err(kv_err)?;
        let delayed: u64 = conn.zcard(keys::delayed(queue)).await.map_err(kv_err)?;
        Ok(ready + delayed)
    }

    async fn dlq_entries(&self, queue: QueueName, limit: usize) -> ControlResult<Vec<String>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .zrange(keys::dlq_index(queue), 0, limit.saturating_sub(1) as isize)
            .await
            .map_err(kv_err)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let entries: Vec<Option<String>> = conn
            .hget(keys::dlq_entries(queue), ids)
            .await
            .map_err(kv_err)?;
        Ok(entries.into_iter().flatten().collect())
    }

    async fn dlq_get(&self, queue: QueueName, job_id: JobId) -> ControlResult<Option<String>> {
        let mut conn = self.conn();
        conn.hget(keys::dlq_entries(queue), job_id.to_string())
            .await
            .map_err(kv_err)
    }

    async fn dlq_remove(&self, queue: QueueName, job_id: JobId) -> ControlResult<bool> {
        let mut conn = self.conn();
        let existed: i64 = self
            .dlq_remove
            .key(keys::dlq_index(queue))
            .key(keys::dlq_entries(queue))
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(existed > 0)
    }

    async fn dlq_len(&self, queue: QueueName) -> ControlResult<u64> {
        let mut conn = self.conn();
        conn.zcard(keys::dlq_index(queue)).await.map_err(kv_err)
    }

    async fn dlq_prune(&self, queue: QueueName, cutoff_ms: u64) -> ControlResult<u64> {
        let mut conn = self.conn();
        let pruned: i64 = self
            .dlq_prune
            .key(keys::dlq_index(queue))
            .key(keys::dlq_entries(queue))
            .arg(cutoff_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(pruned.max(0) as u64)
    }

    async fn try_acquire_slots(&self, slots: &[(String, u64)]) -> ControlResult<bool> {
        let mut conn = self.conn();
        let mut invocation = self.try_acquire.prepare_invoke();
        for (key, cap) in slots {
            invocation.key(key.as_str());
            invocation.arg(*cap);
        }
        let granted: i64 = invocation.invoke_async(&mut conn).await.map_err(kv_err)?;
        Ok(granted == 1)
    }

    async fn release_slots(&self, keys: &[String]) -> ControlResult<()> {
        let mut conn = self.conn();
        let mut invocation = self.release.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        let _: i64 = invocation.invoke_async(&mut conn).await.map_err(kv_err)?;
        Ok(())
    }

    async fn counter(&self, key: &str) -> ControlResult<u64> {
        let mut conn = self.conn();
        let value: Option<u64> = conn.get(key).await.map_err(kv_err)?;
        Ok(value.unwrap_or(0))
    }

    async fn rate_try_acquire(
        &self,
        key: &str,
        window_ms: u64,
        max: u32,
        now_ms: u64,
        grant_id: &str,
    ) -> ControlResult<Option<u64>> {
        let mut conn = self.conn();
        let result: i64 = self
            .rate_acquire
            .key(key)
            .arg(window_ms)
            .arg(max)
            .arg(now_ms)
            .arg(grant_id)
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        if result < 0 {
            Ok(None)
        } else {
            Ok(Some(result as u64))
        }
    }

    async fn get_u64(&self, key: &str) -> ControlResult<Option<u64>> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(kv_err)
    }

    async fn set_u64(&self, key: &str, value: u64) -> ControlResult<()> {
        let mut conn = self.conn();
        let _: () = conn.set(key, value).await.map_err(kv_err)?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> ControlResult<u64> {
        let mut conn = self.conn();
        conn.incr(key, 1u64).await.map_err(kv_err)
    }

    async fn del(&self, key: &str) -> ControlResult<()> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await.map_err(kv_err)?;
        Ok(())
    }

    async fn set_nx_ttl(&self, key: &str, value: u64, ttl_ms: u64) -> ControlResult<bool> {
        let mut conn = self.conn();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(outcome.is_some())
    }

    async fn publish(&self, channel: &str, payload: &str) -> ControlResult<()> {
        let mut conn = self.conn();
        let _: () = conn.publish(channel, payload).await.map_err(kv_err)?;
        Ok(())
    }

    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> ControlResult<mpsc::Receiver<(String, String)>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(kv_err)?;
        pubsub.psubscribe(pattern).await.map_err(kv_err)?;
        let (tx, rx) = mpsc::channel(4096);
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if tx.send((channel, payload)).await.is_err() {
                    break;
                }
            }
            warn!(pattern = %pattern, "pubsub stream closed");
        });
        Ok(rx)
    }

    async fn ping(&self) -> ControlResult<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }
}
