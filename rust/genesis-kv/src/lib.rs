// genesis-kv: KV/queue backend abstraction
//
// All cross-instance coordination state (queues, governor counters, rate
// windows, DLQ indexes, pub/sub) lives behind `KvStore`. The production
// backend is Redis-compatible with Lua scripts for the multi-key atomic
// operations; `MemoryKv` provides the same semantics in-process for tests
// and dry runs.

pub mod keys;
pub mod memory;
pub mod redis_kv;

use async_trait::async_trait;
use genesis_types::{ControlResult, JobId, QueueName};
use tokio::sync::mpsc;

pub use memory::MemoryKv;
pub use redis_kv::RedisKv;

/// A job ready to hand to a worker, as stored on the queue.
#[derive(Debug, Clone)]
pub struct DequeuedJob {
    pub job_id: JobId,
    pub payload_json: String,
}

/// Backend contract. Every multi-key mutation is atomic so that N control
/// plane instances sharing one backend cannot overshoot a cap or lose a job
/// between structures.
#[async_trait]
pub trait KvStore: Send + Sync {
    // -- queue --------------------------------------------------------------

    /// Store the job payload and schedule it: ready immediately when
    /// `ready_at_ms <= now`, otherwise delayed until `ready_at_ms`.
    async fn enqueue(
        &self,
        queue: QueueName,
        job_id: JobId,
        payload_json: &str,
        priority: u8,
        ready_at_ms: u64,
        now_ms: u64,
    ) -> ControlResult<()>;

    /// Promote due delayed jobs, then pop the best ready job into the
    /// in-flight set with a lease of `lease_ms`. Priority wins, FIFO within
    /// a priority.
    async fn dequeue(
        &self,
        queue: QueueName,
        now_ms: u64,
        lease_ms: u64,
    ) -> ControlResult<Option<DequeuedJob>>;

    /// Drop a finished job from the in-flight set and payload store.
    async fn ack(&self, queue: QueueName, job_id: JobId) -> ControlResult<()>;

    /// Move a failed job from in-flight back to the delayed set with an
    /// updated payload (attempt counter) and a backoff deadline.
    async fn retry(
        &self,
        queue: QueueName,
        job_id: JobId,
        payload_json: &str,
        priority: u8,
        ready_at_ms: u64,
    ) -> ControlResult<()>;

    /// Move a job from in-flight to the queue's DLQ index in one step.
    async fn dead_letter(
        &self,
        queue: QueueName,
        job_id: JobId,
        entry_json: &str,
        failed_at_ms: u64,
    ) -> ControlResult<()>;

    /// Requeue in-flight jobs whose lease expired (worker died mid-job).
    /// Returns the number reclaimed.
    async fn reclaim_expired(&self, queue: QueueName, now_ms: u64) -> ControlResult<u64>;

    /// Ready + delayed backlog size.
    async fn queue_depth(&self, queue: QueueName) -> ControlResult<u64>;

    // -- dead letters -------------------------------------------------------

    /// Oldest-first DLQ entries, up to `limit`.
    async fn dlq_entries(&self, queue: QueueName, limit: usize) -> ControlResult<Vec<String>>;

    async fn dlq_get(&self, queue: QueueName, job_id: JobId) -> ControlResult<Option<String>>;

    /// Returns true when the entry existed.
    async fn dlq_remove(&self, queue: QueueName, job_id: JobId) -> ControlResult<bool>;

    async fn dlq_len(&self, queue: QueueName) -> ControlResult<u64>;

    /// Drop entries dead-lettered before `cutoff_ms`. Retention enforcement,
    /// never alert-driven truncation.
    async fn dlq_prune(&self, queue: QueueName, cutoff_ms: u64) -> ControlResult<u64>;

    // -- governor counters --------------------------------------------------

    /// Increment every `(key, cap)` counter iff each is currently below its
    /// cap. All-or-nothing; returns whether the slots were granted.
    async fn try_acquire_slots(&self, slots: &[(String, u64)]) -> ControlResult<bool>;

    /// Decrement each counter, floored at zero.
    async fn release_slots(&self, keys: &[String]) -> ControlResult<()>;

    async fn counter(&self, key: &str) -> ControlResult<u64>;

    // -- sliding-window rate limiter ----------------------------------------

    /// Grant a slot in the `window_ms` sliding window capped at `max`
    /// grants. `Ok(None)` on grant; `Ok(Some(retry_after_ms))` when the
    /// window is full, computed from the oldest in-window grant.
    async fn rate_try_acquire(
        &self,
        key: &str,
        window_ms: u64,
        max: u32,
        now_ms: u64,
        grant_id: &str,
    ) -> ControlResult<Option<u64>>;

    // -- plain values (breaker state, probes) -------------------------------

    async fn get_u64(&self, key: &str) -> ControlResult<Option<u64>>;
    async fn set_u64(&self, key: &str, value: u64) -> ControlResult<()>;
    async fn incr(&self, key: &str) -> ControlResult<u64>;
    async fn del(&self, key: &str) -> ControlResult<()>;
    /// SET-if-absent with TTL; true when this caller won the race.
    async fn set_nx_ttl(&self, key: &str, value: u64, ttl_ms: u64) -> ControlResult<bool>;

    // -- pub/sub ------------------------------------------------------------

    async fn publish(&self, channel: &str, payload: &str) -> ControlResult<()>;

    /// Pattern subscription (`heartbeat:*`). Messages arrive as
    /// `(channel, payload)` on the returned receiver until the backend
    /// connection drops.
    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> ControlResult<mpsc::Receiver<(String, String)>>;

    /// Liveness probe used by fail-open paths.
    async fn ping(&self) -> ControlResult<()>;
}

/// Priority-then-FIFO score used by both backends for the ready set.
/// Priorities are small (<= 255); millisecond timestamps stay below 2^42, so
/// the combined value is exact in an f64.
pub fn ready_score(priority: u8, now_ms: u64) -> f64 {
    (priority as f64) * 1e13 + now_ms as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_score_orders_priority_before_age() {
        let old_low = ready_score(5, 1_000);
        let new_high = ready_score(1, 2_000_000_000_000);
        assert!(new_high < old_low);
    }

    #[test]
    fn ready_score_is_fifo_within_priority() {
        assert!(ready_score(3, 100) < ready_score(3, 200));
    }
}
