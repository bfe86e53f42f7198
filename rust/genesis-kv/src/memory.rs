//! In-process KV backend
//!
//! Mirrors the Redis backend's semantics exactly (single-keyspace atomic
//! mutations, priority-then-FIFO queues, sliding windows) under one mutex.
//! Used by tests and dry runs; coordination across instances obviously does
//! not apply.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use genesis_types::{ControlError, ControlResult, JobId, QueueName};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{ready_score, DequeuedJob, KvStore};

#[derive(Default)]
struct QueueState {
    /// (score, seq) -> job. Score is priority-then-enqueue-time.
    ready: BTreeMap<(u64, u64), JobId>,
    /// (ready_at_ms, seq) -> job.
    delayed: BTreeMap<(u64, u64), JobId>,
    /// job -> lease deadline ms.
    inflight: HashMap<JobId, u64>,
    /// job -> (payload, priority).
    payloads: HashMap<JobId, (String, u8)>,
    /// (failed_at_ms, seq) -> job.
    dlq: BTreeMap<(u64, u64), JobId>,
    dlq_entries: HashMap<JobId, String>,
}

#[derive(Default)]
struct Inner {
    seq: u64,
    queues: HashMap<QueueName, QueueState>,
    counters: HashMap<String, u64>,
    /// Sorted grant timestamps per rate key.
    rates: HashMap<String, VecDeque<u64>>,
    values: HashMap<String, (u64, Option<Instant>)>,
    subscribers: Vec<(String, mpsc::Sender<(String, String)>)>,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn queue(&mut self, queue: QueueName) -> &mut QueueState {
        self.queues.entry(queue).or_default()
    }
}

/// Single-process backend with Redis-equivalent semantics.
pub struct MemoryKv {
    inner: Mutex<Inner>,
    failing: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every operation fail, for exercising fail-open paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> ControlResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(ControlError::Kv("injected backend failure".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn enqueue(
        &self,
        queue: QueueName,
        job_id: JobId,
        payload_json: &str,
        priority: u8,
        ready_at_ms: u64,
        now_ms: u64,
    ) -> ControlResult<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        let seq = inner.next_seq();
        let q = inner.queue(queue);
        q.payloads
            .insert(job_id, (payload_json.to_string(), priority));
        if ready_at_ms <= now_ms {
            q.ready
                .insert((ready_score(priority, now_ms) as u64, seq), job_id);
        } else {
            q.delayed.insert((ready_at_ms, seq), job_id);
        }
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        now_ms: u64,
        lease_ms: u64,
    ) -> ControlResult<Option<DequeuedJob>> {
        self.check()?;
        let mut inner = self.inner.lock();
        let mut due_seq = Vec::new();
        {
            let q = inner.queue(queue);
            let due: Vec<_> = q
                .delayed
                .range(..=(now_ms, u64::MAX))
                .map(|(k, v)| (*k, *v))
                .collect();
            for (key, job_id) in due {
                q.delayed.remove(&key);
                due_seq.push(job_id);
            }
        }
        for job_id in due_seq {
            let seq = inner.next_seq();
            let q = inner.queue(queue);
            let priority = q.payloads.get(&job_id).map(|(_, p)| *p).unwrap_or(5);
            q.ready
                .insert((ready_score(priority, now_ms) as u64, seq), job_id);
        }

        let q = inner.queue(queue);
        let first = q.ready.keys().next().copied();
        if let Some(key) = first {
            let job_id = q.ready.remove(&key).expect("key just observed");
            match q.payloads.get(&job_id) {
                Some((payload, _)) => {
                    let payload = payload.clone();
                    q.inflight.insert(job_id, now_ms + lease_ms);
                    return Ok(Some(DequeuedJob {
                        job_id,
                        payload_json: payload,
                    }));
                }
                // Payload vanished (acked elsewhere); skip the orphan marker.
                None => return Ok(None),
            }
        }
        Ok(None)
    }

    async fn ack(&self, queue: QueueName, job_id: JobId) -> ControlResult<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        let q = inner.queue(queue);
        q.inflight.remove(&job_id);
        q.payloads.remove(&job_id);
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
        self.check()?;
        let mut inner = self.inner.lock();
        let seq = inner.next_seq();
        let q = inner.queue(queue);
        q.inflight.remove(&job_id);
        q.payloads
            .insert(job_id, (payload_json.to_string(), priority));
        q.delayed.insert((ready_at_ms, seq), job_id);
        Ok(())
    }

    async fn dead_letter(
        &self,
        queue: QueueName,
        job_id: JobId,
        entry_json: &str,
        failed_at_ms: u64,
    ) -> ControlResult<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        let seq = inner.next_seq();
        let q = inner.queue(queue);
        q.inflight.remove(&job_id);
        q.payloads.remove(&job_id);
        q.dlq.insert((failed_at_ms, seq), job_id);
        q.dlq_entries.insert(job_id, entry_json.to_string());
        Ok(())
    }

    async fn reclaim_expired(&self, queue: QueueName, now_ms: u64) -> ControlResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock();
        let expired: Vec<JobId> = {
            let q = inner.queue(queue);
            q.inflight
                .iter()
                .filter(|(_, deadline)| **deadline <= now_ms)
                .map(|(id, _)| *id)
                .collect()
        };
        let mut reclaimed = 0u64;
        for job_id in expired {
            let seq = inner.next_seq();
            let q = inner.queue(queue);
            q.inflight.remove(&job_id);
            if let Some((_, priority)) = q.payloads.get(&job_id) {
                let priority = *priority;
                q.ready
                    .insert((ready_score(priority, now_ms) as u64, seq), job_id);
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn queue_depth(&self, queue: QueueName) -> ControlResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock();
        let q = inner.queue(queue);
        Ok((q.ready.len() + q.delayed.len()) as u64)
    }

    async fn dlq_entries(&self, queue: QueueName, limit: usize) -> ControlResult<Vec<String>> {
        self.check()?;
        let mut inner = self.inner.lock();
        let q = inner.queue(queue);
        Ok(q.dlq
            .values()
            .take(limit)
            .filter_map(|id| q.dlq_entries.get(id).cloned())
            .collect())
    }

    async fn dlq_get(&self, queue: QueueName, job_id: JobId) -> ControlResult<Option<String>> {
        self.check()?;
        let mut inner = self.inner.lock();
        Ok(inner.queue(queue).dlq_entries.get(&job_id).cloned())
    }

    async fn dlq_remove(&self, queue: QueueName, job_id: JobId) -> ControlResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock();
        let q = inner.queue(queue);
        let existed = q.dlq_entries.remove(&job_id).is_some();
        q.dlq.retain(|_, id| *id != job_id);
        Ok(existed)
    }

    async fn dlq_len(&self, queue: QueueName) -> ControlResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock();
        Ok(inner.queue(queue).dlq.len() as u64)
    }

    async fn dlq_prune(&self, queue: QueueName, cutoff_ms: u64) -> ControlResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock();
        let q = inner.queue(queue);
        let stale: Vec<_> = q
            .dlq
            .range(..(cutoff_ms, 0))
            .map(|(k, v)| (*k, *v))
            .collect();
        for (key, id) in &stale {
            q.dlq.remove(key);
            q.dlq_entries.remove(id);
        }
        Ok(stale.len() as u64)
    }

    async fn try_acquire_slots(&self, slots: &[(String, u64)]) -> ControlResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock();
        for (key, cap) in slots {
            let current = inner.counters.get(key).copied().unwrap_or(0);
            if current >= *cap {
                return Ok(false);
            }
        }
        for (key, _) in slots {
            *inner.counters.entry(key.clone()).or_insert(0) += 1;
        }
        Ok(true)
    }

    async fn release_slots(&self, keys: &[String]) -> ControlResult<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        for key in keys {
            if let Some(count) = inner.counters.get_mut(key) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn counter(&self, key: &str) -> ControlResult<u64> {
        self.check()?;
        Ok(self.inner.lock().counters.get(key).copied().unwrap_or(0))
    }

    async fn rate_try_acquire(
        &self,
        key: &str,
        window_ms: u64,
        max: u32,
        now_ms: u64,
        _grant_id: &str,
    ) -> ControlResult<Option<u64>> {
        self.check()?;
        let mut inner = self.inner.lock();
        let grants = inner.rates.entry(key.to_string()).or_default();
        let floor = now_ms.saturating_sub(window_ms);
        while grants.front().is_some_and(|ts| *ts <= floor) {
            grants.pop_front();
        }
        if (grants.len() as u32) < max {
            grants.push_back(now_ms);
            Ok(None)
        } else {
            let oldest = *grants.front().expect("window is full");
            Ok(Some((oldest + window_ms).saturating_sub(now_ms).max(1)))
        }
    }

    async fn get_u64(&self, key: &str) -> ControlResult<Option<u64>> {
        self.check()?;
        let mut inner = self.inner.lock();
        match inner.values.get(key) {
            Some((_, Some(expiry))) if *expiry <= Instant::now() => {
                inner.values.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(*value)),
            None => Ok(None),
        }
    }

    async fn set_u64(&self, key: &str, value: u64) -> ControlResult<()> {
        self.check()?;
        self.inner.lock().values.insert(key.to_string(), (value, None));
        Ok(())
    }

    async fn incr(&self, key: &str) -> ControlResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock();
        let entry = inner.values.entry(key.to_string()).or_insert((0, None));
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn del(&self, key: &str) -> ControlResult<()> {
        self.check()?;
        self.inner.lock().values.remove(key);
        Ok(())
    }

    async fn set_nx_ttl(&self, key: &str, value: u64, ttl_ms: u64) -> ControlResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock();
        let live = match inner.values.get(key) {
            Some((_, Some(expiry))) => *expiry > Instant::now(),
            Some((_, None)) => true,
            None => false,
        };
        if live {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            (value, Some(Instant::now() + Duration::from_millis(ttl_ms))),
        );
        Ok(true)
    }

    async fn publish(&self, channel: &str, payload: &str) -> ControlResult<()> {
        self.check()?;
        let targets: Vec<mpsc::Sender<(String, String)>> = {
            let mut inner = self.inner.lock();
            inner.subscribers.retain(|(_, tx)| !tx.is_closed());
            inner
                .subscribers
                .iter()
                .filter(|(pattern, _)| pattern_matches(pattern, channel))
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for tx in targets {
            // Slow subscribers shed load rather than stall the publisher.
            let _ = tx.try_send((channel.to_string(), payload.to_string()));
        }
        Ok(())
    }

    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> ControlResult<mpsc::Receiver<(String, String)>> {
        self.check()?;
        let (tx, rx) = mpsc::channel(4096);
        self.inner
            .lock()
            .subscribers
            .push((pattern.to_string(), tx));
        Ok(rx)
    }

    async fn ping(&self) -> ControlResult<()> {
        self.check()
    }
}
