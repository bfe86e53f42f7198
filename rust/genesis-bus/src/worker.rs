//! Worker runtime
//!
//! One pool per queue, `concurrency` tasks per pool. Every handler
//! execution happens inside a governor acquisition; outcomes feed the
//! breaker, the counters, and the event stream. Workers observe the global
//! shutdown flag cooperatively.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use genesis_governor::{epoch_ms, Governor};
use genesis_types::{ControlError, ControlResult, Job, JobId, QueueName};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bus::JobBus;
use crate::events::JobEvent;

/// Lease on a dequeued job; expired leases are reclaimed by the pool's
/// janitor task, which is what makes a crashed worker's jobs reappear.
const JOB_LEASE_MS: u64 = 900_000;

/// Idle poll interval when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Janitor cadence for reclaiming expired leases.
const RECLAIM_INTERVAL: Duration = Duration::from_secs(30);

/// Executes one queue's jobs. Implementations must be idempotent with
/// respect to their side effects: delivery is at-least-once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> ControlResult<()>;
}

/// Per-queue counters surfaced on `/health`.
#[derive(Default)]
pub struct WorkerCounters {
    pub running: AtomicBool,
    pub active: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

impl WorkerCounters {
    pub fn snapshot(&self) -> (bool, u64, u64, u64) {
        (
            self.running.load(Ordering::Relaxed),
            self.active.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

/// All pools' counters, keyed by queue. The fleet engine snapshots totals
/// around a wave to compute the control-plane error rate over that span.
#[derive(Default)]
pub struct WorkerRegistry {
    counters: DashMap<QueueName, Arc<WorkerCounters>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, queue: QueueName) -> Arc<WorkerCounters> {
        self.counters
            .entry(queue)
            .or_insert_with(|| Arc::new(WorkerCounters::default()))
            .clone()
    }

    pub fn get(&self, queue: QueueName) -> Option<Arc<WorkerCounters>> {
        self.counters.get(&queue).map(|c| c.clone())
    }

    pub fn iter(&self) -> Vec<(QueueName, Arc<WorkerCounters>)> {
        self.counters
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Terminal outcome totals across all queues: (completed, failed).
    pub fn totals(&self) -> (u64, u64) {
        let mut completed = 0;
        let mut failed = 0;
        for entry in self.counters.iter() {
            completed += entry.value().completed.load(Ordering::Relaxed);
            failed += entry.value().failed.load(Ordering::Relaxed);
        }
        (completed, failed)
    }
}

pub struct WorkerPool {
    queue: QueueName,
    concurrency: usize,
    bus: Arc<JobBus>,
    governor: Arc<Governor>,
    handler: Arc<dyn JobHandler>,
    counters: Arc<WorkerCounters>,
    shutdown: watch::Receiver<bool>,
}

impl WorkerPool {
    pub fn new(
        queue: QueueName,
        bus: Arc<JobBus>,
        governor: Arc<Governor>,
        handler: Arc<dyn JobHandler>,
        counters: Arc<WorkerCounters>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let concurrency = bus.topology().get(queue).concurrency;
        Self {
            queue,
            concurrency,
            bus,
            governor,
            handler,
            counters,
            shutdown,
        }
    }

    /// Start the pool's worker tasks plus the lease janitor. The returned
    /// handles complete once shutdown is signalled and in-flight jobs have
    /// finished.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        self.counters.running.store(true, Ordering::Relaxed);
        let live_workers = Arc::new(AtomicUsize::new(self.concurrency));
        let mut handles = Vec::with_capacity(self.concurrency + 1);

        for _ in 0..self.concurrency {
            let ctx = WorkerContext {
                queue: self.queue,
                bus: Arc::clone(&self.bus),
                governor: Arc::clone(&self.governor),
                handler: Arc::clone(&self.handler),
                counters: Arc::clone(&self.counters),
                live_workers: Arc::clone(&live_workers),
            };
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(worker_loop(ctx, shutdown)));
        }

        handles.push(tokio::spawn(reclaim_loop(
            self.queue,
            Arc::clone(&self.bus),
            self.shutdown.clone(),
        )));
        handles
    }
}

struct WorkerContext {
    queue: QueueName,
    bus: Arc<JobBus>,
    governor: Arc<Governor>,
    handler: Arc<dyn JobHandler>,
    counters: Arc<WorkerCounters>,
    live_workers: Arc<AtomicUsize>,
}

async fn worker_loop(ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let guard = match ctx.governor.acquire(ctx.queue, JobId::new(), None).await {
            Ok(guard) => guard,
            Err(err) => {
                let wait = err.retry_after_ms().unwrap_or(500).min(5_000);
                wait_or_shutdown(Duration::from_millis(wait), &mut shutdown).await;
                continue;
            }
        };

        let dequeued = match ctx.bus.kv().dequeue(ctx.queue, epoch_ms(), JOB_LEASE_MS).await {
            Ok(d) => d,
            Err(err) => {
                warn!(queue = %ctx.queue, error = %err, "dequeue failed");
                let _ = guard.release().await;
                wait_or_shutdown(Duration::from_secs(1), &mut shutdown).await;
                continue;
            }
        };
        let Some(dequeued) = dequeued else {
            let _ = guard.release().await;
            wait_or_shutdown(POLL_INTERVAL, &mut shutdown).await;
            continue;
        };

        let mut job: Job = match serde_json::from_str(&dequeued.payload_json) {
            Ok(job) => job,
            Err(err) => {
                // Poison entry; drop it rather than loop on it forever.
                error!(queue = %ctx.queue, job_id = %dequeued.job_id, error = %err, "unparseable job dropped");
                let _ = ctx.bus.kv().ack(ctx.queue, dequeued.job_id).await;
                let _ = guard.release().await;
                continue;
            }
        };

        job.started_at = Some(Utc::now());
        ctx.counters.active.fetch_add(1, Ordering::Relaxed);
        ctx.bus.emit(JobEvent::Started {
            job_id: job.id,
            queue: ctx.queue,
        });

        let result = ctx.handler.handle(&job).await;
        ctx.counters.active.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(()) => {
                if let Err(err) = ctx.bus.mark_completed(&job).await {
                    warn!(queue = %ctx.queue, job_id = %job.id, error = %err, "completion ack failed");
                }
                ctx.counters.completed.fetch_add(1, Ordering::Relaxed);
                let _ = ctx.governor.record_success(ctx.queue).await;
            }
            Err(err) => {
                debug!(queue = %ctx.queue, job_id = %job.id, code = err.code(), "job attempt failed");
                if !matches!(err, ControlError::GovernorDenied { .. }) {
                    let _ = ctx.governor.record_failure(ctx.queue).await;
                }
                match ctx.bus.mark_failed(job, &err).await {
                    Ok(true) => {}
                    Ok(false) => {
                        ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(record_err) => {
                        error!(queue = %ctx.queue, error = %record_err, "failure bookkeeping failed");
                        ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        let _ = guard.release().await;
    }

    if ctx.live_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
        ctx.counters.running.store(false, Ordering::Relaxed);
    }
}

async fn reclaim_loop(queue: QueueName, bus: Arc<JobBus>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        wait_or_shutdown(RECLAIM_INTERVAL, &mut shutdown).await;
        if *shutdown.borrow() {
            break;
        }
        match bus.kv().reclaim_expired(queue, epoch_ms()).await {
            Ok(0) => {}
            Ok(n) => warn!(queue = %queue, reclaimed = n, "expired job leases requeued"),
            Err(err) => warn!(queue = %queue, error = %err, "lease reclaim failed"),
        }
    }
}

async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::AddOpts;
    use genesis_config::{GovernorSettings, QueueTopology};
    use genesis_kv::MemoryKv;
    use genesis_types::{BackoffPolicy, DropletId, JobPayload, RebootReason, TenantId};

    struct FlakyHandler {
        failures_before_success: u32,
        calls: AtomicU64,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, _job: &Job) -> ControlResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success as u64 {
                Err(ControlError::SidecarUnreachable("flaky".into()))
            } else {
                Ok(())
            }
        }
    }

    struct World {
        bus: Arc<JobBus>,
        governor: Arc<Governor>,
        registry: WorkerRegistry,
        shutdown_tx: watch::Sender<bool>,
    }

    fn world() -> World {
        let kv = Arc::new(MemoryKv::new());
        let topology = QueueTopology::default();
        let bus = Arc::new(JobBus::new(kv.clone(), topology.clone()));
        let governor = Arc::new(Governor::new(
            kv,
            GovernorSettings::default(),
            topology,
        ));
        let (shutdown_tx, _) = watch::channel(false);
        World {
            bus,
            governor,
            registry: WorkerRegistry::new(),
            shutdown_tx,
        }
    }

    fn payload() -> JobPayload {
        JobPayload::HardRebootDroplet {
            droplet_id: DropletId(1),
            tenant_id: TenantId::from("t-1"),
            reason: RebootReason::ZombieDetected,
        }
    }

    async fn wait_until(mut probe: impl FnMut() -> bool, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        while tokio::time::Instant::now() < deadline {
            if probe() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn handler_failure_retries_then_completes() {
        let w = world();
        let handler = Arc::new(FlakyHandler {
            failures_before_success: 2,
            calls: AtomicU64::new(0),
        });
        let counters = w.registry.register(QueueName::HardRebootDroplet);
        let pool = WorkerPool::new(
            QueueName::HardRebootDroplet,
            Arc::clone(&w.bus),
            Arc::clone(&w.governor),
            handler.clone(),
            Arc::clone(&counters),
            w.shutdown_tx.subscribe(),
        );
        let handles = pool.spawn();

        w.bus
            .add(
                QueueName::HardRebootDroplet,
                payload(),
                AddOpts {
                    backoff: Some(BackoffPolicy::fixed(20)),
                    ..AddOpts::default()
                },
            )
            .await
            .unwrap();

        assert!(
            wait_until(
                || counters.completed.load(Ordering::Relaxed) == 1,
                Duration::from_secs(5)
            )
            .await,
            "job should complete after two retries"
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(counters.failed.load(Ordering::Relaxed), 0);
        assert_eq!(
            w.bus.dlq_len(QueueName::HardRebootDroplet).await.unwrap(),
            0
        );

        w.shutdown_tx.send(true).unwrap();
        for h in handles {
            let _ = h.await;
        }
        assert!(!counters.running.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn exhausted_attempts_produce_exactly_one_dlq_entry() {
        let w = world();
        let handler = Arc::new(FlakyHandler {
            failures_before_success: u32::MAX,
            calls: AtomicU64::new(0),
        });
        let counters = w.registry.register(QueueName::HardRebootDroplet);
        let pool = WorkerPool::new(
            QueueName::HardRebootDroplet,
            Arc::clone(&w.bus),
            Arc::clone(&w.governor),
            handler,
            Arc::clone(&counters),
            w.shutdown_tx.subscribe(),
        );
        let handles = pool.spawn();

        let id = w
            .bus
            .add(
                QueueName::HardRebootDroplet,
                payload(),
                AddOpts {
                    max_attempts: Some(2),
                    backoff: Some(BackoffPolicy::fixed(20)),
                    ..AddOpts::default()
                },
            )
            .await
            .unwrap();

        assert!(
            wait_until(
                || counters.failed.load(Ordering::Relaxed) == 1,
                Duration::from_secs(5)
            )
            .await,
            "job should dead-letter after exhausting attempts"
        );
        let entries = w
            .bus
            .dlq_entries(QueueName::HardRebootDroplet, 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job.id, id);
        assert_eq!(entries[0].job.attempts, 2);
        assert_eq!(
            w.bus
                .queue_depth(QueueName::HardRebootDroplet)
                .await
                .unwrap(),
            0
        );

        w.shutdown_tx.send(true).unwrap();
        for h in handles {
            let _ = h.await;
        }
    }
}
