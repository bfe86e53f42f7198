//! Typed job submission and queue bookkeeping

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use genesis_config::QueueTopology;
use genesis_governor::epoch_ms;
use genesis_kv::KvStore;
use genesis_types::{
    BackoffPolicy, ControlError, ControlResult, Job, JobId, JobPayload, QueueName,
};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::dlq::DlqEntry;
use crate::events::JobEvent;

/// Duplicate submissions with the same idempotency key inside this window
/// return the original job ID and enqueue nothing. The cache is
/// process-local; downstream handlers still dedupe on store state.
const IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(300);

/// Cache sweep threshold.
const IDEMPOTENCY_SWEEP_LEN: usize = 4096;

/// Submission options; anything unset falls back to the queue topology.
#[derive(Debug, Clone, Default)]
pub struct AddOpts {
    pub priority: Option<u8>,
    pub delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    pub idempotency_key: Option<String>,
}

impl AddOpts {
    pub fn with_idempotency_key(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            ..Self::default()
        }
    }
}

pub struct JobBus {
    kv: Arc<dyn KvStore>,
    topology: QueueTopology,
    idempotency: DashMap<String, (JobId, Instant)>,
    events: broadcast::Sender<JobEvent>,
}

impl JobBus {
    pub fn new(kv: Arc<dyn KvStore>, topology: QueueTopology) -> Self {
        let (events, _) = broadcast::channel(4096);
        Self {
            kv,
            topology,
            idempotency: DashMap::new(),
            events,
        }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Subscribe to the job event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    /// Submit a job. Returns the (possibly deduplicated) job ID.
    pub async fn add(
        &self,
        queue: QueueName,
        payload: JobPayload,
        opts: AddOpts,
    ) -> ControlResult<JobId> {
        if let Some(key) = &opts.idempotency_key {
            if let Some(entry) = self.idempotency.get(key) {
                let (existing, inserted_at) = *entry;
                if inserted_at.elapsed() < IDEMPOTENCY_WINDOW {
                    debug!(queue = %queue, job_id = %existing, "idempotent add deduplicated");
                    return Ok(existing);
                }
            }
        }
        if self.idempotency.len() > IDEMPOTENCY_SWEEP_LEN {
            self.idempotency
                .retain(|_, (_, at)| at.elapsed() < IDEMPOTENCY_WINDOW);
        }

        let cfg = self.topology.get(queue);
        let job = Job {
            id: JobId::new(),
            queue,
            priority: opts.priority.unwrap_or(cfg.priority),
            attempts: 0,
            max_attempts: opts.max_attempts.unwrap_or(cfg.max_retries),
            backoff: opts.backoff.unwrap_or(cfg.backoff),
            idempotency_key: opts.idempotency_key.clone(),
            replay_of: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            payload,
        };
        let payload_json = serde_json::to_string(&job)?;
        let now = epoch_ms();
        let ready_at = now + opts.delay_ms.unwrap_or(0);
        self.kv
            .enqueue(queue, job.id, &payload_json, job.priority, ready_at, now)
            .await?;

        if let Some(key) = opts.idempotency_key {
            self.idempotency.insert(key, (job.id, Instant::now()));
        }
        self.emit(JobEvent::Added {
            job_id: job.id,
            queue,
            rollout: job.payload.rollout_ref(),
        });
        Ok(job.id)
    }

    /// Acknowledge a finished job and broadcast its completion.
    pub(crate) async fn mark_completed(&self, job: &Job) -> ControlResult<()> {
        self.kv.ack(job.queue, job.id).await?;
        self.emit(JobEvent::Completed {
            job_id: job.id,
            queue: job.queue,
            rollout: job.payload.rollout_ref(),
        });
        Ok(())
    }

    /// Record a failed attempt: schedule a retry when the error is
    /// transient and budget remains, otherwise dead-letter atomically.
    /// Returns whether the job will run again.
    pub(crate) async fn mark_failed(
        &self,
        mut job: Job,
        error: &ControlError,
    ) -> ControlResult<bool> {
        job.attempts += 1;
        let rollout = job.payload.rollout_ref();

        if error.is_retryable() && job.attempts < job.max_attempts {
            let backoff_ms = job.backoff.delay_ms(job.attempts);
            let delay_ms = backoff_ms.max(error.retry_after_ms().unwrap_or(0));
            let payload_json = serde_json::to_string(&job)?;
            self.kv
                .retry(
                    job.queue,
                    job.id,
                    &payload_json,
                    job.priority,
                    epoch_ms() + delay_ms,
                )
                .await?;
            self.emit(JobEvent::Failed {
                job_id: job.id,
                queue: job.queue,
                rollout,
                error_code: error.code().to_string(),
                will_retry: true,
            });
            return Ok(true);
        }

        job.finished_at = Some(Utc::now());
        let entry = DlqEntry {
            error: error.to_string(),
            error_code: error.code().to_string(),
            failed_at: Utc::now(),
            job: job.clone(),
        };
        let entry_json = serde_json::to_string(&entry)?;
        self.kv
            .dead_letter(job.queue, job.id, &entry_json, epoch_ms())
            .await?;
        self.emit(JobEvent::Failed {
            job_id: job.id,
            queue: job.queue,
            rollout,
            error_code: error.code().to_string(),
            will_retry: false,
        });
        self.emit(JobEvent::DeadLettered {
            job_id: job.id,
            queue: job.queue,
        });
        Ok(false)
    }

    pub async fn queue_depth(&self, queue: QueueName) -> ControlResult<u64> {
        self.kv.queue_depth(queue).await
    }

    pub async fn dlq_len(&self, queue: QueueName) -> ControlResult<u64> {
        self.kv.dlq_len(queue).await
    }

    /// Oldest-first parsed DLQ entries.
    pub async fn dlq_entries(
        &self,
        queue: QueueName,
        limit: usize,
    ) -> ControlResult<Vec<DlqEntry>> {
        let raw = self.kv.dlq_entries(queue, limit).await?;
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(ControlError::from))
            .collect()
    }

    /// Re-enqueue a dead-lettered job with a fresh attempt budget. The new
    /// job points back at the original; the DLQ entry is removed once the
    /// enqueue succeeds.
    pub async fn replay(&self, queue: QueueName, job_id: JobId) -> ControlResult<JobId> {
        let raw = self
            .kv
            .dlq_get(queue, job_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("dlq entry {} on {}", job_id, queue)))?;
        let entry: DlqEntry = serde_json::from_str(&raw)?;

        let mut job = entry.job;
        let original = job.id;
        job.id = JobId::new();
        job.attempts = 0;
        job.replay_of = Some(original);
        job.enqueued_at = Utc::now();
        job.started_at = None;
        job.finished_at = None;

        let payload_json = serde_json::to_string(&job)?;
        let now = epoch_ms();
        self.kv
            .enqueue(queue, job.id, &payload_json, job.priority, now, now)
            .await?;
        self.kv.dlq_remove(queue, original).await?;
        info!(queue = %queue, original = %original, replayed = %job.id, "dlq entry replayed");
        self.emit(JobEvent::Added {
            job_id: job.id,
            queue,
            rollout: job.payload.rollout_ref(),
        });
        Ok(job.id)
    }

    /// Enforce DLQ retention. Returns entries dropped.
    pub async fn prune_dlq(&self, retention_days: i64) -> ControlResult<u64> {
        let cutoff = epoch_ms().saturating_sub((retention_days.max(0) as u64) * 86_400_000);
        let mut dropped = 0;
        for queue in QueueName::ALL {
            dropped += self.kv.dlq_prune(queue, cutoff).await?;
        }
        Ok(dropped)
    }
}
