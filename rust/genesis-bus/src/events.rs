//! Internal job event stream
//!
//! Every add/start/complete/fail/dead-letter is broadcast for metrics, the
//! operator surface, and the fleet engine's wave accounting. Lossy for slow
//! receivers (broadcast semantics); consumers that need durable counts read
//! the store, not this stream.

use genesis_types::{JobId, QueueName, RolloutId};

/// Rollout linkage carried on events for wave accounting.
pub type RolloutRef = Option<(RolloutId, u32)>;

#[derive(Debug, Clone)]
pub enum JobEvent {
    Added {
        job_id: JobId,
        queue: QueueName,
        rollout: RolloutRef,
    },
    Started {
        job_id: JobId,
        queue: QueueName,
    },
    Completed {
        job_id: JobId,
        queue: QueueName,
        rollout: RolloutRef,
    },
    /// `will_retry = false` means this is the job's terminal outcome.
    Failed {
        job_id: JobId,
        queue: QueueName,
        rollout: RolloutRef,
        error_code: String,
        will_retry: bool,
    },
    DeadLettered {
        job_id: JobId,
        queue: QueueName,
    },
}

impl JobEvent {
    pub fn queue(&self) -> QueueName {
        match self {
            JobEvent::Added { queue, .. }
            | JobEvent::Started { queue, .. }
            | JobEvent::Completed { queue, .. }
            | JobEvent::Failed { queue, .. }
            | JobEvent::DeadLettered { queue, .. } => *queue,
        }
    }
}
