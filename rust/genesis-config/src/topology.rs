//! Queue topology defaults
//!
//! Canonical per-queue priority, concurrency, rate window, and retry
//! policy. The names are fixed in `genesis_types::QueueName`; everything
//! here is configuration with stated defaults.

use std::collections::HashMap;

use genesis_types::{BackoffPolicy, QueueName};

/// Per-queue dispatch policy.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub queue: QueueName,
    /// Lower is higher priority.
    pub priority: u8,
    /// Worker tasks for this queue in one process.
    pub concurrency: usize,
    /// At most `rate_max` grants per `rate_window_ms` sliding window.
    pub rate_max: u32,
    pub rate_window_ms: u64,
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

/// The full queue table, keyed by queue name.
#[derive(Debug, Clone)]
pub struct QueueTopology {
    queues: HashMap<QueueName, QueueConfig>,
}

impl QueueTopology {
    pub fn new(queues: impl IntoIterator<Item = QueueConfig>) -> Self {
        Self {
            queues: queues.into_iter().map(|q| (q.queue, q)).collect(),
        }
    }

    pub fn get(&self, queue: QueueName) -> &QueueConfig {
        // The constructor seeds every queue; a miss is a construction bug.
        self.queues
            .get(&queue)
            .unwrap_or_else(|| panic!("queue {} missing from topology", queue))
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueConfig> {
        self.queues.values()
    }

    /// Canonical defaults, with the per-queue concurrency knobs that are
    /// exposed as environment variables already applied.
    pub fn with_concurrency_overrides(
        workflow_update: usize,
        wake_droplet: usize,
        sidecar_update: usize,
        credential_inject: usize,
        hard_reboot: usize,
    ) -> Self {
        let mut topo = Self::default();
        topo.set_concurrency(QueueName::WorkflowUpdate, workflow_update);
        topo.set_concurrency(QueueName::WakeDroplet, wake_droplet);
        topo.set_concurrency(QueueName::SidecarUpdate, sidecar_update);
        topo.set_concurrency(QueueName::CredentialInject, credential_inject);
        topo.set_concurrency(QueueName::HardRebootDroplet, hard_reboot);
        topo
    }

    fn set_concurrency(&mut self, queue: QueueName, concurrency: usize) {
        if let Some(cfg) = self.queues.get_mut(&queue) {
            cfg.concurrency = concurrency;
        }
    }
}

impl Default for QueueTopology {
    fn default() -> Self {
        use QueueName::*;
        Self::new([
            QueueConfig {
                queue: Ignition,
                priority: 1,
                concurrency: 50,
                rate_max: 100,
                rate_window_ms: 1_000,
                max_retries: 5,
                backoff: BackoffPolicy::exponential(5_000),
            },
            QueueConfig {
                queue: Security,
                priority: 2,
                concurrency: 100,
                rate_max: 200,
                rate_window_ms: 1_000,
                max_retries: 5,
                backoff: BackoffPolicy::exponential(3_000),
            },
            QueueConfig {
                queue: Template,
                priority: 3,
                concurrency: 100,
                rate_max: 200,
                rate_window_ms: 1_000,
                max_retries: 5,
                backoff: BackoffPolicy::exponential(5_000),
            },
            QueueConfig {
                queue: Reboot,
                priority: 2,
                concurrency: 25,
                rate_max: 50,
                rate_window_ms: 1_000,
                max_retries: 3,
                backoff: BackoffPolicy::exponential(10_000),
            },
            QueueConfig {
                queue: Health,
                priority: 4,
                concurrency: 500,
                rate_max: 1_000,
                rate_window_ms: 1_000,
                max_retries: 3,
                backoff: BackoffPolicy::fixed(1_000),
            },
            QueueConfig {
                queue: Metric,
                priority: 4,
                concurrency: 200,
                rate_max: 500,
                rate_window_ms: 1_000,
                max_retries: 3,
                backoff: BackoffPolicy::fixed(2_000),
            },
            QueueConfig {
                queue: WorkflowUpdate,
                priority: 3,
                concurrency: 100,
                rate_max: 200,
                rate_window_ms: 1_000,
                max_retries: 5,
                backoff: BackoffPolicy::exponential(5_000),
            },
            QueueConfig {
                queue: SidecarUpdate,
                priority: 2,
                concurrency: 50,
                rate_max: 100,
                rate_window_ms: 1_000,
                max_retries: 3,
                backoff: BackoffPolicy::exponential(10_000),
            },
            QueueConfig {
                queue: WakeDroplet,
                priority: 2,
                concurrency: 50,
                rate_max: 50,
                rate_window_ms: 1_000,
                max_retries: 3,
                backoff: BackoffPolicy::exponential(5_000),
            },
            QueueConfig {
                queue: CredentialInject,
                priority: 2,
                concurrency: 50,
                rate_max: 200,
                rate_window_ms: 1_000,
                max_retries: 5,
                backoff: BackoffPolicy::exponential(3_000),
            },
            QueueConfig {
                queue: HardRebootDroplet,
                priority: 2,
                concurrency: 10,
                rate_max: 50,
                rate_window_ms: 1_000,
                max_retries: 3,
                backoff: BackoffPolicy::exponential(10_000),
            },
        ])
    }
}
