// genesis-governor: Concurrency governor
//
// Single gatekeeper for outbound work. A grant requires, atomically:
// global in-flight below G, queue in-flight below Cq, per-account in-flight
// below A (when an account is involved), the queue's sliding rate window
// not full, and the queue's circuit closed. Counters live in the shared KV
// so N control-plane instances share one budget.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use genesis_config::{GovernorSettings, QueueTopology};
use genesis_kv::{keys, KvStore};
use genesis_types::{AccountId, ControlError, ControlResult, JobId, QueueName};
use tracing::{debug, warn};

/// Fallback delay when slots (not the rate window) are exhausted; slot
/// release has no schedule the denial could quote.
const SLOT_RETRY_MS: u64 = 250;

/// TTL on the half-open probe marker so a crashed prober cannot wedge the
/// breaker.
const PROBE_TTL_MS: u64 = 10_000;

pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Observable breaker position, surfaced on `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// A granted slot. Consuming [`SlotGuard::release`] is the one legal way to
/// give the slot back; the move semantics make double-release impossible.
pub struct SlotGuard {
    kv: Arc<dyn KvStore>,
    slot_keys: Vec<String>,
    released: bool,
    pub queue: QueueName,
}

impl SlotGuard {
    pub async fn release(mut self) -> ControlResult<()> {
        self.released = true;
        let keys = std::mem::take(&mut self.slot_keys);
        self.kv.release_slots(&keys).await
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.released {
            // The KV counter stays elevated until an operator resets it;
            // make the leak loud.
            warn!(queue = %self.queue, "slot guard dropped without release");
        }
    }
}

pub struct Governor {
    kv: Arc<dyn KvStore>,
    settings: GovernorSettings,
    topology: QueueTopology,
}

impl Governor {
    pub fn new(kv: Arc<dyn KvStore>, settings: GovernorSettings, topology: QueueTopology) -> Self {
        Self {
            kv,
            settings,
            topology,
        }
    }

    /// Reserve a slot for one job execution.
    ///
    /// Denials carry `retry_after_ms`: breaker denials quote the remaining
    /// reset window, rate denials quote the oldest in-window grant's expiry.
    pub async fn acquire(
        &self,
        queue: QueueName,
        job_id: JobId,
        account: Option<&AccountId>,
    ) -> ControlResult<SlotGuard> {
        let now = epoch_ms();
        self.check_breaker(queue, now).await?;

        let queue_cfg = self.topology.get(queue);
        let mut slots = vec![
            (
                keys::governor_global(),
                self.settings.global_max_concurrent as u64,
            ),
            (keys::governor_queue(queue), queue_cfg.concurrency as u64),
        ];
        if let Some(account) = account {
            slots.push((
                keys::governor_account(account.as_str()),
                self.settings.per_account_max_concurrent as u64,
            ));
        }

        if !self.kv.try_acquire_slots(&slots).await? {
            return Err(ControlError::GovernorDenied {
                retry_after_ms: SLOT_RETRY_MS,
            });
        }
        let slot_keys: Vec<String> = slots.into_iter().map(|(k, _)| k).collect();

        if let Some(retry_after_ms) = self
            .kv
            .rate_try_acquire(
                &keys::queue_rate(queue),
                queue_cfg.rate_window_ms,
                queue_cfg.rate_max,
                now,
                &job_id.to_string(),
            )
            .await?
        {
            // Slots were taken before the window refused; hand them back.
            self.kv.release_slots(&slot_keys).await?;
            return Err(ControlError::GovernorDenied { retry_after_ms });
        }

        Ok(SlotGuard {
            kv: Arc::clone(&self.kv),
            slot_keys,
            released: false,
            queue,
        })
    }

    /// Reserve a per-account slot for one provider API call. Enforces both
    /// the per-account in-flight cap and the per-account mutation rate.
    pub async fn acquire_account(&self, account: &AccountId) -> ControlResult<SlotGuard> {
        let now = epoch_ms();
        let slots = vec![(
            keys::governor_account(account.as_str()),
            self.settings.per_account_max_concurrent as u64,
        )];
        if !self.kv.try_acquire_slots(&slots).await? {
            return Err(ControlError::GovernorDenied {
                retry_after_ms: SLOT_RETRY_MS,
            });
        }
        let slot_keys: Vec<String> = slots.into_iter().map(|(k, _)| k).collect();

        if let Some(retry_after_ms) = self
            .kv
            .rate_try_acquire(
                &keys::account_rate(account.as_str()),
                self.settings.per_account_rate_window_ms,
                self.settings.per_account_rate_max,
                now,
                &format!("{}-{}", account, now),
            )
            .await?
        {
            self.kv.release_slots(&slot_keys).await?;
            return Err(ControlError::GovernorDenied { retry_after_ms });
        }

        Ok(SlotGuard {
            kv: Arc::clone(&self.kv),
            slot_keys,
            released: false,
            queue: QueueName::Ignition,
        })
    }

    async fn check_breaker(&self, queue: QueueName, now: u64) -> ControlResult<()> {
        let open_until = self
            .kv
            .get_u64(&keys::breaker_open_until(queue))
            .await?
            .unwrap_or(0);
        if open_until == 0 {
            return Ok(());
        }
        if now < open_until {
            return Err(ControlError::GovernorDenied {
                retry_after_ms: open_until - now,
            });
        }
        // Reset period elapsed: exactly one caller gets the probe grant.
        if self
            .kv
            .set_nx_ttl(&keys::breaker_probe(queue), now, PROBE_TTL_MS)
            .await?
        {
            debug!(queue = %queue, "circuit half-open, probe granted");
            Ok(())
        } else {
            Err(ControlError::GovernorDenied {
                retry_after_ms: PROBE_TTL_MS,
            })
        }
    }

    /// Feed the breaker with a success. Closes the circuit after a
    /// successful probe and clears the consecutive-failure run.
    pub async fn record_success(&self, queue: QueueName) -> ControlResult<()> {
        self.kv.del(&keys::breaker_failures(queue)).await?;
        let open_until = self
            .kv
            .get_u64(&keys::breaker_open_until(queue))
            .await?
            .unwrap_or(0);
        if open_until != 0 {
            self.kv.del(&keys::breaker_open_until(queue)).await?;
            self.kv.del(&keys::breaker_probe(queue)).await?;
            warn!(queue = %queue, "circuit closed after successful probe");
        }
        Ok(())
    }

    /// Feed the breaker with a failure; opens the circuit after the
    /// configured run of consecutive failures.
    pub async fn record_failure(&self, queue: QueueName) -> ControlResult<()> {
        let failures = self.kv.incr(&keys::breaker_failures(queue)).await?;
        if failures >= self.settings.circuit_breaker_threshold as u64 {
            let open_until = epoch_ms() + self.settings.circuit_breaker_reset_ms;
            self.kv
                .set_u64(&keys::breaker_open_until(queue), open_until)
                .await?;
            self.kv.del(&keys::breaker_failures(queue)).await?;
            self.kv.del(&keys::breaker_probe(queue)).await?;
            warn!(
                queue = %queue,
                failures,
                reset_ms = self.settings.circuit_breaker_reset_ms,
                "circuit opened"
            );
        }
        Ok(())
    }

    pub async fn circuit_state(&self, queue: QueueName) -> ControlResult<CircuitState> {
        let open_until = self
            .kv
            .get_u64(&keys::breaker_open_until(queue))
            .await?
            .unwrap_or(0);
        if open_until == 0 {
            Ok(CircuitState::Closed)
        } else if epoch_ms() < open_until {
            Ok(CircuitState::Open)
        } else {
            Ok(CircuitState::HalfOpen)
        }
    }

    /// Current in-flight count for a queue, for the operator surface.
    pub async fn queue_in_flight(&self, queue: QueueName) -> ControlResult<u64> {
        self.kv.counter(&keys::governor_queue(queue)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_kv::MemoryKv;

    fn governor() -> Governor {
        governor_with(GovernorSettings::default())
    }

    fn governor_with(settings: GovernorSettings) -> Governor {
        Governor::new(
            Arc::new(MemoryKv::new()),
            settings,
            QueueTopology::default(),
        )
    }

    #[tokio::test]
    async fn queue_cap_is_enforced() {
        let gov = governor_with(GovernorSettings {
            global_max_concurrent: 1_000,
            ..GovernorSettings::default()
        });
        // hard-reboot-droplet has concurrency 10.
        let mut guards = Vec::new();
        for _ in 0..10 {
            guards.push(
                gov.acquire(QueueName::HardRebootDroplet, JobId::new(), None)
                    .await
                    .unwrap(),
            );
        }
        let denied = gov
            .acquire(QueueName::HardRebootDroplet, JobId::new(), None)
            .await;
        assert!(matches!(
            denied,
            Err(ControlError::GovernorDenied { retry_after_ms }) if retry_after_ms > 0
        ));

        // Releasing one slot reopens the queue.
        guards.pop().unwrap().release().await.unwrap();
        let guard = gov
            .acquire(QueueName::HardRebootDroplet, JobId::new(), None)
            .await
            .unwrap();
        guard.release().await.unwrap();
        for g in guards {
            g.release().await.unwrap();
        }
    }

    #[tokio::test]
    async fn global_cap_spans_queues() {
        let gov = governor_with(GovernorSettings {
            global_max_concurrent: 2,
            ..GovernorSettings::default()
        });
        let g1 = gov
            .acquire(QueueName::Health, JobId::new(), None)
            .await
            .unwrap();
        let g2 = gov
            .acquire(QueueName::Metric, JobId::new(), None)
            .await
            .unwrap();
        assert!(gov
            .acquire(QueueName::Template, JobId::new(), None)
            .await
            .is_err());
        g1.release().await.unwrap();
        g2.release().await.unwrap();
    }

    #[tokio::test]
    async fn per_account_cap_applies_when_account_given() {
        let gov = governor_with(GovernorSettings {
            per_account_max_concurrent: 1,
            ..GovernorSettings::default()
        });
        let acct = AccountId::new("acct-1");
        let g1 = gov
            .acquire(QueueName::Ignition, JobId::new(), Some(&acct))
            .await
            .unwrap();
        assert!(gov
            .acquire(QueueName::Ignition, JobId::new(), Some(&acct))
            .await
            .is_err());
        // Another account is unaffected.
        let other = AccountId::new("acct-2");
        let g2 = gov
            .acquire(QueueName::Ignition, JobId::new(), Some(&other))
            .await
            .unwrap();
        g1.release().await.unwrap();
        g2.release().await.unwrap();
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures_and_probes() {
        let settings = GovernorSettings {
            circuit_breaker_threshold: 3,
            circuit_breaker_reset_ms: 0,
            ..GovernorSettings::default()
        };
        let gov = governor_with(settings);
        let q = QueueName::SidecarUpdate;
        for _ in 0..3 {
            gov.record_failure(q).await.unwrap();
        }
        // Reset period of zero means the next acquire is the half-open
        // probe; only one probe is granted until the outcome lands.
        assert_eq!(gov.circuit_state(q).await.unwrap(), CircuitState::HalfOpen);
        let probe = gov.acquire(q, JobId::new(), None).await.unwrap();
        assert!(gov.acquire(q, JobId::new(), None).await.is_err());

        gov.record_success(q).await.unwrap();
        assert_eq!(gov.circuit_state(q).await.unwrap(), CircuitState::Closed);
        probe.release().await.unwrap();
        let g = gov.acquire(q, JobId::new(), None).await.unwrap();
        g.release().await.unwrap();
    }

    #[tokio::test]
    async fn open_breaker_denies_with_remaining_reset() {
        let settings = GovernorSettings {
            circuit_breaker_threshold: 1,
            circuit_breaker_reset_ms: 60_000,
            ..GovernorSettings::default()
        };
        let gov = governor_with(settings);
        let q = QueueName::WakeDroplet;
        gov.record_failure(q).await.unwrap();
        assert_eq!(gov.circuit_state(q).await.unwrap(), CircuitState::Open);
        match gov.acquire(q, JobId::new(), None).await {
            Err(ControlError::GovernorDenied { retry_after_ms }) => {
                assert!(retry_after_ms > 0 && retry_after_ms <= 60_000);
            }
            other => panic!("expected denial, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn failed_rate_window_returns_slots() {
        let gov = governor();
        let q = QueueName::Reboot; // rate 50/1000ms
        let mut guards = Vec::new();
        for _ in 0..25 {
            // concurrency cap for reboot
            guards.push(gov.acquire(q, JobId::new(), None).await.unwrap());
        }
        for g in guards {
            g.release().await.unwrap();
        }
        let mut more = Vec::new();
        for _ in 0..25 {
            more.push(gov.acquire(q, JobId::new(), None).await.unwrap());
        }
        // 50 grants inside one second: window refuses, and the refused call
        // must not strand its slots.
        let denied = gov.acquire(q, JobId::new(), None).await;
        assert!(denied.is_err());
        let in_flight = gov.queue_in_flight(q).await.unwrap();
        assert_eq!(in_flight, 25);
        for g in more {
            g.release().await.unwrap();
        }
    }
}
