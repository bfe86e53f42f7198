//! The watchdog sweep

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use genesis_bus::{AddOpts, JobBus};
use genesis_store::Store;
use genesis_types::{
    BackoffPolicy, DropletState, JobPayload, QueueName, RebootReason,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::status::{AlertSeverity, AlertSink, ServiceStatusHandle};

const ACTOR: &str = "watchdog";

/// Resource alert thresholds (percent).
const CPU_ALERT: f64 = 90.0;
const MEM_ALERT: f64 = 85.0;
const DISK_ALERT: f64 = 90.0;

/// A sweep finding this many new zombies at once is an incident, not a
/// collection of isolated droplet failures.
const MASS_ZOMBIE_ALERT: usize = 10;

pub struct Watchdog {
    store: Arc<dyn Store>,
    bus: Arc<JobBus>,
    alerts: Arc<dyn AlertSink>,
    status: ServiceStatusHandle,
    interval: Duration,
    heartbeat_timeout: chrono::Duration,
}

impl Watchdog {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<JobBus>,
        alerts: Arc<dyn AlertSink>,
        status: ServiceStatusHandle,
        interval_seconds: u64,
        heartbeat_timeout_minutes: i64,
    ) -> Self {
        Self {
            store,
            bus,
            alerts,
            status,
            interval: Duration::from_secs(interval_seconds),
            heartbeat_timeout: chrono::Duration::minutes(heartbeat_timeout_minutes),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.status.write().running = true;
        info!(interval_s = self.interval.as_secs(), "watchdog started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            self.sweep().await;
        }
        self.status.write().running = false;
        info!("watchdog stopped");
    }

    /// One watchdog cycle. Fail-open: a dead queue backend downgrades the
    /// sweep to checks-and-alerts; zombies are neither journalled nor
    /// queued for reboot until the backend returns, so the next sweep
    /// retries them.
    pub async fn sweep(&self) {
        let droplets = match self.store.list_active_droplets().await {
            Ok(droplets) => droplets,
            Err(err) => {
                error!(error = %err, "watchdog cannot read droplet health");
                let mut status = self.status.write();
                status.error_count += 1;
                status.last_error = Some(err.to_string());
                return;
            }
        };

        let queue_backend_up = self.bus.kv().ping().await.is_ok();
        if !queue_backend_up {
            error!("queue backend unavailable, watchdog running degraded (no reboot emission)");
        }

        let now = Utc::now();
        let mut zombies = 0usize;
        for droplet in droplets {
            let reference = droplet.last_heartbeat.unwrap_or(droplet.created_at);
            let stale = now - reference > self.heartbeat_timeout;

            if stale {
                if !queue_backend_up {
                    // Cannot durably persist a reboot job; flag for manual
                    // intervention instead of zombifying without remedy.
                    error!(
                        tenant = %droplet.tenant_id,
                        droplet = %droplet.droplet_id,
                        last_heartbeat = ?droplet.last_heartbeat,
                        "CRITICAL: stale droplet detected while queue backend is down"
                    );
                    continue;
                }
                match self
                    .store
                    .transition(
                        droplet.droplet_id,
                        DropletState::Zombie,
                        "heartbeat timeout",
                        ACTOR,
                        serde_json::json!({ "last_heartbeat": droplet.last_heartbeat }),
                    )
                    .await
                {
                    Ok(_) => {}
                    Err(err) => {
                        warn!(droplet = %droplet.droplet_id, error = %err, "zombie transition failed");
                        continue;
                    }
                }
                let enqueue = self
                    .bus
                    .add(
                        QueueName::HardRebootDroplet,
                        JobPayload::HardRebootDroplet {
                            droplet_id: droplet.droplet_id,
                            tenant_id: droplet.tenant_id.clone(),
                            reason: RebootReason::WatchdogHeartbeatTimeout,
                        },
                        AddOpts {
                            max_attempts: Some(3),
                            backoff: Some(BackoffPolicy::exponential(10_000)),
                            idempotency_key: Some(format!("reboot:{}", droplet.droplet_id)),
                            ..AddOpts::default()
                        },
                    )
                    .await;
                match enqueue {
                    Ok(_) => zombies += 1,
                    Err(err) => {
                        error!(
                            droplet = %droplet.droplet_id,
                            error = %err,
                            "CRITICAL: zombie journalled but reboot job could not be enqueued"
                        );
                        let mut status = self.status.write();
                        status.error_count += 1;
                        status.last_error = Some(err.to_string());
                    }
                }
            }

            if droplet.cpu_pct > CPU_ALERT
                || droplet.mem_pct > MEM_ALERT
                || droplet.disk_pct > DISK_ALERT
            {
                self.alerts
                    .alert(
                        AlertSeverity::Warning,
                        &format!(
                            "droplet {} (tenant {}) resources hot: cpu {:.0}% mem {:.0}% disk {:.0}%",
                            droplet.droplet_id,
                            droplet.tenant_id,
                            droplet.cpu_pct,
                            droplet.mem_pct,
                            droplet.disk_pct
                        ),
                    )
                    .await;
            }
        }

        if zombies >= MASS_ZOMBIE_ALERT {
            self.alerts
                .alert(
                    AlertSeverity::Critical,
                    &format!("watchdog marked {} zombies in one sweep", zombies),
                )
                .await;
        }

        let mut status = self.status.write();
        status.last_run_at = Some(Utc::now());
        status.degraded = !queue_backend_up;
        status.degraded_reason = (!queue_backend_up)
            .then(|| "queue backend unavailable, reboot emission suspended".to_string());
    }
}
