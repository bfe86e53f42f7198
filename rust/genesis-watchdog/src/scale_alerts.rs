//! Scale alerts
//!
//! Periodic sampling of fleet-level metrics: pooled capacity headroom,
//! per-queue DLQ depth (alerting, never truncating), and zombie density.
//! Also the home of DLQ retention pruning.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use genesis_bus::JobBus;
use genesis_config::DlqSettings;
use genesis_store::Store;
use genesis_types::{DropletState, QueueName};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::status::{AlertSeverity, AlertSink, ServiceStatusHandle};

/// Alert when the fleet occupies this share of pooled account capacity.
const CAPACITY_ALERT_RATIO: f64 = 0.9;

/// Zombie count that indicates a systemic failure.
const ZOMBIE_ALERT: u64 = 10;

pub struct ScaleAlerts {
    store: Arc<dyn Store>,
    bus: Arc<JobBus>,
    alerts: Arc<dyn AlertSink>,
    status: ServiceStatusHandle,
    interval: Duration,
    dlq: DlqSettings,
}

impl ScaleAlerts {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<JobBus>,
        alerts: Arc<dyn AlertSink>,
        status: ServiceStatusHandle,
        interval_minutes: u64,
        dlq: DlqSettings,
    ) -> Self {
        Self {
            store,
            bus,
            alerts,
            status,
            interval: Duration::from_secs(interval_minutes * 60),
            dlq,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.status.write().running = true;
        info!(interval_s = self.interval.as_secs(), "scale alerts started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            self.sample().await;
        }
        self.status.write().running = false;
        info!("scale alerts stopped");
    }

    pub async fn sample(&self) {
        if let Err(err) = self.sample_inner().await {
            warn!(error = %err, "scale alert sample failed");
            let mut status = self.status.write();
            status.error_count += 1;
            status.last_error = Some(err.to_string());
            return;
        }
        self.status.write().last_run_at = Some(Utc::now());
    }

    async fn sample_inner(&self) -> genesis_types::ControlResult<()> {
        let summary = self.store.fleet_summary().await?;
        let live = summary
            .total
            .saturating_sub(summary.count(DropletState::Terminated))
            .saturating_sub(summary.count(DropletState::Orphan));

        let capacity: u64 = self
            .store
            .list_accounts()
            .await?
            .iter()
            .map(|a| a.max_droplets as u64)
            .sum();
        if capacity > 0 && live as f64 >= capacity as f64 * CAPACITY_ALERT_RATIO {
            self.alerts
                .alert(
                    AlertSeverity::Warning,
                    &format!(
                        "fleet at {}/{} droplets ({:.0}% of pooled capacity); expand the account pool",
                        live,
                        capacity,
                        live as f64 / capacity as f64 * 100.0
                    ),
                )
                .await;
        }

        for queue in QueueName::ALL {
            let depth = self.bus.dlq_len(queue).await?;
            if depth as usize >= self.dlq.alert_threshold {
                self.alerts
                    .alert(
                        AlertSeverity::Warning,
                        &format!("queue {} has {} dead-lettered jobs", queue, depth),
                    )
                    .await;
            }
        }

        let zombies = summary.count(DropletState::Zombie);
        if zombies >= ZOMBIE_ALERT {
            self.alerts
                .alert(
                    AlertSeverity::Critical,
                    &format!("{} droplets currently in ZOMBIE state", zombies),
                )
                .await;
        }

        // Retention enforcement, unrelated to the alert threshold.
        let pruned = self.bus.prune_dlq(self.dlq.retention_days).await?;
        if pruned > 0 {
            info!(pruned, "dlq entries dropped past retention");
        }
        Ok(())
    }
}
