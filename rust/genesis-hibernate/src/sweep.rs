//! Periodic hibernation sweep
//!
//! Scans the fleet for eligible tenants and initiates their hibernation.
//! Failures are surfaced and left for the operator; the flow never
//! auto-retries a half-hibernated droplet.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use genesis_store::{Store, TenantActivity};
use genesis_types::DropletState;
use genesis_watchdog::ServiceStatusHandle;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::controller::HibernationController;
use crate::eligibility::check_eligibility;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3_600);

pub struct HibernationSweep {
    store: Arc<dyn Store>,
    controller: Arc<HibernationController>,
    status: ServiceStatusHandle,
}

impl HibernationSweep {
    pub fn new(
        store: Arc<dyn Store>,
        controller: Arc<HibernationController>,
        status: ServiceStatusHandle,
    ) -> Self {
        Self {
            store,
            controller,
            status,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.status.write().running = true;
        info!("hibernation sweep started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            self.sweep().await;
        }
        self.status.write().running = false;
        info!("hibernation sweep stopped");
    }

    /// One pass over the fleet. Returns how many hibernations started.
    pub async fn sweep(&self) -> usize {
        let tenants = match self.store.list_tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                warn!(error = %err, "hibernation sweep cannot list tenants");
                let mut status = self.status.write();
                status.error_count += 1;
                status.last_error = Some(err.to_string());
                return 0;
            }
        };

        let mut hibernated = 0usize;
        for tenant in tenants {
            let droplet = match self.store.get_droplet(&tenant.id).await {
                Ok(Some(droplet)) => droplet,
                Ok(None) => continue,
                Err(err) => {
                    warn!(tenant = %tenant.id, error = %err, "sweep skipped tenant");
                    continue;
                }
            };
            if !matches!(
                droplet.state,
                DropletState::ActiveHealthy | DropletState::ActiveDegraded
            ) {
                continue;
            }

            let activity = match self.store.get_activity(&tenant.id).await {
                Ok(activity) => activity.unwrap_or(TenantActivity {
                    tenant_id: tenant.id.clone(),
                    last_campaign_at: None,
                    last_execution_at: None,
                    last_login_at: None,
                    account_active: true,
                    manual_hold: false,
                }),
                Err(err) => {
                    warn!(tenant = %tenant.id, error = %err, "sweep skipped tenant");
                    continue;
                }
            };

            let eligibility =
                check_eligibility(&tenant, &activity, self.controller.settings(), Utc::now());
            let outcome = if eligibility.eligible {
                self.controller.hibernate(&tenant.id).await.map(|_| true)
            } else {
                // The short-window path for pre-warmed high-priority
                // tenants that have gone quiet again.
                self.controller.rehibernate_after_prewarm(&tenant.id).await
            };
            match outcome {
                Ok(true) => hibernated += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(tenant = %tenant.id, error = %err,
                          "hibernation halted, operator attention required");
                    let mut status = self.status.write();
                    status.error_count += 1;
                    status.last_error = Some(err.to_string());
                }
            }
        }

        self.status.write().last_run_at = Some(Utc::now());
        if hibernated > 0 {
            info!(hibernated, "hibernation sweep finished");
        }
        hibernated
    }
}
