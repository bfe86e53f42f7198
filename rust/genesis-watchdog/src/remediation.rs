//! Remediation and probe handlers
//!
//! `hard-reboot-droplet`/`reboot`: power-cycle a zombie and wait for the
//! sidecar to come back. `health`: probe one sidecar and reconcile the
//! degraded flag. `metric`: persist a usage sample to the cost journal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use genesis_adapters::cloud::CloudApi;
use genesis_adapters::sidecar::{wait_healthy, SidecarApi};
use genesis_bus::JobHandler;
use genesis_store::{CostEvent, Store};
use genesis_types::{
    ControlError, ControlResult, DropletId, DropletState, Job, JobPayload, TenantId,
};
use tracing::{info, warn};

const ACTOR: &str = "remediation";

/// Power-cycles a droplet and gates recovery on sidecar health.
pub struct RebootHandler {
    store: Arc<dyn Store>,
    cloud: Arc<dyn CloudApi>,
    sidecar: Arc<dyn SidecarApi>,
    health_budget: Duration,
    health_cadence: Duration,
}

impl RebootHandler {
    pub fn new(
        store: Arc<dyn Store>,
        cloud: Arc<dyn CloudApi>,
        sidecar: Arc<dyn SidecarApi>,
    ) -> Self {
        Self {
            store,
            cloud,
            sidecar,
            health_budget: Duration::from_secs(120),
            health_cadence: Duration::from_secs(5),
        }
    }

    pub fn with_health_poll(mut self, budget: Duration, cadence: Duration) -> Self {
        self.health_budget = budget;
        self.health_cadence = cadence;
        self
    }

    async fn reboot(&self, tenant_id: &TenantId, droplet_id: DropletId) -> ControlResult<()> {
        let Some(droplet) = self.store.get_droplet_by_id(droplet_id).await? else {
            info!(%droplet_id, "reboot target gone, nothing to do");
            return Ok(());
        };
        if droplet.state.is_terminal() {
            return Ok(());
        }
        let account = self
            .store
            .get_account(&droplet.account_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("account {}", droplet.account_id)))?;

        // Admin-requested reboots arrive on active droplets; journal the
        // zombie hop so the recovery path is one shape.
        if matches!(
            droplet.state,
            DropletState::ActiveHealthy | DropletState::ActiveDegraded
        ) {
            self.store
                .transition(
                    droplet_id,
                    DropletState::Zombie,
                    "reboot requested",
                    ACTOR,
                    serde_json::Value::Null,
                )
                .await?;
        }
        if self.store.get_droplet_by_id(droplet_id).await?.map(|d| d.state)
            == Some(DropletState::Zombie)
        {
            self.store
                .transition(
                    droplet_id,
                    DropletState::Rebooting,
                    "power cycle",
                    ACTOR,
                    serde_json::Value::Null,
                )
                .await?;
        }

        self.cloud.power_cycle(&account, droplet_id).await?;

        let base_url = format!("https://{}", droplet.public_dns);
        match wait_healthy(
            self.sidecar.as_ref(),
            &base_url,
            self.health_budget,
            self.health_cadence,
        )
        .await
        {
            Ok(()) => {
                self.store
                    .transition(
                        droplet_id,
                        DropletState::ActiveHealthy,
                        "reboot recovered",
                        ACTOR,
                        serde_json::Value::Null,
                    )
                    .await?;
                info!(tenant = %tenant_id, %droplet_id, "droplet recovered after reboot");
                Ok(())
            }
            Err(err) => {
                // Back to zombie; the bus's retry budget decides whether
                // another cycle is attempted.
                if let Err(back_err) = self
                    .store
                    .transition(
                        droplet_id,
                        DropletState::Zombie,
                        "reboot did not recover",
                        ACTOR,
                        serde_json::Value::Null,
                    )
                    .await
                {
                    warn!(%droplet_id, error = %back_err, "zombie re-mark failed");
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl JobHandler for RebootHandler {
    async fn handle(&self, job: &Job) -> ControlResult<()> {
        match &job.payload {
            JobPayload::HardRebootDroplet {
                droplet_id,
                tenant_id,
                ..
            } => self.reboot(tenant_id, *droplet_id).await,
            other => Err(ControlError::ValidationFailed(format!(
                "reboot handler got a {} payload",
                other.default_queue()
            ))),
        }
    }
}

/// Probes one sidecar and reconciles ACTIVE_HEALTHY/ACTIVE_DEGRADED.
pub struct HealthProbeHandler {
    store: Arc<dyn Store>,
    sidecar: Arc<dyn SidecarApi>,
}

impl HealthProbeHandler {
    pub fn new(store: Arc<dyn Store>, sidecar: Arc<dyn SidecarApi>) -> Self {
        Self { store, sidecar }
    }
}

#[async_trait]
impl JobHandler for HealthProbeHandler {
    async fn handle(&self, job: &Job) -> ControlResult<()> {
        let JobPayload::HealthProbe {
            tenant_id,
            droplet_id,
        } = &job.payload
        else {
            return Err(ControlError::ValidationFailed(
                "health handler got a foreign payload".to_string(),
            ));
        };
        let Some(droplet) = self.store.get_droplet(tenant_id).await? else {
            return Ok(());
        };
        let base_url = format!("https://{}", droplet.public_dns);
        let healthy = self.sidecar.health(&base_url).await.unwrap_or(false);

        match (droplet.state, healthy) {
            (DropletState::ActiveHealthy, false) => {
                self.store
                    .transition(
                        *droplet_id,
                        DropletState::ActiveDegraded,
                        "health probe failed",
                        ACTOR,
                        serde_json::Value::Null,
                    )
                    .await?;
            }
            (DropletState::ActiveDegraded, true) => {
                self.store
                    .transition(
                        *droplet_id,
                        DropletState::ActiveHealthy,
                        "health probe recovered",
                        ACTOR,
                        serde_json::Value::Null,
                    )
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Persists a usage sample for the tenant's cost history.
pub struct MetricSnapshotHandler {
    store: Arc<dyn Store>,
}

impl MetricSnapshotHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for MetricSnapshotHandler {
    async fn handle(&self, job: &Job) -> ControlResult<()> {
        let JobPayload::MetricSnapshot {
            tenant_id,
            droplet_id,
        } = &job.payload
        else {
            return Err(ControlError::ValidationFailed(
                "metric handler got a foreign payload".to_string(),
            ));
        };
        if self.store.get_droplet(tenant_id).await?.is_none() {
            return Ok(());
        }
        self.store
            .record_cost_event(&CostEvent {
                tenant_id: tenant_id.clone(),
                droplet_id: *droplet_id,
                kind: "usage-sample".into(),
                amount_delta: 0.0,
                at: Utc::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_adapters::testing::{CloudCall, MockCloudApi, MockSidecar};
    use genesis_store::MemoryStore;
    use genesis_types::{
        derive_public_dns, AccountId, AccountStatus, BackoffPolicy, CloudAccount, DropletHealth,
        JobId, QueueName, RebootReason, Secret,
    };

    async fn world(state: DropletState) -> (Arc<MemoryStore>, Arc<MockCloudApi>, Arc<MockSidecar>, String) {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(MockCloudApi::new());
        let sidecar = Arc::new(MockSidecar::new());
        store
            .insert_account(&CloudAccount {
                id: AccountId::new("acct-1"),
                api_token: Secret::new("tok"),
                region: "nyc3".into(),
                max_droplets: 10,
                current_droplets: 1,
                status: AccountStatus::Active,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let ip = "203.0.113.9".to_string();
        let base = format!("https://{}", derive_public_dns(&ip));
        store
            .create_droplet(
                &DropletHealth {
                    tenant_id: TenantId::from("t-1"),
                    droplet_id: DropletId(9),
                    account_id: AccountId::new("acct-1"),
                    region: "nyc3".into(),
                    size_slug: "s-2vcpu-4gb".into(),
                    public_dns: derive_public_dns(&ip),
                    public_ip: ip,
                    state,
                    last_heartbeat: None,
                    cpu_pct: 0.0,
                    mem_pct: 0.0,
                    disk_pct: 0.0,
                    engine_healthy: true,
                    sidecar_version: None,
                    credential_fingerprint: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
                "seeded",
                "test",
            )
            .await
            .unwrap();
        (store, cloud, sidecar, base)
    }

    fn reboot_job() -> Job {
        Job {
            id: JobId::new(),
            queue: QueueName::HardRebootDroplet,
            priority: 2,
            attempts: 0,
            max_attempts: 3,
            backoff: BackoffPolicy::exponential(10_000),
            idempotency_key: None,
            replay_of: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            payload: JobPayload::HardRebootDroplet {
                droplet_id: DropletId(9),
                tenant_id: TenantId::from("t-1"),
                reason: RebootReason::ZombieDetected,
            },
        }
    }

    #[tokio::test]
    async fn zombie_reboot_recovers_to_active() {
        let (store, cloud, sidecar, _) = world(DropletState::Zombie).await;
        let handler = RebootHandler::new(store.clone(), cloud.clone(), sidecar)
            .with_health_poll(Duration::from_millis(200), Duration::from_millis(20));
        handler.handle(&reboot_job()).await.unwrap();

        assert_eq!(cloud.count(|c| matches!(c, CloudCall::PowerCycle(_))), 1);
        let droplet = store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(droplet.state, DropletState::ActiveHealthy);
        let states: Vec<DropletState> = store
            .lifecycle_events(DropletId(9))
            .await
            .unwrap()
            .iter()
            .map(|e| e.to_state)
            .collect();
        assert!(states.ends_with(&[DropletState::Rebooting, DropletState::ActiveHealthy]));
    }

    #[tokio::test]
    async fn unrecovered_reboot_returns_to_zombie_and_fails() {
        let (store, cloud, sidecar, base) = world(DropletState::Zombie).await;
        sidecar.script_health(&base, std::iter::repeat(false).take(64));
        let handler = RebootHandler::new(store.clone(), cloud, sidecar)
            .with_health_poll(Duration::from_millis(100), Duration::from_millis(20));
        let err = handler.handle(&reboot_job()).await.unwrap_err();
        assert!(err.is_retryable());
        let droplet = store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(droplet.state, DropletState::Zombie);
    }

    #[tokio::test]
    async fn failed_probe_degrades_droplet() {
        let (store, _, sidecar, base) = world(DropletState::ActiveHealthy).await;
        sidecar.script_health(&base, [false]);
        let handler = HealthProbeHandler::new(store.clone(), sidecar.clone());
        let job = Job {
            payload: JobPayload::HealthProbe {
                tenant_id: TenantId::from("t-1"),
                droplet_id: DropletId(9),
            },
            ..reboot_job()
        };
        handler.handle(&job).await.unwrap();
        let droplet = store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(droplet.state, DropletState::ActiveDegraded);

        // Next probe sees it healthy again.
        handler.handle(&job).await.unwrap();
        let droplet = store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(droplet.state, DropletState::ActiveHealthy);
    }
}
