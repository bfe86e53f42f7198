//! Ignition-queue handler: provision and teardown

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use genesis_adapters::cloud::CloudApi;
use genesis_bus::JobHandler;
use genesis_store::{hourly_rate, CostEvent, Store};
use genesis_types::{
    ControlError, ControlResult, DropletId, DropletState, Job, JobPayload, TenantId,
};
use tracing::{info, warn};

use crate::factory::{ProvisionRequest, ProvisioningFactory};

const ACTOR: &str = "ignition-handler";

/// Handles the `ignition` queue: `Ignition` payloads go through the
/// factory, `Teardown` payloads through the destruction path.
pub struct IgnitionHandler {
    factory: Arc<ProvisioningFactory>,
    store: Arc<dyn Store>,
    cloud: Arc<dyn CloudApi>,
}

impl IgnitionHandler {
    pub fn new(
        factory: Arc<ProvisioningFactory>,
        store: Arc<dyn Store>,
        cloud: Arc<dyn CloudApi>,
    ) -> Self {
        Self {
            factory,
            store,
            cloud,
        }
    }

    async fn teardown(
        &self,
        tenant_id: &TenantId,
        droplet_id: DropletId,
        reason: &str,
        force: bool,
    ) -> ControlResult<()> {
        let Some(droplet) = self.store.get_droplet_by_id(droplet_id).await? else {
            info!(%droplet_id, "teardown target already gone");
            return Ok(());
        };
        if droplet.tenant_id != *tenant_id {
            return Err(ControlError::ValidationFailed(format!(
                "droplet {} does not belong to tenant {}",
                droplet_id, tenant_id
            )));
        }
        let account = self
            .store
            .get_account(&droplet.account_id)
            .await?
            .ok_or_else(|| {
                ControlError::NotFound(format!("account {}", droplet.account_id))
            })?;

        if droplet.state != DropletState::Terminated {
            if !force {
                // Best-effort drain; a dead VM must not block its teardown.
                if let Err(err) = self.cloud.power_off(&account, droplet_id).await {
                    warn!(%droplet_id, error = %err, "graceful power-off failed, continuing");
                }
            }
            // Journal + account decrement in one logical transaction,
            // before the destructive provider call.
            self.store
                .terminate_droplet(droplet_id, reason, ACTOR)
                .await?;
        }

        self.cloud.delete_vm(&account, droplet_id).await?;
        let _ = self
            .store
            .record_cost_event(&CostEvent {
                tenant_id: tenant_id.clone(),
                droplet_id,
                kind: "teardown".into(),
                amount_delta: -hourly_rate(&droplet.size_slug),
                at: Utc::now(),
            })
            .await;
        info!(%droplet_id, tenant = %tenant_id, "droplet torn down");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for IgnitionHandler {
    async fn handle(&self, job: &Job) -> ControlResult<()> {
        match &job.payload {
            JobPayload::Ignition {
                tenant_id,
                slug,
                size_slug,
                region,
                requester,
                ..
            } => {
                self.factory
                    .provision(&ProvisionRequest {
                        tenant_id: tenant_id.clone(),
                        slug: slug.clone(),
                        size_slug: size_slug.clone(),
                        region: region.clone(),
                        requester: requester.clone(),
                    })
                    .await?;
                Ok(())
            }
            JobPayload::Teardown {
                tenant_id,
                droplet_id,
                reason,
                force,
            } => self.teardown(tenant_id, *droplet_id, reason, *force).await,
            other => Err(ControlError::ValidationFailed(format!(
                "ignition queue cannot handle {:?} payloads",
                other.default_queue()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_adapters::testing::{CloudCall, MockCloudApi};
    use genesis_bus::{AddOpts, JobBus, WorkerPool, WorkerRegistry};
    use genesis_config::{GovernorSettings, QueueTopology};
    use genesis_governor::Governor;
    use genesis_kv::MemoryKv;
    use genesis_store::MemoryStore;
    use genesis_types::{AccountId, AccountStatus, CloudAccount, QueueName, Secret};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::watch;

    struct World {
        store: Arc<MemoryStore>,
        cloud: Arc<MockCloudApi>,
        bus: Arc<JobBus>,
        handles: Vec<tokio::task::JoinHandle<()>>,
        shutdown_tx: watch::Sender<bool>,
        counters: Arc<genesis_bus::WorkerCounters>,
    }

    async fn world() -> World {
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(MockCloudApi::new());
        let topology = QueueTopology::default();
        let bus = Arc::new(JobBus::new(kv.clone(), topology.clone()));
        let governor = Arc::new(Governor::new(kv, GovernorSettings::default(), topology));
        let factory = Arc::new(ProvisioningFactory::new(store.clone(), cloud.clone()));
        let handler = Arc::new(IgnitionHandler::new(factory, store.clone(), cloud.clone()));

        store
            .insert_account(&CloudAccount {
                id: AccountId::new("acct-1"),
                api_token: Secret::new("tok"),
                region: "nyc3".into(),
                max_droplets: 100,
                current_droplets: 0,
                status: AccountStatus::Active,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let registry = WorkerRegistry::new();
        let counters = registry.register(QueueName::Ignition);
        let (shutdown_tx, _) = watch::channel(false);
        let pool = WorkerPool::new(
            QueueName::Ignition,
            bus.clone(),
            governor,
            handler,
            counters.clone(),
            shutdown_tx.subscribe(),
        );
        let handles = pool.spawn();
        World {
            store,
            cloud,
            bus,
            handles,
            shutdown_tx,
            counters,
        }
    }

    async fn drain(world: World) {
        world.shutdown_tx.send(true).unwrap();
        for h in world.handles {
            let _ = h.await;
        }
    }

    async fn wait_for_completions(w: &World, n: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while w.counters.completed.load(Ordering::Relaxed) < n {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} completions",
                n
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn idempotent_ignition_creates_one_vm() {
        let w = world().await;
        let payload = JobPayload::Ignition {
            tenant_id: TenantId::from("t-1"),
            slug: "acme".into(),
            size_slug: "s-2vcpu-4gb".into(),
            region: "nyc3".into(),
            requester: "upstream-api".into(),
            priority_override: None,
        };

        let first = w
            .bus
            .add(
                QueueName::Ignition,
                payload.clone(),
                AddOpts::with_idempotency_key("ignite:t-1"),
            )
            .await
            .unwrap();
        let second = w
            .bus
            .add(
                QueueName::Ignition,
                payload,
                AddOpts::with_idempotency_key("ignite:t-1"),
            )
            .await
            .unwrap();
        assert_eq!(first, second);

        wait_for_completions(&w, 1).await;

        assert_eq!(w.cloud.count(|c| matches!(c, CloudCall::Create(_))), 1);
        let droplet = w
            .store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        let events = w.store.lifecycle_events(droplet.droplet_id).await.unwrap();
        assert_eq!(
            events
                .iter()
                .filter(|e| e.to_state == DropletState::Initializing)
                .count(),
            1
        );
        let acct = w
            .store
            .get_account(&AccountId::new("acct-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acct.current_droplets, 1);
        drain(w).await;
    }

    #[tokio::test]
    async fn teardown_deletes_vm_and_frees_slot() {
        let w = world().await;
        // Provision first.
        w.bus
            .add(
                QueueName::Ignition,
                JobPayload::Ignition {
                    tenant_id: TenantId::from("t-1"),
                    slug: "acme".into(),
                    size_slug: "s-2vcpu-4gb".into(),
                    region: "nyc3".into(),
                    requester: "upstream-api".into(),
                    priority_override: None,
                },
                AddOpts::default(),
            )
            .await
            .unwrap();
        wait_for_completions(&w, 1).await;
        let droplet = w
            .store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();

        // Terminated is only legal from active states; mirror the normal
        // handshake first.
        for state in [DropletState::HandshakePending, DropletState::ActiveHealthy] {
            w.store
                .transition(droplet.droplet_id, state, "test", "test", serde_json::Value::Null)
                .await
                .unwrap();
        }

        w.bus
            .add(
                QueueName::Ignition,
                JobPayload::Teardown {
                    tenant_id: TenantId::from("t-1"),
                    droplet_id: droplet.droplet_id,
                    reason: "offboarding".into(),
                    force: false,
                },
                AddOpts::default(),
            )
            .await
            .unwrap();
        wait_for_completions(&w, 2).await;

        assert_eq!(w.cloud.count(|c| matches!(c, CloudCall::Delete(_))), 1);
        assert_eq!(w.cloud.count(|c| matches!(c, CloudCall::PowerOff(_))), 1);
        let after = w
            .store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.state, DropletState::Terminated);
        let acct = w
            .store
            .get_account(&AccountId::new("acct-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acct.current_droplets, 0);
        drain(w).await;
    }
}
