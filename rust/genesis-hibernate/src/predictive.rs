//! Predictive pre-warm for high-priority tenants
//!
//! Looks ahead over scheduled campaign start times and schedules wake jobs
//! at `predicted_activity - pre_warm_minutes` so the droplet is warm when
//! the campaign fires. The prediction oracle is the scheduled-campaigns
//! table; re-hibernation after the activity window is the sweep's job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use genesis_bus::{AddOpts, JobBus};
use genesis_store::Store;
use genesis_types::{ControlResult, DropletState, JobPayload, QueueName, Tier, WakeReason};
use genesis_watchdog::ServiceStatusHandle;
use tokio::sync::watch;
use tracing::{info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub struct PredictiveWarmer {
    store: Arc<dyn Store>,
    bus: Arc<JobBus>,
    status: ServiceStatusHandle,
    lookahead_hours: i64,
    pre_warm_minutes: i64,
}

impl PredictiveWarmer {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<JobBus>,
        status: ServiceStatusHandle,
        lookahead_hours: i64,
        pre_warm_minutes: i64,
    ) -> Self {
        Self {
            store,
            bus,
            status,
            lookahead_hours,
            pre_warm_minutes,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.status.write().running = true;
        info!(
            lookahead_h = self.lookahead_hours,
            pre_warm_m = self.pre_warm_minutes,
            "predictive warmer started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.sweep().await {
                warn!(error = %err, "predictive sweep failed");
                let mut status = self.status.write();
                status.error_count += 1;
                status.last_error = Some(err.to_string());
            }
        }
        self.status.write().running = false;
        info!("predictive warmer stopped");
    }

    /// Schedule wake jobs for upcoming campaigns of hibernated
    /// high-priority tenants. Returns the number scheduled.
    pub async fn sweep(&self) -> ControlResult<usize> {
        let now = Utc::now();
        let campaigns = self
            .store
            .scheduled_campaigns_between(now, now + chrono::Duration::hours(self.lookahead_hours))
            .await?;

        let mut scheduled = 0usize;
        for campaign in campaigns {
            let Some(tenant) = self.store.get_tenant(&campaign.tenant_id).await? else {
                continue;
            };
            if tenant.tier != Tier::HighPriority {
                continue;
            }
            let Some(droplet) = self.store.get_droplet(&tenant.id).await? else {
                continue;
            };
            if droplet.state != DropletState::Hibernated {
                continue;
            }

            let wake_at = campaign.scheduled_at
                - chrono::Duration::minutes(self.pre_warm_minutes);
            let delay_ms = (wake_at - now).num_milliseconds().max(0) as u64;
            self.bus
                .add(
                    QueueName::WakeDroplet,
                    JobPayload::WakeDroplet {
                        tenant_id: tenant.id.clone(),
                        droplet_id: droplet.droplet_id,
                        reason: WakeReason::ScheduledCampaign,
                    },
                    AddOpts {
                        delay_ms: Some(delay_ms),
                        idempotency_key: Some(format!(
                            "prewarm:{}:{}",
                            tenant.id,
                            campaign.scheduled_at.timestamp()
                        )),
                        ..AddOpts::default()
                    },
                )
                .await?;
            scheduled += 1;
        }

        self.status.write().last_run_at = Some(Utc::now());
        if scheduled > 0 {
            info!(scheduled, "pre-warm wakes scheduled");
        }
        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_config::QueueTopology;
    use genesis_governor::epoch_ms;
    use genesis_kv::{KvStore, MemoryKv};
    use genesis_store::{MemoryStore, ScheduledCampaign};
    use genesis_types::{
        derive_public_dns, AccountId, DropletHealth, DropletId, Tenant, TenantId,
    };
    use genesis_watchdog::new_status;

    async fn seed(store: &MemoryStore, tenant: &str, tier: Tier, state: DropletState, id: u64) {
        store
            .insert_tenant(&Tenant {
                id: TenantId::from(tenant),
                slug: tenant.to_string(),
                region: "nyc3".into(),
                tier,
            })
            .await
            .unwrap();
        let ip = format!("203.0.113.{}", id);
        store
            .create_droplet(
                &DropletHealth {
                    tenant_id: TenantId::from(tenant),
                    droplet_id: DropletId(id),
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
                    engine_healthy: false,
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
    }

    #[tokio::test]
    async fn schedules_delayed_wake_for_high_priority_only() {
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(JobBus::new(kv.clone(), QueueTopology::default()));
        seed(&store, "t-hp", Tier::HighPriority, DropletState::Hibernated, 1).await;
        seed(&store, "t-std", Tier::Standard, DropletState::Hibernated, 2).await;
        let in_30m = Utc::now() + chrono::Duration::minutes(30);
        store.add_scheduled_campaign(ScheduledCampaign {
            tenant_id: TenantId::from("t-hp"),
            scheduled_at: in_30m,
        });
        store.add_scheduled_campaign(ScheduledCampaign {
            tenant_id: TenantId::from("t-std"),
            scheduled_at: in_30m,
        });

        let warmer = PredictiveWarmer::new(
            store.clone(),
            bus.clone(),
            new_status("predictive-warmer"),
            24,
            10,
        );
        assert_eq!(warmer.sweep().await.unwrap(), 1);

        // One delayed job: not ready now, due around campaign - 10 min.
        assert_eq!(bus.queue_depth(QueueName::WakeDroplet).await.unwrap(), 1);
        assert!(kv
            .dequeue(QueueName::WakeDroplet, epoch_ms(), 1_000)
            .await
            .unwrap()
            .is_none());
        let due_ms = epoch_ms() + 21 * 60 * 1_000;
        let job = kv
            .dequeue(QueueName::WakeDroplet, due_ms, 1_000)
            .await
            .unwrap()
            .unwrap();
        let parsed: genesis_types::Job = serde_json::from_str(&job.payload_json).unwrap();
        match parsed.payload {
            JobPayload::WakeDroplet { tenant_id, reason, .. } => {
                assert_eq!(tenant_id, TenantId::from("t-hp"));
                assert_eq!(reason, WakeReason::ScheduledCampaign);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn repeated_sweep_does_not_duplicate() {
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(JobBus::new(kv, QueueTopology::default()));
        seed(&store, "t-hp", Tier::HighPriority, DropletState::Hibernated, 1).await;
        store.add_scheduled_campaign(ScheduledCampaign {
            tenant_id: TenantId::from("t-hp"),
            scheduled_at: Utc::now() + chrono::Duration::hours(2),
        });
        let warmer = PredictiveWarmer::new(
            store,
            bus.clone(),
            new_status("predictive-warmer"),
            24,
            10,
        );
        warmer.sweep().await.unwrap();
        warmer.sweep().await.unwrap();
        assert_eq!(bus.queue_depth(QueueName::WakeDroplet).await.unwrap(), 1);
    }
}
