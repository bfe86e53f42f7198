//! Hibernate and wake flows
//!
//! Both flows are strictly ordered; each step's completion is checkpointed
//! in the flow journal before the next step begins. A hibernate failure
//! halts the sequence and surfaces the error with no automatic retry (the
//! operator decides). Wake failures park the droplet as a zombie for the
//! watchdog.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use genesis_adapters::cloud::CloudApi;
use genesis_adapters::sidecar::{wait_healthy, SidecarApi};
use genesis_bus::JobHandler;
use genesis_config::HibernationSettings;
use genesis_store::{hourly_rate, CostEvent, Store, TenantActivity};
use genesis_types::{
    ControlError, ControlResult, DropletHealth, DropletId, DropletState, FlowStepRecord, Job,
    JobPayload, Tenant, TenantId, Tier, WakeReason,
};
use genesis_watchdog::{AlertSeverity, AlertSink};
use tracing::{info, warn};

use crate::eligibility::check_eligibility;

const ACTOR: &str = "hibernation-controller";

pub struct HibernationController {
    store: Arc<dyn Store>,
    cloud: Arc<dyn CloudApi>,
    sidecar: Arc<dyn SidecarApi>,
    alerts: Arc<dyn AlertSink>,
    settings: HibernationSettings,
}

impl HibernationController {
    pub fn new(
        store: Arc<dyn Store>,
        cloud: Arc<dyn CloudApi>,
        sidecar: Arc<dyn SidecarApi>,
        alerts: Arc<dyn AlertSink>,
        settings: HibernationSettings,
    ) -> Self {
        Self {
            store,
            cloud,
            sidecar,
            alerts,
            settings,
        }
    }

    pub fn settings(&self) -> &HibernationSettings {
        &self.settings
    }

    async fn checkpoint(&self, droplet: &DropletHealth, flow: &str, step: &str) -> ControlResult<()> {
        self.store
            .record_flow_step(&FlowStepRecord {
                droplet_id: droplet.droplet_id,
                tenant_id: droplet.tenant_id.clone(),
                flow: flow.to_string(),
                step: step.to_string(),
                at: Utc::now(),
            })
            .await
    }

    /// Orderly shutdown: notification, metric snapshot, engine stop, VM
    /// power-off, lifecycle to HIBERNATED, cost entry.
    pub async fn hibernate(&self, tenant_id: &TenantId) -> ControlResult<()> {
        let tenant = self
            .store
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("tenant {}", tenant_id)))?;
        let activity = self
            .store
            .get_activity(tenant_id)
            .await?
            .unwrap_or(TenantActivity {
                tenant_id: tenant_id.clone(),
                last_campaign_at: None,
                last_execution_at: None,
                last_login_at: None,
                account_active: true,
                manual_hold: false,
            });
        let eligibility = check_eligibility(&tenant, &activity, &self.settings, Utc::now());
        if !eligibility.eligible {
            return Err(ControlError::ValidationFailed(eligibility.reason));
        }
        self.execute_hibernate(&tenant, &eligibility.reason).await
    }

    /// A pre-warmed high-priority tenant re-hibernates after
    /// `auto_hibernate_after_hours` of post-campaign inactivity, without
    /// waiting out the day-scale idle windows. Returns whether it applied.
    pub async fn rehibernate_after_prewarm(&self, tenant_id: &TenantId) -> ControlResult<bool> {
        let Some(tenant) = self.store.get_tenant(tenant_id).await? else {
            return Ok(false);
        };
        if tenant.tier != Tier::HighPriority {
            return Ok(false);
        }
        let Some(droplet) = self.store.get_droplet(tenant_id).await? else {
            return Ok(false);
        };
        if !matches!(
            droplet.state,
            DropletState::ActiveHealthy | DropletState::ActiveDegraded
        ) {
            return Ok(false);
        }
        let Some(activity) = self.store.get_activity(tenant_id).await? else {
            return Ok(false);
        };
        if activity.manual_hold || !activity.account_active {
            return Ok(false);
        }

        let idle_floor = Utc::now()
            - chrono::Duration::hours(self.settings.auto_hibernate_after_hours);
        let recently_active = [
            activity.last_campaign_at,
            activity.last_execution_at,
            activity.last_login_at,
        ]
        .iter()
        .any(|t| t.is_some_and(|at| at > idle_floor));
        if recently_active {
            return Ok(false);
        }

        // Only wakes the warmer initiated qualify, and the quiet period is
        // measured from that wake.
        let events = self.store.lifecycle_events(droplet.droplet_id).await?;
        let Some(last_wake) = events
            .iter()
            .rev()
            .find(|e| e.to_state == DropletState::Waking)
        else {
            return Ok(false);
        };
        if !last_wake.reason.contains("scheduled_campaign") || last_wake.at > idle_floor {
            return Ok(false);
        }

        self.execute_hibernate(&tenant, "post-activity auto-hibernate")
            .await?;
        Ok(true)
    }

    async fn execute_hibernate(&self, tenant: &Tenant, reason: &str) -> ControlResult<()> {
        let tenant_id = &tenant.id;
        let droplet = self
            .store
            .get_droplet(tenant_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("droplet for tenant {}", tenant_id)))?;
        if !matches!(
            droplet.state,
            DropletState::ActiveHealthy | DropletState::ActiveDegraded
        ) {
            return Err(ControlError::ValidationFailed(format!(
                "droplet {} is {}, not active",
                droplet.droplet_id,
                droplet.state.as_str()
            )));
        }
        let account = self
            .store
            .get_account(&droplet.account_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("account {}", droplet.account_id)))?;

        self.store
            .transition(
                droplet.droplet_id,
                DropletState::Hibernating,
                "hibernation started",
                ACTOR,
                serde_json::json!({ "reason": reason }),
            )
            .await?;

        self.alerts
            .alert(
                AlertSeverity::Info,
                &format!(
                    "tenant {} ({}) entering hibernation",
                    tenant_id, tenant.slug
                ),
            )
            .await;
        self.checkpoint(&droplet, "hibernate", "notification").await?;

        self.store
            .record_cost_event(&CostEvent {
                tenant_id: tenant_id.clone(),
                droplet_id: droplet.droplet_id,
                kind: "pre-hibernate-sample".into(),
                amount_delta: 0.0,
                at: Utc::now(),
            })
            .await?;
        self.checkpoint(&droplet, "hibernate", "metric-snapshot")
            .await?;

        let base_url = format!("https://{}", droplet.public_dns);
        self.sidecar.stop_engine(&base_url).await?;
        self.checkpoint(&droplet, "hibernate", "engine-stop").await?;

        self.cloud.power_off(&account, droplet.droplet_id).await?;
        self.checkpoint(&droplet, "hibernate", "power-off").await?;

        self.store
            .transition(
                droplet.droplet_id,
                DropletState::Hibernated,
                "hibernation complete",
                ACTOR,
                serde_json::Value::Null,
            )
            .await?;

        self.store
            .record_cost_event(&CostEvent {
                tenant_id: tenant_id.clone(),
                droplet_id: droplet.droplet_id,
                kind: "hibernate-save".into(),
                amount_delta: -hourly_rate(&droplet.size_slug),
                at: Utc::now(),
            })
            .await?;
        info!(tenant = %tenant_id, droplet = %droplet.droplet_id, "tenant hibernated");
        Ok(())
    }

    /// Power-on, await provider `active`, await sidecar health, lifecycle
    /// to ACTIVE_HEALTHY, cost entry.
    pub async fn wake(
        &self,
        tenant_id: &TenantId,
        droplet_id: DropletId,
        reason: WakeReason,
    ) -> ControlResult<()> {
        let droplet = self
            .store
            .get_droplet(tenant_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("droplet for tenant {}", tenant_id)))?;
        if droplet.droplet_id != droplet_id {
            return Err(ControlError::ValidationFailed(format!(
                "droplet {} no longer belongs to tenant {}",
                droplet_id, tenant_id
            )));
        }
        match droplet.state {
            DropletState::ActiveHealthy => return Ok(()),
            DropletState::Hibernated => {
                self.store
                    .transition(
                        droplet_id,
                        DropletState::Waking,
                        &format!("wake requested ({})", reason.as_str()),
                        ACTOR,
                        serde_json::Value::Null,
                    )
                    .await?;
            }
            // Redelivered wake mid-flow: continue without re-journalling.
            DropletState::Waking => {}
            other => {
                return Err(ControlError::ValidationFailed(format!(
                    "droplet {} is {}, cannot wake",
                    droplet_id,
                    other.as_str()
                )));
            }
        }
        let account = self
            .store
            .get_account(&droplet.account_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("account {}", droplet.account_id)))?;

        self.cloud.power_on(&account, droplet_id).await?;
        self.checkpoint(&droplet, "wake", "power-on").await?;

        let status_deadline = tokio::time::Instant::now()
            + StdDuration::from_secs(self.settings.wake_status_budget_s);
        loop {
            match self.cloud.get_vm(&account, droplet_id).await {
                Ok(status) if status.is_active() => break,
                Ok(_) | Err(_) if tokio::time::Instant::now() < status_deadline => {
                    tokio::time::sleep(StdDuration::from_secs(self.settings.wake_status_poll_s))
                        .await;
                }
                Ok(status) => {
                    self.park_as_zombie(droplet_id, "provider never reported active")
                        .await;
                    return Err(ControlError::Timeout(format!(
                        "droplet {} stuck in provider status {:?}",
                        droplet_id, status
                    )));
                }
                Err(err) => {
                    self.park_as_zombie(droplet_id, "provider status poll failed")
                        .await;
                    return Err(err);
                }
            }
        }
        self.checkpoint(&droplet, "wake", "provider-active").await?;

        let base_url = format!("https://{}", droplet.public_dns);
        if let Err(err) = wait_healthy(
            self.sidecar.as_ref(),
            &base_url,
            StdDuration::from_secs(self.settings.wake_health_budget_s),
            StdDuration::from_secs(self.settings.wake_health_poll_s),
        )
        .await
        {
            self.park_as_zombie(droplet_id, "sidecar unhealthy after wake")
                .await;
            return Err(err);
        }
        self.checkpoint(&droplet, "wake", "sidecar-healthy").await?;

        self.store
            .transition(
                droplet_id,
                DropletState::ActiveHealthy,
                "wake complete",
                ACTOR,
                serde_json::Value::Null,
            )
            .await?;
        self.store
            .record_cost_event(&CostEvent {
                tenant_id: tenant_id.clone(),
                droplet_id,
                kind: "wake-resume".into(),
                amount_delta: hourly_rate(&droplet.size_slug),
                at: Utc::now(),
            })
            .await?;
        info!(tenant = %tenant_id, droplet = %droplet_id, ?reason, "tenant woken");
        Ok(())
    }

    /// Schedule a batch of wake requests, staggered under the provider's
    /// mutation-rate ceiling. Each request becomes one delayed wake job at
    /// its slot in the plan. Returns the plan, or `None` for an empty
    /// batch.
    pub async fn schedule_wake_batch(
        &self,
        bus: &genesis_bus::JobBus,
        requests: Vec<crate::stagger::WakeRequest>,
    ) -> ControlResult<Option<crate::stagger::WakePlan>> {
        let gap = chrono::Duration::milliseconds(self.settings.wake_gap_ms as i64);
        let Some(plan) = crate::stagger::plan_staggered_wakes(requests, gap) else {
            return Ok(None);
        };
        let now = Utc::now();
        for wake in &plan.wakes {
            let delay_ms = (wake.scheduled_at - now).num_milliseconds().max(0) as u64;
            bus.add(
                genesis_types::QueueName::WakeDroplet,
                JobPayload::WakeDroplet {
                    tenant_id: wake.request.tenant_id.clone(),
                    droplet_id: wake.request.droplet_id,
                    reason: wake.request.reason,
                },
                genesis_bus::AddOpts {
                    delay_ms: Some(delay_ms),
                    idempotency_key: Some(format!(
                        "wake:{}:{}",
                        wake.request.tenant_id,
                        wake.request.target_time.timestamp()
                    )),
                    ..genesis_bus::AddOpts::default()
                },
            )
            .await?;
        }
        info!(
            batch = plan.wakes.len(),
            start = %plan.start,
            end = %plan.end,
            "staggered wake batch scheduled"
        );
        Ok(Some(plan))
    }

    /// A wake that cannot complete leaves the droplet for the watchdog's
    /// remediation loop rather than half-awake.
    async fn park_as_zombie(&self, droplet_id: DropletId, reason: &str) {
        if let Err(err) = self
            .store
            .transition(
                droplet_id,
                DropletState::Zombie,
                reason,
                ACTOR,
                serde_json::Value::Null,
            )
            .await
        {
            warn!(%droplet_id, error = %err, "failed to park unwakeable droplet");
        }
    }
}

/// `wake-droplet` queue handler.
pub struct WakeDropletHandler {
    controller: Arc<HibernationController>,
}

impl WakeDropletHandler {
    pub fn new(controller: Arc<HibernationController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl JobHandler for WakeDropletHandler {
    async fn handle(&self, job: &Job) -> ControlResult<()> {
        match &job.payload {
            JobPayload::WakeDroplet {
                tenant_id,
                droplet_id,
                reason,
            } => self.controller.wake(tenant_id, *droplet_id, *reason).await,
            other => Err(ControlError::ValidationFailed(format!(
                "wake handler got a {} payload",
                other.default_queue()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_adapters::cloud::VmStatus;
    use genesis_adapters::testing::{CloudCall, MockCloudApi, MockSidecar};
    use genesis_store::MemoryStore;
    use genesis_types::{
        derive_public_dns, AccountId, AccountStatus, CloudAccount, Secret, Tenant, Tier,
    };
    use genesis_watchdog::MemoryAlertSink;

    struct World {
        store: Arc<MemoryStore>,
        cloud: Arc<MockCloudApi>,
        sidecar: Arc<MockSidecar>,
        alerts: Arc<MemoryAlertSink>,
        base_url: String,
    }

    async fn world(tier: Tier, state: DropletState) -> World {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(MockCloudApi::new());
        let sidecar = Arc::new(MockSidecar::new());
        let alerts = Arc::new(MemoryAlertSink::new());

        store
            .insert_tenant(&Tenant {
                id: TenantId::from("t-1"),
                slug: "acme".into(),
                region: "nyc3".into(),
                tier,
            })
            .await
            .unwrap();
        store
            .upsert_activity(&TenantActivity {
                tenant_id: TenantId::from("t-1"),
                last_campaign_at: Some(Utc::now() - chrono::Duration::days(60)),
                last_execution_at: Some(Utc::now() - chrono::Duration::days(60)),
                last_login_at: Some(Utc::now() - chrono::Duration::days(60)),
                account_active: true,
                manual_hold: false,
            })
            .await
            .unwrap();
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
        let ip = "203.0.113.5".to_string();
        let base_url = format!("https://{}", derive_public_dns(&ip));
        store
            .create_droplet(
                &DropletHealth {
                    tenant_id: TenantId::from("t-1"),
                    droplet_id: DropletId(5),
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
        World {
            store,
            cloud,
            sidecar,
            alerts,
            base_url,
        }
    }

    fn controller(w: &World) -> HibernationController {
        let settings = HibernationSettings {
            wake_status_poll_s: 1,
            wake_status_budget_s: 2,
            wake_health_poll_s: 1,
            wake_health_budget_s: 2,
            ..HibernationSettings::default()
        };
        HibernationController::new(
            w.store.clone(),
            w.cloud.clone(),
            w.sidecar.clone(),
            w.alerts.clone(),
            settings,
        )
    }

    #[tokio::test]
    async fn hibernate_walks_ordered_steps() {
        let w = world(Tier::Standard, DropletState::ActiveHealthy).await;
        controller(&w).hibernate(&TenantId::from("t-1")).await.unwrap();

        let droplet = w
            .store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(droplet.state, DropletState::Hibernated);

        // Step checkpoints in order, journalled before the next step ran.
        let steps: Vec<String> = w
            .store
            .flow_steps(DropletId(5), "hibernate")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.step)
            .collect();
        assert_eq!(
            steps,
            vec!["notification", "metric-snapshot", "engine-stop", "power-off"]
        );

        assert_eq!(w.sidecar.state.lock().stopped, vec![w.base_url.clone()]);
        assert_eq!(w.cloud.count(|c| matches!(c, CloudCall::PowerOff(_))), 1);
        assert!(w.alerts.contains("entering hibernation"));

        let kinds: Vec<String> = w
            .store
            .cost_events()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&"hibernate-save".to_string()));
    }

    #[tokio::test]
    async fn enterprise_tenant_never_hibernates() {
        let w = world(Tier::Enterprise, DropletState::ActiveHealthy).await;
        let err = controller(&w)
            .hibernate(&TenantId::from("t-1"))
            .await
            .unwrap_err();
        match err {
            ControlError::ValidationFailed(reason) => {
                assert_eq!(reason, "Enterprise tier - never hibernates");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // No lifecycle transition happened.
        let events = w.store.lifecycle_events(DropletId(5)).await.unwrap();
        assert_eq!(events.len(), 1);
        let droplet = w
            .store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(droplet.state, DropletState::ActiveHealthy);
    }

    #[tokio::test]
    async fn failed_engine_stop_halts_the_sequence() {
        let w = world(Tier::Standard, DropletState::ActiveHealthy).await;
        w.sidecar.state.lock().fail_stop = true;
        let err = controller(&w)
            .hibernate(&TenantId::from("t-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::SidecarUnreachable(_)));

        // The sequence stopped where it failed: no power-off, no
        // HIBERNATED transition, and only the steps that completed are
        // checkpointed.
        assert_eq!(w.cloud.count(|c| matches!(c, CloudCall::PowerOff(_))), 0);
        let droplet = w
            .store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(droplet.state, DropletState::Hibernating);
        let steps: Vec<String> = w
            .store
            .flow_steps(DropletId(5), "hibernate")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.step)
            .collect();
        assert_eq!(steps, vec!["notification", "metric-snapshot"]);
    }

    #[tokio::test]
    async fn wake_completes_and_journals() {
        let w = world(Tier::Standard, DropletState::Hibernated).await;
        w.cloud.set_status(DropletId(5), VmStatus::Off);
        controller(&w)
            .wake(&TenantId::from("t-1"), DropletId(5), WakeReason::UserLogin)
            .await
            .unwrap();

        assert_eq!(w.cloud.count(|c| matches!(c, CloudCall::PowerOn(_))), 1);
        let droplet = w
            .store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(droplet.state, DropletState::ActiveHealthy);
        let steps: Vec<String> = w
            .store
            .flow_steps(DropletId(5), "wake")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.step)
            .collect();
        assert_eq!(steps, vec!["power-on", "provider-active", "sidecar-healthy"]);
        let kinds: Vec<String> = w
            .store
            .cost_events()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&"wake-resume".to_string()));
    }

    #[tokio::test]
    async fn unhealthy_wake_parks_droplet_for_watchdog() {
        let w = world(Tier::Standard, DropletState::Hibernated).await;
        w.sidecar
            .script_health(&w.base_url, std::iter::repeat(false).take(64));
        let err = controller(&w)
            .wake(&TenantId::from("t-1"), DropletId(5), WakeReason::UserLogin)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let droplet = w
            .store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(droplet.state, DropletState::Zombie);
    }

    #[tokio::test]
    async fn wake_batch_is_staggered_into_delayed_jobs() {
        use crate::stagger::WakeRequest;
        use genesis_bus::JobBus;
        use genesis_config::QueueTopology;
        use genesis_kv::MemoryKv;
        use genesis_types::QueueName;

        let w = world(Tier::Standard, DropletState::Hibernated).await;
        let bus = JobBus::new(
            Arc::new(MemoryKv::new()),
            QueueTopology::default(),
        );
        let target = Utc::now() + chrono::Duration::minutes(10);
        let requests = (0..3i64)
            .map(|i| WakeRequest {
                tenant_id: TenantId::from("t-1"),
                droplet_id: DropletId(5),
                tier: Tier::Standard,
                target_time: target + chrono::Duration::seconds(2 * i),
                reason: WakeReason::AdminRequest,
            })
            .collect();
        let plan = controller(&w)
            .schedule_wake_batch(&bus, requests)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(plan.wakes.len(), 3);
        assert_eq!(
            plan.start,
            target - chrono::Duration::seconds(3) - chrono::Duration::seconds(60)
        );
        // All three parked as delayed jobs, none ready yet.
        assert_eq!(bus.queue_depth(QueueName::WakeDroplet).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn wake_of_active_droplet_is_a_no_op() {
        let w = world(Tier::Standard, DropletState::ActiveHealthy).await;
        controller(&w)
            .wake(&TenantId::from("t-1"), DropletId(5), WakeReason::AdminRequest)
            .await
            .unwrap();
        assert_eq!(w.cloud.count(|c| matches!(c, CloudCall::PowerOn(_))), 0);
    }
}
