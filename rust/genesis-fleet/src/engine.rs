//! The rollout coordinator

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use genesis_bus::{AddOpts, JobBus, JobEvent, WorkerRegistry};
use genesis_store::Store;
use genesis_types::{
    ControlError, ControlResult, JobPayload, QueueName, Rollout, RolloutCounters, RolloutId,
    RolloutStatus, RolloutStrategy, Tenant, TenantId, Wave, WaveStatus,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::plan;

const ACTOR: &str = "fleet-update-engine";

/// Promotion gate thresholds.
#[derive(Debug, Clone, Copy)]
pub struct GateThresholds {
    /// Wave failure ratio below which promotion proceeds.
    pub wave_error_rate: f64,
    /// Control-plane-wide failure ratio measured across the wave's span.
    pub control_plane_error_rate: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            wave_error_rate: 0.005,
            control_plane_error_rate: 0.01,
        }
    }
}

/// Inputs for starting a rollout.
#[derive(Debug, Clone)]
pub struct RolloutSpec {
    /// Logical component tag: `sidecar` or `workflow:<name>`.
    pub component: String,
    pub to_version: String,
    pub strategy: RolloutStrategy,
    /// Restrict the population (rollbacks, single-tenant repairs).
    pub explicit_tenants: Option<Vec<TenantId>>,
    /// Body to register for workflow components before emission.
    pub workflow_body: Option<serde_json::Value>,
    pub created_by: String,
    pub priority_override: Option<u8>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RollbackScope {
    All,
    AffectedOnly,
    SingleTenant(TenantId),
}

pub struct FleetUpdateEngine {
    store: Arc<dyn Store>,
    bus: Arc<JobBus>,
    registry: Arc<WorkerRegistry>,
    gate: GateThresholds,
    wave_deadline: Duration,
}

impl FleetUpdateEngine {
    pub fn new(store: Arc<dyn Store>, bus: Arc<JobBus>, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            store,
            bus,
            registry,
            gate: GateThresholds::default(),
            wave_deadline: Duration::from_secs(3_600),
        }
    }

    pub fn with_gate(mut self, gate: GateThresholds) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_wave_deadline(mut self, deadline: Duration) -> Self {
        self.wave_deadline = deadline;
        self
    }

    /// Plan a rollout: snapshot eligibility, order by tier, slice waves,
    /// persist the records. Emission starts when [`run`] drives it.
    pub async fn start(&self, spec: RolloutSpec) -> ControlResult<RolloutId> {
        if let Some(active) = self
            .store
            .active_rollout_for_component(&spec.component)
            .await?
        {
            return Err(ControlError::ValidationFailed(format!(
                "rollout {} is already {} for component {}",
                active.id,
                active.status.as_str(),
                spec.component
            )));
        }
        if let Some(body) = &spec.workflow_body {
            self.store
                .upsert_template(&spec.component, &spec.to_version, body)
                .await?;
        }

        let eligible = self
            .eligible_tenants(spec.explicit_tenants.as_deref())
            .await?;
        if eligible.is_empty() {
            return Err(ControlError::ValidationFailed(format!(
                "no eligible tenants for component {}",
                spec.component
            )));
        }
        let ordered = plan::order_for_rollout(eligible);
        let ids: Vec<TenantId> = ordered.into_iter().map(|t| t.id).collect();
        let waves = plan::partition_waves(&ids, spec.strategy);

        let rollout = Rollout {
            id: RolloutId::new(),
            component: spec.component,
            from_version: None,
            to_version: spec.to_version,
            strategy: spec.strategy,
            status: RolloutStatus::Pending,
            total_tenants: ids.len() as u32,
            counters: RolloutCounters {
                pending: ids.len() as u32,
                ..RolloutCounters::default()
            },
            wave_sizes: waves.iter().map(|w| w.len() as u32).collect(),
            created_by: spec.created_by,
            created_at: Utc::now(),
            reason: spec.reason,
            priority_override: spec.priority_override,
        };
        self.store.insert_rollout(&rollout).await?;
        for (number, members) in waves.into_iter().enumerate() {
            self.store
                .upsert_wave(&Wave {
                    rollout_id: rollout.id,
                    number: number as u32,
                    members,
                    status: WaveStatus::Pending,
                    error_rate: 0.0,
                    started_at: None,
                    ended_at: None,
                })
                .await?;
        }
        info!(rollout = %rollout.id, component = %rollout.component,
              tenants = rollout.total_tenants, waves = ?rollout.wave_sizes,
              "rollout planned");
        Ok(rollout.id)
    }

    /// Drive the rollout: emit each pending wave, wait for its jobs to
    /// reach a terminal state, evaluate the gate, promote or pause.
    /// Returns when the rollout completes, pauses, or aborts.
    pub async fn run(&self, rollout_id: RolloutId) -> ControlResult<()> {
        let mut events = self.bus.subscribe();
        loop {
            let mut rollout = self
                .store
                .get_rollout(rollout_id)
                .await?
                .ok_or_else(|| ControlError::NotFound(format!("rollout {}", rollout_id)))?;
            if rollout.status == RolloutStatus::Paused {
                info!(rollout = %rollout_id, "rollout paused, emission stopped");
                return Ok(());
            }
            if rollout.status.is_terminal() {
                return Ok(());
            }

            let waves = self.store.list_waves(rollout_id).await?;
            let Some(mut wave) = waves.into_iter().find(|w| w.status == WaveStatus::Pending)
            else {
                rollout.status = RolloutStatus::Completed;
                self.store.update_rollout(&rollout).await?;
                info!(rollout = %rollout_id, "rollout completed");
                return Ok(());
            };

            let (cp_completed_before, cp_failed_before) = self.registry.totals();

            wave.status = WaveStatus::Active;
            wave.started_at = Some(Utc::now());
            self.store.upsert_wave(&wave).await?;
            rollout.status = RolloutStatus::Active;
            rollout.counters.active = wave.members.len() as u32;
            rollout.counters.pending = rollout
                .total_tenants
                .saturating_sub(rollout.counters.succeeded)
                .saturating_sub(rollout.counters.failed)
                .saturating_sub(rollout.counters.active);
            self.store.update_rollout(&rollout).await?;

            // Emit. Tenants that can no longer be resolved (hibernated or
            // torn down since planning) count as wave failures locally.
            let mut emitted = 0u32;
            let mut failed = 0u32;
            for tenant in &wave.members {
                match self.payload_for(&rollout, tenant, wave.number).await {
                    Ok((queue, payload)) => {
                        self.bus
                            .add(
                                queue,
                                payload,
                                AddOpts {
                                    priority: rollout.priority_override,
                                    ..AddOpts::default()
                                },
                            )
                            .await?;
                        emitted += 1;
                    }
                    Err(err) => {
                        warn!(rollout = %rollout_id, tenant = %tenant, error = %err,
                              "tenant skipped at emission");
                        failed += 1;
                    }
                }
            }

            // Wait for every emitted job's terminal outcome.
            let deadline = tokio::time::Instant::now() + self.wave_deadline;
            let mut completed = 0u32;
            let mut terminal_failures = failed;
            while completed + terminal_failures < emitted + failed {
                match tokio::time::timeout_at(deadline, events.recv()).await {
                    Err(_) => {
                        warn!(rollout = %rollout_id, wave = wave.number,
                              "wave deadline elapsed, unaccounted jobs counted as failed");
                        terminal_failures = (emitted + failed).saturating_sub(completed);
                        break;
                    }
                    Ok(Err(RecvError::Lagged(missed))) => {
                        warn!(rollout = %rollout_id, missed, "event stream lagged");
                        continue;
                    }
                    Ok(Err(RecvError::Closed)) => break,
                    Ok(Ok(event)) => match event {
                        JobEvent::Completed {
                            rollout: Some((rid, w)),
                            ..
                        } if rid == rollout_id && w == wave.number => completed += 1,
                        JobEvent::Failed {
                            rollout: Some((rid, w)),
                            will_retry: false,
                            ..
                        } if rid == rollout_id && w == wave.number => terminal_failures += 1,
                        _ => {}
                    },
                }
            }

            let total = (emitted + failed).max(1);
            let error_rate = terminal_failures as f64 / total as f64;
            let (cp_completed_after, cp_failed_after) = self.registry.totals();
            let cp_failed_span = cp_failed_after.saturating_sub(cp_failed_before);
            let cp_total_span =
                cp_completed_after.saturating_sub(cp_completed_before) + cp_failed_span;
            let cp_error_rate = if cp_total_span == 0 {
                0.0
            } else {
                cp_failed_span as f64 / cp_total_span as f64
            };

            wave.error_rate = error_rate;
            wave.ended_at = Some(Utc::now());
            rollout.counters.succeeded += completed;
            rollout.counters.failed += terminal_failures;
            rollout.counters.active = 0;
            rollout.counters.pending = rollout
                .total_tenants
                .saturating_sub(rollout.counters.succeeded)
                .saturating_sub(rollout.counters.failed);

            if error_rate < self.gate.wave_error_rate
                && cp_error_rate < self.gate.control_plane_error_rate
            {
                wave.status = WaveStatus::Completed;
                self.store.upsert_wave(&wave).await?;
                self.store.update_rollout(&rollout).await?;
                info!(rollout = %rollout_id, wave = wave.number,
                      error_rate, "wave promoted");
                continue;
            }

            wave.status = WaveStatus::Failed;
            self.store.upsert_wave(&wave).await?;
            rollout.status = RolloutStatus::Paused;
            rollout.reason = Some(format!(
                "health gate failed at wave {}: wave error rate {:.4}, control-plane error rate {:.4}",
                wave.number, error_rate, cp_error_rate
            ));
            self.store.update_rollout(&rollout).await?;
            warn!(
                rollout = %rollout_id,
                wave = wave.number,
                error_rate,
                cp_error_rate,
                code = ControlError::HealthGateFailed {
                    rollout: rollout_id,
                    wave: wave.number,
                    error_rate,
                }
                .code(),
                "rollout paused by health gate"
            );
            return Ok(());
        }
    }

    /// Stop emitting future waves; in-flight jobs continue.
    pub async fn pause(&self, rollout_id: RolloutId) -> ControlResult<()> {
        self.set_status(rollout_id, RolloutStatus::Paused, None).await
    }

    /// Reopen emission from the next pending wave. The caller re-drives
    /// [`run`] afterwards.
    pub async fn resume(&self, rollout_id: RolloutId) -> ControlResult<()> {
        let rollout = self.require(rollout_id).await?;
        if rollout.status != RolloutStatus::Paused {
            return Err(ControlError::ValidationFailed(format!(
                "rollout {} is {}, not paused",
                rollout_id,
                rollout.status.as_str()
            )));
        }
        self.set_status(rollout_id, RolloutStatus::Active, None).await
    }

    /// Merge all remaining pending waves into one final wave.
    pub async fn skip_to_100(&self, rollout_id: RolloutId) -> ControlResult<()> {
        let mut rollout = self.require(rollout_id).await?;
        let waves = self.store.list_waves(rollout_id).await?;
        let mut pending: Vec<Wave> = waves
            .into_iter()
            .filter(|w| w.status == WaveStatus::Pending)
            .collect();
        if pending.len() > 1 {
            let mut merged = pending.remove(0);
            for mut later in pending {
                merged.members.append(&mut later.members);
                later.status = WaveStatus::Completed;
                later.ended_at = Some(Utc::now());
                self.store.upsert_wave(&later).await?;
            }
            self.store.upsert_wave(&merged).await?;
        }
        rollout.reason = Some("skip".to_string());
        self.store.update_rollout(&rollout).await?;
        info!(rollout = %rollout_id, "remaining waves merged for skip-to-100");
        Ok(())
    }

    /// Cancel pending waves and mark the rollout aborted. Non-preemptive
    /// for jobs already on the bus.
    pub async fn abort(&self, rollout_id: RolloutId, reason: &str) -> ControlResult<()> {
        self.set_status(rollout_id, RolloutStatus::Aborted, Some(reason))
            .await
    }

    /// Create a reverse rollout at raised priority. Any active rollout for
    /// the component is aborted first. Each emitted job's `from_version`
    /// comes from that tenant's current ledger row at emission time.
    pub async fn rollback(
        &self,
        component: &str,
        to_version: &str,
        scope: RollbackScope,
        workflow_body: Option<serde_json::Value>,
    ) -> ControlResult<RolloutId> {
        let origin = self.store.active_rollout_for_component(component).await?;
        if let Some(origin) = &origin {
            self.abort(origin.id, "superseded by rollback").await?;
            info!(rollout = %origin.id, component, "active rollout aborted for rollback");
        }

        let targets: Vec<TenantId> = match scope {
            RollbackScope::All => self
                .store
                .versions_for_component(component)
                .await?
                .into_iter()
                .filter(|e| e.version != to_version)
                .map(|e| e.tenant_id)
                .collect(),
            RollbackScope::AffectedOnly => {
                let origin = origin.ok_or_else(|| {
                    ControlError::ValidationFailed(
                        "affected_only rollback requires an active rollout to scope against"
                            .to_string(),
                    )
                })?;
                let mut seen = HashSet::new();
                self.store
                    .versions_changed_by(origin.id)
                    .await?
                    .into_iter()
                    .map(|e| e.tenant_id)
                    .filter(|t| seen.insert(t.clone()))
                    .collect()
            }
            RollbackScope::SingleTenant(tenant) => vec![tenant],
        };
        if targets.is_empty() {
            return Err(ControlError::ValidationFailed(format!(
                "nothing to roll back for component {}",
                component
            )));
        }

        self.start(RolloutSpec {
            component: component.to_string(),
            to_version: to_version.to_string(),
            strategy: RolloutStrategy::FleetSync,
            explicit_tenants: Some(targets),
            workflow_body,
            created_by: "operator-rollback".to_string(),
            priority_override: Some(1),
            reason: Some("rollback".to_string()),
        })
        .await
    }

    pub async fn status(&self, rollout_id: RolloutId) -> ControlResult<(Rollout, Vec<Wave>)> {
        let rollout = self.require(rollout_id).await?;
        let waves = self.store.list_waves(rollout_id).await?;
        Ok((rollout, waves))
    }

    async fn require(&self, rollout_id: RolloutId) -> ControlResult<Rollout> {
        self.store
            .get_rollout(rollout_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("rollout {}", rollout_id)))
    }

    async fn set_status(
        &self,
        rollout_id: RolloutId,
        status: RolloutStatus,
        reason: Option<&str>,
    ) -> ControlResult<()> {
        let mut rollout = self.require(rollout_id).await?;
        if rollout.status.is_terminal() {
            return Err(ControlError::ValidationFailed(format!(
                "rollout {} already {}",
                rollout_id,
                rollout.status.as_str()
            )));
        }
        rollout.status = status;
        if let Some(reason) = reason {
            rollout.reason = Some(reason.to_string());
        }
        self.store.update_rollout(&rollout).await?;
        info!(rollout = %rollout_id, status = status.as_str(), actor = ACTOR, "rollout status changed");
        Ok(())
    }

    async fn eligible_tenants(
        &self,
        explicit: Option<&[TenantId]>,
    ) -> ControlResult<Vec<Tenant>> {
        let restrict: Option<HashSet<&TenantId>> =
            explicit.map(|ids| ids.iter().collect::<HashSet<_>>());
        let mut eligible = Vec::new();
        for tenant in self.store.list_tenants().await? {
            if let Some(restrict) = &restrict {
                if !restrict.contains(&tenant.id) {
                    continue;
                }
            }
            let Some(droplet) = self.store.get_droplet(&tenant.id).await? else {
                continue;
            };
            if droplet.state.is_terminal() || droplet.state.is_hibernation() {
                continue;
            }
            eligible.push(tenant);
        }
        Ok(eligible)
    }

    async fn payload_for(
        &self,
        rollout: &Rollout,
        tenant: &TenantId,
        wave_number: u32,
    ) -> ControlResult<(QueueName, JobPayload)> {
        if rollout.component == "sidecar" {
            let droplet = self.store.get_droplet(tenant).await?.ok_or_else(|| {
                ControlError::NotFound(format!("droplet for tenant {}", tenant))
            })?;
            if droplet.state.is_terminal() || droplet.state.is_hibernation() {
                return Err(ControlError::ValidationFailed(format!(
                    "tenant {} droplet is {}",
                    tenant,
                    droplet.state.as_str()
                )));
            }
            let from_version = match self.store.current_version(tenant, "sidecar").await? {
                Some(entry) => entry.version,
                None => droplet
                    .sidecar_version
                    .or_else(|| rollout.from_version.clone())
                    .unwrap_or_else(|| "unversioned".to_string()),
            };
            Ok((
                QueueName::SidecarUpdate,
                JobPayload::SidecarUpdate {
                    tenant_id: tenant.clone(),
                    droplet_id: droplet.droplet_id,
                    from_version,
                    to_version: rollout.to_version.clone(),
                    rollout_id: Some(rollout.id),
                    wave_number: Some(wave_number),
                },
            ))
        } else {
            let (_, body) = self
                .store
                .get_template(&rollout.component)
                .await?
                .ok_or_else(|| {
                    ControlError::ValidationFailed(format!(
                        "no template registered for component {}",
                        rollout.component
                    ))
                })?;
            let workflow_name = rollout
                .component
                .strip_prefix("workflow:")
                .unwrap_or(&rollout.component);
            Ok((
                QueueName::WorkflowUpdate,
                JobPayload::WorkflowUpdate {
                    tenant_id: tenant.clone(),
                    workflow_name: workflow_name.to_string(),
                    workflow_body: body,
                    version: rollout.to_version.clone(),
                    rollout_id: Some(rollout.id),
                    wave_number: Some(wave_number),
                },
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use genesis_bus::{JobHandler, WorkerPool};
    use genesis_config::{GovernorSettings, QueueTopology};
    use genesis_governor::Governor;
    use genesis_kv::MemoryKv;
    use genesis_store::MemoryStore;
    use genesis_types::{
        derive_public_dns, AccountId, DropletHealth, DropletId, DropletState, Job, Tier,
        VersionLedgerEntry,
    };
    use std::sync::Mutex;
    use tokio::sync::watch;

    struct World {
        store: Arc<MemoryStore>,
        bus: Arc<JobBus>,
        registry: Arc<WorkerRegistry>,
        governor: Arc<Governor>,
        shutdown_tx: watch::Sender<bool>,
        handles: Vec<tokio::task::JoinHandle<()>>,
    }

    impl World {
        fn new() -> Self {
            let kv = Arc::new(MemoryKv::new());
            let topology = QueueTopology::default();
            let bus = Arc::new(JobBus::new(kv.clone(), topology.clone()));
            let governor = Arc::new(Governor::new(
                kv,
                GovernorSettings::default(),
                topology,
            ));
            let (shutdown_tx, _) = watch::channel(false);
            Self {
                store: Arc::new(MemoryStore::new()),
                bus,
                registry: Arc::new(WorkerRegistry::new()),
                governor,
                shutdown_tx,
                handles: Vec::new(),
            }
        }

        fn spawn_pool(&mut self, queue: QueueName, handler: Arc<dyn JobHandler>) {
            let counters = self.registry.register(queue);
            let pool = WorkerPool::new(
                queue,
                self.bus.clone(),
                self.governor.clone(),
                handler,
                counters,
                self.shutdown_tx.subscribe(),
            );
            self.handles.extend(pool.spawn());
        }

        fn engine(&self) -> FleetUpdateEngine {
            FleetUpdateEngine::new(self.store.clone(), self.bus.clone(), self.registry.clone())
                .with_wave_deadline(Duration::from_secs(20))
        }

        async fn seed_tenants(&self, n: usize) {
            for i in 0..n {
                let id = format!("t-{:05}", i);
                self.store
                    .insert_tenant(&Tenant {
                        id: TenantId::new(id.clone()),
                        slug: id.clone(),
                        region: "nyc3".into(),
                        tier: Tier::Standard,
                    })
                    .await
                    .unwrap();
                let ip = format!("198.51.{}.{}", i / 250, i % 250);
                self.store
                    .create_droplet(
                        &DropletHealth {
                            tenant_id: TenantId::new(id),
                            droplet_id: DropletId(10_000 + i as u64),
                            account_id: AccountId::new("acct-1"),
                            region: "nyc3".into(),
                            size_slug: "s-2vcpu-4gb".into(),
                            public_dns: derive_public_dns(&ip),
                            public_ip: ip,
                            state: DropletState::ActiveHealthy,
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
            }
        }

        async fn drain(self) {
            self.shutdown_tx.send(true).unwrap();
            for h in self.handles {
                let _ = h.await;
            }
        }
    }

    /// Succeeds except for scripted tenants, which fail terminally.
    struct ScriptedHandler {
        fail_tenants: HashSet<String>,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &Job) -> ControlResult<()> {
            let tenant = job.payload.tenant_id().as_str();
            if self.fail_tenants.contains(tenant) {
                Err(ControlError::ValidationFailed(format!(
                    "injected failure for {}",
                    tenant
                )))
            } else {
                Ok(())
            }
        }
    }

    /// Records sidecar-update payloads and succeeds.
    struct CaptureHandler {
        seen: Arc<Mutex<Vec<(String, String, String)>>>,
    }

    #[async_trait]
    impl JobHandler for CaptureHandler {
        async fn handle(&self, job: &Job) -> ControlResult<()> {
            if let JobPayload::SidecarUpdate {
                tenant_id,
                from_version,
                to_version,
                ..
            } = &job.payload
            {
                self.seen.lock().unwrap().push((
                    tenant_id.to_string(),
                    from_version.clone(),
                    to_version.clone(),
                ));
            }
            Ok(())
        }
    }

    fn workflow_spec() -> RolloutSpec {
        RolloutSpec {
            component: "workflow:warmup".into(),
            to_version: "v2".into(),
            strategy: RolloutStrategy::CanaryStaged,
            explicit_tenants: None,
            workflow_body: Some(serde_json::json!({"nodes": ["a"]})),
            created_by: "test".into(),
            priority_override: None,
            reason: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn canary_failure_pauses_before_wave_one() {
        let mut world = World::new();
        world.seed_tenants(400).await;
        // t-00000 lands in the 4-tenant canary and fails terminally:
        // canary error rate 0.25 trips the 0.5% gate.
        world.spawn_pool(
            QueueName::WorkflowUpdate,
            Arc::new(ScriptedHandler {
                fail_tenants: HashSet::from(["t-00000".to_string()]),
            }),
        );
        let engine = world.engine();

        let rollout_id = engine.start(workflow_spec()).await.unwrap();
        engine.run(rollout_id).await.unwrap();

        let (rollout, waves) = engine.status(rollout_id).await.unwrap();
        assert_eq!(rollout.status, RolloutStatus::Paused);
        assert_eq!(waves[0].status, WaveStatus::Failed);
        assert!((waves[0].error_rate - 0.25).abs() < 1e-9);
        assert_eq!(waves[1].status, WaveStatus::Pending);
        // Nothing was emitted past the canary.
        let (completed, failed) = world.registry.totals();
        assert_eq!(completed + failed, 4);

        // Operator resumes: emission reopens at wave 1 and runs out.
        engine.resume(rollout_id).await.unwrap();
        engine.run(rollout_id).await.unwrap();
        let (rollout, _) = engine.status(rollout_id).await.unwrap();
        assert_eq!(rollout.status, RolloutStatus::Completed);
        assert_eq!(rollout.counters.succeeded, 399);
        assert_eq!(rollout.counters.failed, 1);
        world.drain().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rollback_reads_from_version_per_tenant_ledger() {
        let mut world = World::new();
        world.seed_tenants(3).await;
        // t-00000 and t-00001 moved to v2; t-00002 stayed on v1.
        for (tenant, version) in [("t-00000", "v2"), ("t-00001", "v2"), ("t-00002", "v1")] {
            world
                .store
                .record_version(&VersionLedgerEntry {
                    tenant_id: TenantId::from(tenant),
                    component: "sidecar".into(),
                    version: version.into(),
                    previous_version: Some("v1".into()),
                    rollout_id: None,
                    recorded_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        world.spawn_pool(
            QueueName::SidecarUpdate,
            Arc::new(CaptureHandler { seen: seen.clone() }),
        );
        let engine = world.engine();

        let rollout_id = engine
            .rollback("sidecar", "v1", RollbackScope::All, None)
            .await
            .unwrap();
        let (rollout, _) = engine.status(rollout_id).await.unwrap();
        assert_eq!(rollout.strategy, RolloutStrategy::FleetSync);
        assert_eq!(rollout.priority_override, Some(1));
        assert_eq!(rollout.total_tenants, 2);

        engine.run(rollout_id).await.unwrap();
        let mut captured = seen.lock().unwrap().clone();
        captured.sort();
        // Each payload targets v1 from that tenant's own ledger row, not
        // from any rollout-level version.
        assert_eq!(
            captured,
            vec![
                ("t-00000".to_string(), "v2".to_string(), "v1".to_string()),
                ("t-00001".to_string(), "v2".to_string(), "v1".to_string()),
            ]
        );
        world.drain().await;
    }

    #[tokio::test]
    async fn rollback_aborts_active_rollout_first() {
        let world = World::new();
        world.seed_tenants(5).await;
        let engine = world.engine();
        let original = engine
            .start(RolloutSpec {
                component: "sidecar".into(),
                to_version: "v2".into(),
                strategy: RolloutStrategy::CanaryStaged,
                explicit_tenants: None,
                workflow_body: None,
                created_by: "test".into(),
                priority_override: None,
                reason: None,
            })
            .await
            .unwrap();
        for tenant in ["t-00000", "t-00001"] {
            world
                .store
                .record_version(&VersionLedgerEntry {
                    tenant_id: TenantId::from(tenant),
                    component: "sidecar".into(),
                    version: "v2".into(),
                    previous_version: Some("v1".into()),
                    rollout_id: Some(original),
                    recorded_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let reverse = engine
            .rollback("sidecar", "v1", RollbackScope::AffectedOnly, None)
            .await
            .unwrap();
        let (aborted, _) = engine.status(original).await.unwrap();
        assert_eq!(aborted.status, RolloutStatus::Aborted);
        let (rollback, _) = engine.status(reverse).await.unwrap();
        // Only the tenants the aborted rollout touched.
        assert_eq!(rollback.total_tenants, 2);
        world.drain().await;
    }

    #[tokio::test]
    async fn skip_to_100_merges_pending_waves() {
        let world = World::new();
        world.seed_tenants(400).await;
        let engine = world.engine();
        let rollout_id = engine.start(workflow_spec()).await.unwrap();

        engine.skip_to_100(rollout_id).await.unwrap();
        let (rollout, waves) = engine.status(rollout_id).await.unwrap();
        assert_eq!(rollout.reason.as_deref(), Some("skip"));
        let pending: Vec<&Wave> = waves
            .iter()
            .filter(|w| w.status == WaveStatus::Pending)
            .collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].members.len(), 400);
        world.drain().await;
    }

    #[tokio::test]
    async fn hibernated_tenants_are_not_eligible() {
        let world = World::new();
        world.seed_tenants(3).await;
        world
            .store
            .transition(
                DropletId(10_000),
                DropletState::Hibernating,
                "test",
                "test",
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        let engine = world.engine();
        let rollout_id = engine.start(workflow_spec()).await.unwrap();
        let (rollout, _) = engine.status(rollout_id).await.unwrap();
        assert_eq!(rollout.total_tenants, 2);
        world.drain().await;
    }

    #[tokio::test]
    async fn second_rollout_for_component_is_rejected() {
        let world = World::new();
        world.seed_tenants(3).await;
        let engine = world.engine();
        engine.start(workflow_spec()).await.unwrap();
        let err = engine.start(workflow_spec()).await.unwrap_err();
        assert!(matches!(err, ControlError::ValidationFailed(_)));
        world.drain().await;
    }
}
