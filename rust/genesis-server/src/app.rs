//! Process wiring
//!
//! Builds the whole world from settings as explicitly constructed owned
//! values: backends, governor, bus, adapters, factories, engines, services,
//! and the per-queue worker pools. No global state; tests build a fresh
//! world per test via dry-run settings.

use std::sync::Arc;
use std::time::Duration;

use genesis_adapters::cloud::{CloudApi, DryRunCloudApi, GovernedCloud, HttpCloudApi};
use genesis_adapters::sidecar::{HttpSidecarClient, SidecarApi};
use genesis_bus::{JobBus, JobHandler, WorkerPool, WorkerRegistry};
use genesis_config::Settings;
use genesis_fleet::{
    CredentialInjectHandler, FleetUpdateEngine, SidecarUpdateHandler, WorkflowUpdateHandler,
};
use genesis_governor::Governor;
use genesis_hibernate::{
    HibernationController, HibernationSweep, PredictiveWarmer, WakeDropletHandler,
};
use genesis_kv::{KvStore, MemoryKv, RedisKv};
use genesis_provision::{IgnitionHandler, ProvisioningFactory};
use genesis_store::{MemoryStore, PgStore, Store};
use genesis_types::{ControlResult, QueueName};
use genesis_watchdog::{
    new_status, HealthProbeHandler, HeartbeatProcessor, LogAlertSink, MetricSnapshotHandler,
    RebootHandler, ScaleAlerts, Watchdog,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::health::HealthState;

pub struct ControlPlane {
    pub settings: Settings,
    pub bus: Arc<JobBus>,
    pub governor: Arc<Governor>,
    pub registry: Arc<WorkerRegistry>,
    pub engine: Arc<FleetUpdateEngine>,
    pub health: Arc<HealthState>,
    handlers: Vec<(QueueName, Arc<dyn JobHandler>)>,
    watchdog: Arc<Watchdog>,
    heartbeat: Arc<HeartbeatProcessor>,
    scale_alerts: Arc<ScaleAlerts>,
    hibernation_sweep: Arc<HibernationSweep>,
    predictive: Arc<PredictiveWarmer>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    pub async fn build(settings: Settings) -> ControlResult<Self> {
        let kv: Arc<dyn KvStore> = if settings.dry_run {
            info!("dry run: using in-memory queue backend");
            Arc::new(MemoryKv::new())
        } else {
            Arc::new(RedisKv::connect(&settings.redis_url).await?)
        };
        let store: Arc<dyn Store> = if settings.dry_run {
            info!("dry run: using in-memory store");
            Arc::new(MemoryStore::new())
        } else {
            let pg = PgStore::connect(&settings.database_url, 20).await?;
            pg.migrate().await?;
            Arc::new(pg)
        };

        let bus = Arc::new(JobBus::new(kv.clone(), settings.topology.clone()));
        let governor = Arc::new(Governor::new(
            kv.clone(),
            settings.governor,
            settings.topology.clone(),
        ));
        let registry = Arc::new(WorkerRegistry::new());

        let raw_cloud: Arc<dyn CloudApi> = if settings.dry_run {
            Arc::new(DryRunCloudApi::new())
        } else {
            Arc::new(HttpCloudApi::new(
                settings.cloud_api_base_url.clone(),
                Duration::from_secs(settings.cloud_timeout_seconds),
            )?)
        };
        let cloud: Arc<dyn CloudApi> =
            Arc::new(GovernedCloud::new(raw_cloud, governor.clone()));
        let sidecar: Arc<dyn SidecarApi> = Arc::new(HttpSidecarClient::new(
            Duration::from_secs(settings.sidecar_timeout_seconds),
        )?);
        let alerts = Arc::new(LogAlertSink);

        let factory = Arc::new(ProvisioningFactory::new(store.clone(), cloud.clone()));
        let engine = Arc::new(FleetUpdateEngine::new(
            store.clone(),
            bus.clone(),
            registry.clone(),
        ));
        let controller = Arc::new(HibernationController::new(
            store.clone(),
            cloud.clone(),
            sidecar.clone(),
            alerts.clone(),
            settings.hibernation,
        ));

        let watchdog_status = new_status("watchdog");
        let heartbeat_status = new_status("heartbeat-processor");
        let scale_status = new_status("scale-alerts");
        let sweep_status = new_status("hibernation-sweep");
        let predictive_status = new_status("predictive-warmer");

        let watchdog = Arc::new(Watchdog::new(
            store.clone(),
            bus.clone(),
            alerts.clone(),
            watchdog_status.clone(),
            settings.watchdog_interval_seconds,
            settings.watchdog_heartbeat_timeout_minutes,
        ));
        let heartbeat = Arc::new(HeartbeatProcessor::new(
            kv.clone(),
            store.clone(),
            heartbeat_status.clone(),
            settings.heartbeat_flush_interval_seconds,
        ));
        let scale_alerts = Arc::new(ScaleAlerts::new(
            store.clone(),
            bus.clone(),
            alerts.clone(),
            scale_status.clone(),
            settings.scale_alerts_interval_minutes,
            settings.dlq,
        ));
        let hibernation_sweep = Arc::new(HibernationSweep::new(
            store.clone(),
            controller.clone(),
            sweep_status.clone(),
        ));
        let predictive = Arc::new(PredictiveWarmer::new(
            store.clone(),
            bus.clone(),
            predictive_status.clone(),
            settings.hibernation.predictive_lookahead_hours,
            settings.hibernation.pre_warm_minutes,
        ));

        let ignition: Arc<dyn JobHandler> = Arc::new(IgnitionHandler::new(
            factory,
            store.clone(),
            cloud.clone(),
        ));
        let workflow_update: Arc<dyn JobHandler> =
            Arc::new(WorkflowUpdateHandler::new(store.clone(), sidecar.clone()));
        let sidecar_update: Arc<dyn JobHandler> =
            Arc::new(SidecarUpdateHandler::new(store.clone(), sidecar.clone()));
        let credential_inject: Arc<dyn JobHandler> =
            Arc::new(CredentialInjectHandler::new(store.clone(), sidecar.clone()));
        let reboot: Arc<dyn JobHandler> = Arc::new(RebootHandler::new(
            store.clone(),
            cloud.clone(),
            sidecar.clone(),
        ));
        let health_probe: Arc<dyn JobHandler> =
            Arc::new(HealthProbeHandler::new(store.clone(), sidecar.clone()));
        let metric: Arc<dyn JobHandler> = Arc::new(MetricSnapshotHandler::new(store.clone()));
        let wake: Arc<dyn JobHandler> = Arc::new(WakeDropletHandler::new(controller));

        let handlers: Vec<(QueueName, Arc<dyn JobHandler>)> = vec![
            (QueueName::Ignition, ignition),
            (QueueName::Security, credential_inject.clone()),
            (QueueName::Template, workflow_update.clone()),
            (QueueName::Health, health_probe),
            (QueueName::Metric, metric),
            (QueueName::Reboot, reboot.clone()),
            (QueueName::WorkflowUpdate, workflow_update),
            (QueueName::SidecarUpdate, sidecar_update),
            (QueueName::WakeDroplet, wake),
            (QueueName::CredentialInject, credential_inject),
            (QueueName::HardRebootDroplet, reboot),
        ];

        let health = Arc::new(HealthState::new(
            registry.clone(),
            vec![
                watchdog_status,
                heartbeat_status,
                scale_status,
                sweep_status,
                predictive_status,
            ],
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            settings,
            bus,
            governor,
            registry,
            engine,
            health,
            handlers,
            watchdog,
            heartbeat,
            scale_alerts,
            hibernation_sweep,
            predictive,
            shutdown_tx,
            handles: Vec::new(),
        })
    }

    /// Spawn every worker pool and background service.
    pub fn start(&mut self) {
        for (queue, handler) in self.handlers.drain(..) {
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

        let watchdog = self.watchdog.clone();
        let rx = self.shutdown_tx.subscribe();
        self.handles
            .push(tokio::spawn(async move { watchdog.run(rx).await }));

        let heartbeat = self.heartbeat.clone();
        let rx = self.shutdown_tx.subscribe();
        self.handles
            .push(tokio::spawn(async move { heartbeat.run(rx).await }));

        let scale_alerts = self.scale_alerts.clone();
        let rx = self.shutdown_tx.subscribe();
        self.handles
            .push(tokio::spawn(async move { scale_alerts.run(rx).await }));

        let sweep = self.hibernation_sweep.clone();
        let rx = self.shutdown_tx.subscribe();
        self.handles
            .push(tokio::spawn(async move { sweep.run(rx).await }));

        let predictive = self.predictive.clone();
        let rx = self.shutdown_tx.subscribe();
        self.handles
            .push(tokio::spawn(async move { predictive.run(rx).await }));

        info!("control plane started");
    }

    /// Cooperative shutdown: stop intake, let services flush, wait for
    /// in-flight jobs up to the configured timeout, then force-close.
    pub async fn shutdown(mut self) {
        info!("shutdown requested, draining");
        let _ = self.shutdown_tx.send(true);

        let abort_handles: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        let drain = async {
            for handle in self.handles.drain(..) {
                let _ = handle.await;
            }
        };
        let budget = Duration::from_millis(self.settings.graceful_shutdown_timeout_ms);
        if tokio::time::timeout(budget, drain).await.is_err() {
            warn!(
                timeout_ms = self.settings.graceful_shutdown_timeout_ms,
                "graceful drain timed out, forcing worker exit"
            );
            for handle in abort_handles {
                handle.abort();
            }
        }
        // KV and store connections close on drop.
        info!("control plane stopped");
    }
}
