//! Operational health surface

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use genesis_bus::WorkerRegistry;
use genesis_watchdog::ServiceStatusHandle;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct WorkerReport {
    pub running: bool,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub active_jobs: u64,
}

#[derive(Debug, Serialize)]
pub struct ServiceReport {
    pub name: String,
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub uptime_seconds: u64,
    pub started_at: DateTime<Utc>,
    pub workers: BTreeMap<String, WorkerReport>,
    pub services: BTreeMap<String, ServiceReport>,
    pub version: String,
}

/// Everything the `/health` endpoint reads.
pub struct HealthState {
    started_at: DateTime<Utc>,
    started_instant: Instant,
    registry: Arc<WorkerRegistry>,
    services: Vec<ServiceStatusHandle>,
}

impl HealthState {
    pub fn new(registry: Arc<WorkerRegistry>, services: Vec<ServiceStatusHandle>) -> Self {
        Self {
            started_at: Utc::now(),
            started_instant: Instant::now(),
            registry,
            services,
        }
    }

    pub fn report(&self) -> HealthReport {
        let mut workers = BTreeMap::new();
        let mut all_workers_running = true;
        for (queue, counters) in self.registry.iter() {
            let (running, active, completed, failed) = counters.snapshot();
            all_workers_running &= running;
            workers.insert(
                queue.to_string(),
                WorkerReport {
                    running,
                    completed_jobs: completed,
                    failed_jobs: failed,
                    active_jobs: active,
                },
            );
        }

        let mut services = BTreeMap::new();
        let mut any_degraded = false;
        let mut all_services_running = true;
        for handle in &self.services {
            let status = handle.read().clone();
            any_degraded |= status.degraded;
            all_services_running &= status.running;
            services.insert(
                status.name.replace('-', "_"),
                ServiceReport {
                    name: status.name.clone(),
                    running: status.running,
                    last_run_at: status.last_run_at,
                    error_count: status.error_count,
                    last_error: status.last_error,
                    degraded: status.degraded.then_some(true),
                    degraded_reason: status.degraded_reason,
                },
            );
        }

        let status = if !all_workers_running || !all_services_running {
            "unhealthy"
        } else if any_degraded {
            "degraded"
        } else {
            "healthy"
        };

        HealthReport {
            status: status.to_string(),
            uptime_seconds: self.started_instant.elapsed().as_secs(),
            started_at: self.started_at,
            workers,
            services,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<HealthReport>) {
    let report = state.report();
    let code = if report.status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_types::QueueName;
    use genesis_watchdog::new_status;
    use std::sync::atomic::Ordering;

    #[test]
    fn report_aggregates_workers_and_services() {
        let registry = Arc::new(WorkerRegistry::new());
        let counters = registry.register(QueueName::Ignition);
        counters.running.store(true, Ordering::Relaxed);
        counters.completed.store(7, Ordering::Relaxed);

        let watchdog = new_status("watchdog");
        watchdog.write().running = true;
        let heartbeat = new_status("heartbeat-processor");
        heartbeat.write().running = true;

        let state = HealthState::new(registry, vec![watchdog.clone(), heartbeat]);
        let report = state.report();
        assert_eq!(report.status, "healthy");
        assert_eq!(report.workers["ignition"].completed_jobs, 7);
        assert!(report.services.contains_key("heartbeat_processor"));

        // A degraded service downgrades the overall status.
        {
            let mut status = watchdog.write();
            status.degraded = true;
            status.degraded_reason = Some("queue backend unavailable".into());
        }
        let report = state.report();
        assert_eq!(report.status, "degraded");

        // A stopped service is unhealthy outright.
        watchdog.write().running = false;
        let report = state.report();
        assert_eq!(report.status, "unhealthy");
    }

    #[test]
    fn json_shape_matches_the_operator_contract() {
        let registry = Arc::new(WorkerRegistry::new());
        registry
            .register(QueueName::Ignition)
            .running
            .store(true, Ordering::Relaxed);
        let service = new_status("scale-alerts");
        service.write().running = true;
        let state = HealthState::new(registry, vec![service]);

        let value = serde_json::to_value(state.report()).unwrap();
        assert!(value["uptime_seconds"].is_u64());
        assert!(value["started_at"].is_string());
        assert!(value["workers"]["ignition"]["active_jobs"].is_u64());
        assert_eq!(value["services"]["scale_alerts"]["name"], "scale-alerts");
        assert!(value["version"].is_string());
        // Absent optionals are omitted, not null.
        assert!(value["services"]["scale_alerts"].get("degraded").is_none());
    }
}
