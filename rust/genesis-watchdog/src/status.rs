//! Service status handles and alert sinks

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::{error, info, warn};

/// Per-service status block surfaced on `/health`.
#[derive(Debug, Clone, Default)]
pub struct ServiceStatus {
    pub name: String,
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
}

pub type ServiceStatusHandle = Arc<RwLock<ServiceStatus>>;

pub fn new_status(name: &str) -> ServiceStatusHandle {
    Arc::new(RwLock::new(ServiceStatus {
        name: name.to_string(),
        ..ServiceStatus::default()
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Where operator alerts go. The external channel (chat, pager) is out of
/// scope; the production sink logs structured events for the shipper to
/// pick up.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, severity: AlertSeverity, message: &str);
}

pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn alert(&self, severity: AlertSeverity, message: &str) {
        match severity {
            AlertSeverity::Info => info!(target: "genesis::alerts", "{}", message),
            AlertSeverity::Warning => warn!(target: "genesis::alerts", "{}", message),
            AlertSeverity::Critical => error!(target: "genesis::alerts", "{}", message),
        }
    }
}

/// Captures alerts for assertions.
#[derive(Default)]
pub struct MemoryAlertSink {
    pub messages: Mutex<Vec<(AlertSeverity, String)>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, severity: AlertSeverity) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|(s, _)| *s == severity)
            .count()
    }

    pub fn contains(&self, fragment: &str) -> bool {
        self.messages
            .lock()
            .iter()
            .any(|(_, m)| m.contains(fragment))
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn alert(&self, severity: AlertSeverity, message: &str) {
        self.messages.lock().push((severity, message.to_string()));
    }
}
