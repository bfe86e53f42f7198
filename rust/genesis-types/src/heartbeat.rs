//! Heartbeat messages from droplet sidecars

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::droplet::DropletId;
use crate::tenant::TenantId;

/// Pub/sub pattern the heartbeat processor subscribes to.
pub const HEARTBEAT_PATTERN: &str = "heartbeat:*";

/// Channel a given tenant's sidecar publishes on.
pub fn heartbeat_channel(tenant: &TenantId) -> String {
    format!("heartbeat:{}", tenant)
}

/// One heartbeat reading. Transient; coalesced into droplet gauges with
/// last-writer-wins inside a flush window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub tenant_id: TenantId,
    pub droplet_id: DropletId,
    pub ts: DateTime<Utc>,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub disk_pct: f64,
    pub engine_healthy: bool,
}
