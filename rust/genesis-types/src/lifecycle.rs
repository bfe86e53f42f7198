//! Lifecycle journal rows
//!
//! Append-only. A state transition must be journalled before any external
//! side effect that depends on it runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::droplet::{DropletId, DropletState};
use crate::tenant::TenantId;

/// One journalled droplet state transition. `from_state` is `None` only for
/// the row that creates the droplet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub droplet_id: DropletId,
    pub tenant_id: TenantId,
    pub from_state: Option<DropletState>,
    pub to_state: DropletState,
    pub reason: String,
    pub actor: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Step-completion record for strictly ordered flows (hibernate, wake).
/// Separate from the lifecycle log because steps do not change state; they
/// checkpoint progress between two states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStepRecord {
    pub droplet_id: DropletId,
    pub tenant_id: TenantId,
    /// Flow name: `hibernate` or `wake`.
    pub flow: String,
    pub step: String,
    pub at: DateTime<Utc>,
}
