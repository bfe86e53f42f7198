//! Rollouts, waves, and the version ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tenant::TenantId;

/// Cumulative wave percentages for canary-staged rollouts. Each wave emits
/// only the increment over the previous one.
pub const WAVE_PERCENTS: [u8; 5] = [1, 10, 25, 50, 100];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RolloutId(pub Uuid);

impl RolloutId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RolloutId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RolloutId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolloutStrategy {
    /// Canary then staged percentages with health-gated promotion (default).
    CanaryStaged,
    /// Mass-emit every eligible tenant as one wave.
    FleetSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl RolloutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStatus::Pending => "pending",
            RolloutStatus::Active => "active",
            RolloutStatus::Paused => "paused",
            RolloutStatus::Completed => "completed",
            RolloutStatus::Failed => "failed",
            RolloutStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutStatus::Completed | RolloutStatus::Failed | RolloutStatus::Aborted
        )
    }
}

impl std::str::FromStr for RolloutStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RolloutStatus::Pending),
            "active" => Ok(RolloutStatus::Active),
            "paused" => Ok(RolloutStatus::Paused),
            "completed" => Ok(RolloutStatus::Completed),
            "failed" => Ok(RolloutStatus::Failed),
            "aborted" => Ok(RolloutStatus::Aborted),
            other => Err(format!("unknown rollout status: {}", other)),
        }
    }
}

/// Per-state tenant counters on a rollout record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutCounters {
    pub pending: u32,
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// A plan to move one component from one version to another across the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollout {
    pub id: RolloutId,
    /// Logical component tag, e.g. `workflow:lead-warmup` or `sidecar`.
    pub component: String,
    pub from_version: Option<String>,
    pub to_version: String,
    pub strategy: RolloutStrategy,
    pub status: RolloutStatus,
    pub total_tenants: u32,
    pub counters: RolloutCounters,
    /// Planned wave sizes (increments, not cumulative).
    pub wave_sizes: Vec<u32>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Operator-provided context: abort reason, "skip", rollback scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Job priority override applied to emitted jobs (rollbacks raise it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_override: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl WaveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaveStatus::Pending => "pending",
            WaveStatus::Active => "active",
            WaveStatus::Completed => "completed",
            WaveStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for WaveStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WaveStatus::Pending),
            "active" => Ok(WaveStatus::Active),
            "completed" => Ok(WaveStatus::Completed),
            "failed" => Ok(WaveStatus::Failed),
            other => Err(format!("unknown wave status: {}", other)),
        }
    }
}

/// One slice of a rollout. Membership is snapshotted at emit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wave {
    pub rollout_id: RolloutId,
    pub number: u32,
    pub members: Vec<TenantId>,
    pub status: WaveStatus,
    pub error_rate: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Immutable row recording one version change for (tenant, component).
/// The current version of a pair is the most recent row, never a mutable
/// cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionLedgerEntry {
    pub tenant_id: TenantId,
    pub component: String,
    pub version: String,
    pub previous_version: Option<String>,
    pub rollout_id: Option<RolloutId>,
    pub recorded_at: DateTime<Utc>,
}
