//! Job envelope, queue names, and payload variants
//!
//! Every unit of work on the bus is a `Job` wrapping one `JobPayload`
//! variant. Payloads are closed tagged unions so the bus, DLQ, replay, and
//! ledger handle them uniformly without reflection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::droplet::DropletId;
use crate::rollout::RolloutId;
use crate::tenant::TenantId;

/// Upper bound on any computed backoff delay.
const MAX_BACKOFF_MS: u64 = 300_000;

/// Unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fixed queue set. Topology (priority, concurrency, rate, retries) is
/// configuration; the names are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Ignition,
    Security,
    Template,
    Health,
    Metric,
    Reboot,
    WorkflowUpdate,
    SidecarUpdate,
    WakeDroplet,
    CredentialInject,
    HardRebootDroplet,
}

impl QueueName {
    pub const ALL: [QueueName; 11] = [
        QueueName::Ignition,
        QueueName::Security,
        QueueName::Template,
        QueueName::Health,
        QueueName::Metric,
        QueueName::Reboot,
        QueueName::WorkflowUpdate,
        QueueName::SidecarUpdate,
        QueueName::WakeDroplet,
        QueueName::CredentialInject,
        QueueName::HardRebootDroplet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Ignition => "ignition",
            QueueName::Security => "security",
            QueueName::Template => "template",
            QueueName::Health => "health",
            QueueName::Metric => "metric",
            QueueName::Reboot => "reboot",
            QueueName::WorkflowUpdate => "workflow-update",
            QueueName::SidecarUpdate => "sidecar-update",
            QueueName::WakeDroplet => "wake-droplet",
            QueueName::CredentialInject => "credential-inject",
            QueueName::HardRebootDroplet => "hard-reboot-droplet",
        }
    }
}

impl std::str::FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .iter()
            .copied()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue: {}", s))
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    UserLogin,
    ScheduledCampaign,
    AdminRequest,
    WatchdogRecovery,
}

impl WakeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            WakeReason::UserLogin => "user_login",
            WakeReason::ScheduledCampaign => "scheduled_campaign",
            WakeReason::AdminRequest => "admin_request",
            WakeReason::WatchdogRecovery => "watchdog_recovery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootReason {
    WatchdogHeartbeatTimeout,
    AdminRequest,
    ZombieDetected,
}

/// An encrypted credential as handed over by the upstream API. The control
/// plane never sees plaintext; decryption happens on the droplet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBlob {
    pub credential_type: String,
    pub encrypted_payload: String,
}

/// Tagged job payloads, one variant per kind of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobPayload {
    WorkflowUpdate {
        tenant_id: TenantId,
        workflow_name: String,
        workflow_body: serde_json::Value,
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rollout_id: Option<RolloutId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wave_number: Option<u32>,
    },
    SidecarUpdate {
        tenant_id: TenantId,
        droplet_id: DropletId,
        from_version: String,
        to_version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rollout_id: Option<RolloutId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wave_number: Option<u32>,
    },
    WakeDroplet {
        tenant_id: TenantId,
        droplet_id: DropletId,
        reason: WakeReason,
    },
    CredentialInject {
        tenant_id: TenantId,
        droplet_id: DropletId,
        credentials: Vec<CredentialBlob>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rollout_id: Option<RolloutId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wave_number: Option<u32>,
    },
    HardRebootDroplet {
        droplet_id: DropletId,
        tenant_id: TenantId,
        reason: RebootReason,
    },
    Ignition {
        tenant_id: TenantId,
        slug: String,
        size_slug: String,
        region: String,
        requester: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority_override: Option<u8>,
    },
    Teardown {
        tenant_id: TenantId,
        droplet_id: DropletId,
        reason: String,
        force: bool,
    },
    HealthProbe {
        tenant_id: TenantId,
        droplet_id: DropletId,
    },
    MetricSnapshot {
        tenant_id: TenantId,
        droplet_id: DropletId,
    },
}

impl JobPayload {
    /// Default queue for the payload kind. `add` may route elsewhere (e.g.
    /// an upstream one-off deploy goes to `template` instead of
    /// `workflow-update`).
    pub fn default_queue(&self) -> QueueName {
        match self {
            JobPayload::WorkflowUpdate { .. } => QueueName::WorkflowUpdate,
            JobPayload::SidecarUpdate { .. } => QueueName::SidecarUpdate,
            JobPayload::WakeDroplet { .. } => QueueName::WakeDroplet,
            JobPayload::CredentialInject { .. } => QueueName::CredentialInject,
            JobPayload::HardRebootDroplet { .. } => QueueName::HardRebootDroplet,
            JobPayload::Ignition { .. } | JobPayload::Teardown { .. } => QueueName::Ignition,
            JobPayload::HealthProbe { .. } => QueueName::Health,
            JobPayload::MetricSnapshot { .. } => QueueName::Metric,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        match self {
            JobPayload::WorkflowUpdate { tenant_id, .. }
            | JobPayload::SidecarUpdate { tenant_id, .. }
            | JobPayload::WakeDroplet { tenant_id, .. }
            | JobPayload::CredentialInject { tenant_id, .. }
            | JobPayload::HardRebootDroplet { tenant_id, .. }
            | JobPayload::Ignition { tenant_id, .. }
            | JobPayload::Teardown { tenant_id, .. }
            | JobPayload::HealthProbe { tenant_id, .. }
            | JobPayload::MetricSnapshot { tenant_id, .. } => tenant_id,
        }
    }

    /// Rollout linkage carried by fleet-update emissions.
    pub fn rollout_ref(&self) -> Option<(RolloutId, u32)> {
        match self {
            JobPayload::WorkflowUpdate {
                rollout_id: Some(r),
                wave_number: Some(w),
                ..
            }
            | JobPayload::SidecarUpdate {
                rollout_id: Some(r),
                wave_number: Some(w),
                ..
            }
            | JobPayload::CredentialInject {
                rollout_id: Some(r),
                wave_number: Some(w),
                ..
            } => Some((*r, *w)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

/// Retry backoff policy. Delays are computed from the attempt number that
/// just failed (1-based) and capped at five minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base_ms: u64,
}

impl BackoffPolicy {
    pub fn exponential(base_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_ms,
        }
    }

    pub fn fixed(base_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_ms,
        }
    }

    pub fn delay_ms(&self, failed_attempt: u32) -> u64 {
        let delay = match self.kind {
            BackoffKind::Fixed => self.base_ms,
            BackoffKind::Exponential => {
                let shift = failed_attempt.saturating_sub(1).min(16);
                self.base_ms.saturating_mul(1u64 << shift)
            }
        };
        delay.min(MAX_BACKOFF_MS)
    }
}

/// A unit of work routed to a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueName,
    pub payload: JobPayload,
    /// Lower is higher priority.
    pub priority: u8,
    /// Attempts made so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Set when this job was re-enqueued from a DLQ entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<JobId>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_round_trip() {
        for q in QueueName::ALL {
            assert_eq!(q.as_str().parse::<QueueName>().unwrap(), q);
        }
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let b = BackoffPolicy::exponential(10_000);
        assert_eq!(b.delay_ms(1), 10_000);
        assert_eq!(b.delay_ms(2), 20_000);
        assert_eq!(b.delay_ms(3), 40_000);
        assert_eq!(b.delay_ms(10), 300_000);
    }

    #[test]
    fn fixed_backoff_is_flat() {
        let b = BackoffPolicy::fixed(1_000);
        assert_eq!(b.delay_ms(1), 1_000);
        assert_eq!(b.delay_ms(5), 1_000);
    }

    #[test]
    fn payload_tag_is_stable_on_the_wire() {
        let payload = JobPayload::HardRebootDroplet {
            droplet_id: DropletId(42),
            tenant_id: TenantId::from("t-1"),
            reason: RebootReason::WatchdogHeartbeatTimeout,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "hard-reboot-droplet");
        assert_eq!(value["reason"], "watchdog_heartbeat_timeout");
        let back: JobPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.default_queue(), QueueName::HardRebootDroplet);
    }

    #[test]
    fn teardown_routes_to_ignition_queue() {
        let payload = JobPayload::Teardown {
            tenant_id: TenantId::from("t-1"),
            droplet_id: DropletId(7),
            reason: "offboarding".into(),
            force: false,
        };
        assert_eq!(payload.default_queue(), QueueName::Ignition);
    }
}
