//! Control-plane error taxonomy
//!
//! Errors cross component boundaries as values. Retryability is a property
//! of the kind, not of the call site: the bus consults
//! [`ControlError::is_retryable`] and [`ControlError::retry_after_ms`] when
//! deciding between retry and dead-letter. Secrets never appear in any
//! variant payload.

use thiserror::Error;

use crate::droplet::{DropletId, DropletState};
use crate::rollout::RolloutId;

/// Result type for control-plane operations
pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Debug, Clone, Error)]
pub enum ControlError {
    /// Account pool exhausted in the target region. Terminal.
    #[error("no provisioning capacity in region {region}")]
    NoCapacity { region: String },

    /// Composite provisioning failure; compensating rollback has run.
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    /// The concurrency governor refused a slot. Transient.
    #[error("governor denied slot, retry after {retry_after_ms}ms")]
    GovernorDenied { retry_after_ms: u64 },

    /// Cloud provider API failure. Retryable unless 4xx-excluding-429.
    #[error("cloud api error{}: {message}", .status.map(|s| format!(" (http {})", s)).unwrap_or_default())]
    CloudApi {
        status: Option<u16>,
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// Sidecar did not answer. Retryable; feeds the circuit breaker.
    #[error("sidecar unreachable: {0}")]
    SidecarUnreachable(String),

    /// Illegal droplet state transition. Programmer/journal error.
    #[error("invalid state transition {} -> {}", .from.as_str(), .to.as_str())]
    StateTransitionInvalid {
        from: DropletState,
        to: DropletState,
    },

    /// External-service rate limit (distinct from governor denial).
    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimitExceeded { retry_after_ms: u64 },

    /// Bad input. Terminal.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Wave health gate tripped; the rollout pauses for the operator.
    #[error("health gate failed for rollout {rollout} wave {wave}: error rate {error_rate:.4}")]
    HealthGateFailed {
        rollout: RolloutId,
        wave: u32,
        error_rate: f64,
    },

    /// A dependency is down but the component keeps running degraded.
    #[error("degraded dependency: {0}")]
    DegradedDependency(String),

    /// Blue-green sidecar update failed health checks and was swapped back.
    /// Terminal so the wave counts it without burning retries.
    #[error("sidecar update reverted on droplet {droplet_id}: {detail}")]
    UpdateReverted {
        droplet_id: DropletId,
        detail: String,
    },

    /// KV/queue backend failure. Transient.
    #[error("kv backend error: {0}")]
    Kv(String),

    /// Persistent store failure. Transient.
    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Bounded wait elapsed. Retryable.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ControlError {
    /// Whether the bus should retry the job that surfaced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControlError::GovernorDenied { .. }
            | ControlError::RateLimitExceeded { .. }
            | ControlError::SidecarUnreachable(_)
            | ControlError::Kv(_)
            | ControlError::Store(_)
            | ControlError::Timeout(_)
            | ControlError::DegradedDependency(_) => true,
            ControlError::CloudApi { status, .. } => match status {
                Some(429) => true,
                Some(s) if (400..500).contains(s) => false,
                _ => true,
            },
            ControlError::NoCapacity { .. }
            | ControlError::ProvisioningFailed(_)
            | ControlError::StateTransitionInvalid { .. }
            | ControlError::ValidationFailed(_)
            | ControlError::HealthGateFailed { .. }
            | ControlError::UpdateReverted { .. }
            | ControlError::Serialization(_)
            | ControlError::NotFound(_) => false,
        }
    }

    /// Caller-honoured minimum delay before the next attempt, when known.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ControlError::GovernorDenied { retry_after_ms }
            | ControlError::RateLimitExceeded { retry_after_ms } => Some(*retry_after_ms),
            ControlError::CloudApi { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// Stable machine-readable code for operator surfaces and DLQ entries.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::NoCapacity { .. } => "NO_CAPACITY",
            ControlError::ProvisioningFailed(_) => "PROVISIONING_FAILED",
            ControlError::GovernorDenied { .. } => "GOVERNOR_DENIED",
            ControlError::CloudApi { .. } => "CLOUD_API_ERROR",
            ControlError::SidecarUnreachable(_) => "SIDECAR_UNREACHABLE",
            ControlError::StateTransitionInvalid { .. } => "STATE_TRANSITION_INVALID",
            ControlError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            ControlError::ValidationFailed(_) => "VALIDATION_FAILED",
            ControlError::HealthGateFailed { .. } => "HEALTH_GATE_FAILED",
            ControlError::DegradedDependency(_) => "DEGRADED_DEPENDENCY",
            ControlError::UpdateReverted { .. } => "UPDATE_REVERTED",
            ControlError::Kv(_) => "KV_ERROR",
            ControlError::Store(_) => "STORE_ERROR",
            ControlError::Serialization(_) => "SERIALIZATION_ERROR",
            ControlError::Timeout(_) => "TIMEOUT",
            ControlError::NotFound(_) => "NOT_FOUND",
        }
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::Serialization(err.to_string())
    }
}
