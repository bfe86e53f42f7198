//! Tenant identity and tier classification

use serde::{Deserialize, Serialize};

/// Opaque tenant identifier assigned by the upstream API
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Tenant tier controlling hibernation and pre-warm policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    Enterprise,
    HighPriority,
    Standard,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Enterprise => "enterprise",
            Tier::HighPriority => "high-priority",
            Tier::Standard => "standard",
        }
    }

    /// Ordering for rollout waves: standard tenants absorb canary risk,
    /// enterprise tenants are shielded until the final wave.
    pub fn rollout_rank(&self) -> u8 {
        match self {
            Tier::Standard => 0,
            Tier::HighPriority => 1,
            Tier::Enterprise => 2,
        }
    }

    /// Ordering for wake scheduling: lower wakes first.
    pub fn wake_rank(&self) -> u8 {
        match self {
            Tier::Enterprise => 0,
            Tier::HighPriority => 1,
            Tier::Standard => 2,
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enterprise" => Ok(Tier::Enterprise),
            "high-priority" => Ok(Tier::HighPriority),
            "standard" => Ok(Tier::Standard),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A customer workspace. Created by the upstream API; the control plane
/// never destroys one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub slug: String,
    pub region: String,
    pub tier: Tier,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trips_through_str() {
        for tier in [Tier::Enterprise, Tier::HighPriority, Tier::Standard] {
            assert_eq!(tier.as_str().parse::<Tier>().unwrap(), tier);
        }
    }

    #[test]
    fn standard_leads_rollout_order_enterprise_trails() {
        assert!(Tier::Standard.rollout_rank() < Tier::HighPriority.rollout_rank());
        assert!(Tier::HighPriority.rollout_rank() < Tier::Enterprise.rollout_rank());
    }
}
