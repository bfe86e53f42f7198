//! Droplet identity, state machine, and health row
//!
//! The state machine is closed: every transition not listed in
//! [`DropletState::legal_successors`] is rejected by the store with
//! `ControlError::StateTransitionInvalid`, and every accepted transition is
//! journalled before any dependent side effect runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AccountId;
use crate::tenant::TenantId;

/// Numeric provider-assigned VM identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DropletId(pub u64);

impl std::fmt::Display for DropletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Droplet lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DropletState {
    Pending,
    Provisioning,
    Booting,
    Initializing,
    HandshakePending,
    ActiveHealthy,
    ActiveDegraded,
    Hibernating,
    Hibernated,
    Waking,
    Zombie,
    Rebooting,
    Terminated,
    Orphan,
}

impl DropletState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropletState::Pending => "PENDING",
            DropletState::Provisioning => "PROVISIONING",
            DropletState::Booting => "BOOTING",
            DropletState::Initializing => "INITIALIZING",
            DropletState::HandshakePending => "HANDSHAKE_PENDING",
            DropletState::ActiveHealthy => "ACTIVE_HEALTHY",
            DropletState::ActiveDegraded => "ACTIVE_DEGRADED",
            DropletState::Hibernating => "HIBERNATING",
            DropletState::Hibernated => "HIBERNATED",
            DropletState::Waking => "WAKING",
            DropletState::Zombie => "ZOMBIE",
            DropletState::Rebooting => "REBOOTING",
            DropletState::Terminated => "TERMINATED",
            DropletState::Orphan => "ORPHAN",
        }
    }

    /// States a droplet may legally move to from `self`.
    pub fn legal_successors(&self) -> &'static [DropletState] {
        use DropletState::*;
        match self {
            Pending => &[Provisioning, Orphan],
            Provisioning => &[Booting, Orphan],
            Booting => &[Initializing, Orphan],
            Initializing => &[HandshakePending, Orphan],
            HandshakePending => &[ActiveHealthy, Orphan],
            ActiveHealthy => &[ActiveDegraded, Hibernating, Zombie, Terminated, Orphan],
            ActiveDegraded => &[ActiveHealthy, Hibernating, Zombie, Terminated],
            Hibernating => &[Hibernated],
            Hibernated => &[Waking, Terminated],
            Waking => &[ActiveHealthy, Zombie],
            Zombie => &[Rebooting, Terminated],
            Rebooting => &[ActiveHealthy, Zombie],
            Orphan => &[Terminated],
            Terminated => &[],
        }
    }

    pub fn can_transition_to(&self, to: DropletState) -> bool {
        self.legal_successors().contains(&to)
    }

    /// Terminal states release the tenant's 1:1 droplet slot.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DropletState::Terminated | DropletState::Orphan)
    }

    pub fn is_hibernation(&self) -> bool {
        matches!(
            self,
            DropletState::Hibernating | DropletState::Hibernated | DropletState::Waking
        )
    }
}

impl std::str::FromStr for DropletState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use DropletState::*;
        match s {
            "PENDING" => Ok(Pending),
            "PROVISIONING" => Ok(Provisioning),
            "BOOTING" => Ok(Booting),
            "INITIALIZING" => Ok(Initializing),
            "HANDSHAKE_PENDING" => Ok(HandshakePending),
            "ACTIVE_HEALTHY" => Ok(ActiveHealthy),
            "ACTIVE_DEGRADED" => Ok(ActiveDegraded),
            "HIBERNATING" => Ok(Hibernating),
            "HIBERNATED" => Ok(Hibernated),
            "WAKING" => Ok(Waking),
            "ZOMBIE" => Ok(Zombie),
            "REBOOTING" => Ok(Rebooting),
            "TERMINATED" => Ok(Terminated),
            "ORPHAN" => Ok(Orphan),
            other => Err(format!("unknown droplet state: {}", other)),
        }
    }
}

impl std::fmt::Display for DropletState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable public DNS name derived from the droplet's IPv4 address.
/// `203.0.113.7` becomes `203-0-113-7.droplets.genesis.host`.
pub fn derive_public_dns(public_ip: &str) -> String {
    format!("{}.droplets.genesis.host", public_ip.replace('.', "-"))
}

/// One row per tenant in the droplet-health table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropletHealth {
    pub tenant_id: TenantId,
    pub droplet_id: DropletId,
    pub account_id: AccountId,
    pub region: String,
    pub size_slug: String,
    pub public_ip: String,
    pub public_dns: String,
    pub state: DropletState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub disk_pct: f64,
    pub engine_healthy: bool,
    pub sidecar_version: Option<String>,
    pub credential_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_chain_is_legal() {
        use DropletState::*;
        let chain = [
            Pending,
            Provisioning,
            Booting,
            Initializing,
            HandshakePending,
            ActiveHealthy,
        ];
        for pair in chain.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn zombie_recovery_loop_is_legal() {
        use DropletState::*;
        assert!(ActiveHealthy.can_transition_to(Zombie));
        assert!(Zombie.can_transition_to(Rebooting));
        assert!(Rebooting.can_transition_to(ActiveHealthy));
    }

    #[test]
    fn hibernation_loop_is_legal() {
        use DropletState::*;
        assert!(ActiveHealthy.can_transition_to(Hibernating));
        assert!(Hibernating.can_transition_to(Hibernated));
        assert!(Hibernated.can_transition_to(Waking));
        assert!(Waking.can_transition_to(ActiveHealthy));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        assert!(DropletState::Terminated.legal_successors().is_empty());
        assert!(DropletState::Terminated.is_terminal());
        assert!(DropletState::Orphan.is_terminal());
    }

    #[test]
    fn illegal_jumps_are_rejected() {
        use DropletState::*;
        assert!(!Pending.can_transition_to(ActiveHealthy));
        assert!(!Hibernated.can_transition_to(ActiveHealthy));
        assert!(!Zombie.can_transition_to(ActiveHealthy));
    }

    #[test]
    fn every_state_round_trips_through_str() {
        use DropletState::*;
        for state in [
            Pending,
            Provisioning,
            Booting,
            Initializing,
            HandshakePending,
            ActiveHealthy,
            ActiveDegraded,
            Hibernating,
            Hibernated,
            Waking,
            Zombie,
            Rebooting,
            Terminated,
            Orphan,
        ] {
            assert_eq!(state.as_str().parse::<DropletState>().unwrap(), state);
        }
    }

    #[test]
    fn public_dns_from_ip() {
        assert_eq!(
            derive_public_dns("203.0.113.7"),
            "203-0-113-7.droplets.genesis.host"
        );
    }
}
