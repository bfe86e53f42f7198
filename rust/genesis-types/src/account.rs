//! Cloud provider sub-account pool

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::secret::Secret;

/// Occupancy ratio at which an account flips `active -> full`.
pub const ACCOUNT_FULL_RATIO: f64 = 0.95;

/// Cloud sub-account identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Full,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Full => "full",
            AccountStatus::Disabled => "disabled",
        }
    }
}

impl std::str::FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "full" => Ok(AccountStatus::Full),
            "disabled" => Ok(AccountStatus::Disabled),
            other => Err(format!("unknown account status: {}", other)),
        }
    }
}

/// One sub-account in the provider pool.
///
/// Invariant: `current_droplets <= max_droplets` at all times; the status
/// flips to `full` when occupancy crosses [`ACCOUNT_FULL_RATIO`] and back to
/// `active` below it. Both flips happen in the same atomic step as the
/// counter change (enforced by the store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudAccount {
    pub id: AccountId,
    pub api_token: Secret,
    pub region: String,
    pub max_droplets: u32,
    pub current_droplets: u32,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

impl CloudAccount {
    pub fn headroom(&self) -> u32 {
        self.max_droplets.saturating_sub(self.current_droplets)
    }

    /// Status implied by a droplet count, ignoring `disabled` which is an
    /// operator override the counter never touches.
    pub fn status_for_count(max_droplets: u32, current_droplets: u32) -> AccountStatus {
        if (current_droplets as f64) >= (max_droplets as f64) * ACCOUNT_FULL_RATIO {
            AccountStatus::Full
        } else {
            AccountStatus::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_flip_at_ninety_five_percent() {
        assert_eq!(
            CloudAccount::status_for_count(100, 94),
            AccountStatus::Active
        );
        assert_eq!(CloudAccount::status_for_count(100, 95), AccountStatus::Full);
        assert_eq!(CloudAccount::status_for_count(100, 100), AccountStatus::Full);
    }

    #[test]
    fn headroom_never_underflows() {
        let acct = CloudAccount {
            id: AccountId::new("acct-1"),
            api_token: Secret::new("tok"),
            region: "nyc3".into(),
            max_droplets: 10,
            current_droplets: 12,
            status: AccountStatus::Full,
            created_at: Utc::now(),
        };
        assert_eq!(acct.headroom(), 0);
    }
}
