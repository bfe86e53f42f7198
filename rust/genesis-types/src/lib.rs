// genesis-types: Domain model for the fleet control plane
//
// Everything the other crates agree on lives here: tenant and account
// identity, the droplet state machine, job envelopes and payload variants,
// rollout/wave/ledger records, and the control-plane error taxonomy.

pub mod account;
pub mod droplet;
pub mod error;
pub mod heartbeat;
pub mod job;
pub mod lifecycle;
pub mod rollout;
pub mod secret;
pub mod tenant;

pub use account::{AccountId, AccountStatus, CloudAccount, ACCOUNT_FULL_RATIO};
pub use droplet::{derive_public_dns, DropletHealth, DropletId, DropletState};
pub use error::{ControlError, ControlResult};
pub use heartbeat::{heartbeat_channel, Heartbeat, HEARTBEAT_PATTERN};
pub use job::{
    BackoffKind, BackoffPolicy, CredentialBlob, Job, JobId, JobPayload, QueueName, RebootReason,
    WakeReason,
};
pub use lifecycle::{FlowStepRecord, LifecycleEvent};
pub use rollout::{
    Rollout, RolloutCounters, RolloutId, RolloutStatus, RolloutStrategy, VersionLedgerEntry, Wave,
    WaveStatus, WAVE_PERCENTS,
};
pub use secret::Secret;
pub use tenant::{Tenant, TenantId, Tier};
