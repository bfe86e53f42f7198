// genesis-store: Persistent state layer
//
// Everything durable lives behind the `Store` trait: the account pool,
// droplet-health rows, the append-only lifecycle journal (which enforces
// transition legality), the version ledger, rollout/wave records,
// credential updates, and cost entries. `PgStore` talks to Postgres under
// the `genesis` schema; `MemoryStore` provides identical semantics for
// tests and dry runs.

pub mod memory;
pub mod pg;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genesis_types::{
    AccountId, AccountStatus, CloudAccount, ControlResult, CredentialBlob, DropletHealth,
    DropletId, DropletState, FlowStepRecord, Heartbeat, LifecycleEvent, Rollout, RolloutId,
    Tenant, TenantId, VersionLedgerEntry, Wave,
};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use pg::PgStore;

/// Upstream activity signals that drive hibernation eligibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantActivity {
    pub tenant_id: TenantId,
    pub last_campaign_at: Option<DateTime<Utc>>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    /// Billing/subscription standing, owned upstream.
    pub account_active: bool,
    /// Operator override: never hibernate while held.
    pub manual_hold: bool,
}

/// A campaign start time the predictive warmer can schedule against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledCampaign {
    pub tenant_id: TenantId,
    pub scheduled_at: DateTime<Utc>,
}

/// Append-only record of one credential push to a droplet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialUpdate {
    pub tenant_id: TenantId,
    pub droplet_id: DropletId,
    pub credential_type: String,
    /// SHA-256 of the encrypted blob; never the blob itself.
    pub fingerprint: String,
    pub rollout_id: Option<RolloutId>,
    pub at: DateTime<Utc>,
}

impl CredentialUpdate {
    pub fn fingerprint_of(blob: &CredentialBlob) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(blob.encrypted_payload.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Fingerprint of a whole credential bundle, stored on the droplet row.
pub fn bundle_fingerprint(blobs: &[CredentialBlob]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for blob in blobs {
        hasher.update(blob.credential_type.as_bytes());
        hasher.update(blob.encrypted_payload.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Hourly provider rate by droplet size, for cost ledger entries.
pub fn hourly_rate(size_slug: &str) -> f64 {
    match size_slug {
        "s-1vcpu-2gb" => 0.018,
        "s-2vcpu-4gb" => 0.036,
        "s-4vcpu-8gb" => 0.071,
        _ => 0.036,
    }
}

/// Cost ledger entry: positive `amount_delta` is added hourly spend,
/// negative is savings (hibernation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEvent {
    pub tenant_id: TenantId,
    pub droplet_id: DropletId,
    pub kind: String,
    pub amount_delta: f64,
    pub at: DateTime<Utc>,
}

/// Fleet-wide aggregate computed from droplet-health.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSummary {
    pub total: u64,
    pub by_state: HashMap<String, u64>,
}

impl FleetSummary {
    pub fn count(&self, state: DropletState) -> u64 {
        self.by_state.get(state.as_str()).copied().unwrap_or(0)
    }
}

/// The persistent store contract.
///
/// Invariants enforced here, not in callers: account capacity bounds
/// (`current <= max`, floor 0, 0.95 full-flip in the same atomic step),
/// tenant/droplet 1:1 (a second non-terminal droplet is rejected), and
/// lifecycle legality (illegal transitions error, every accepted one is
/// journalled atomically with the state change, serialized per droplet).
#[async_trait]
pub trait Store: Send + Sync {
    // -- account pool -------------------------------------------------------

    async fn insert_account(&self, account: &CloudAccount) -> ControlResult<()>;
    async fn get_account(&self, id: &AccountId) -> ControlResult<Option<CloudAccount>>;
    async fn list_accounts(&self) -> ControlResult<Vec<CloudAccount>>;

    /// Pick the active account in `region` with the most headroom (oldest
    /// wins ties), increment its count, and flip its status if the
    /// increment crosses the full threshold. `NO_CAPACITY` when the pool is
    /// exhausted.
    async fn claim_account_slot(&self, region: &str) -> ControlResult<CloudAccount>;

    /// Decrement (floored at zero) and re-derive the active/full flip.
    async fn release_account_slot(&self, id: &AccountId) -> ControlResult<()>;

    async fn set_account_status(&self, id: &AccountId, status: AccountStatus)
        -> ControlResult<()>;

    // -- tenants ------------------------------------------------------------

    async fn insert_tenant(&self, tenant: &Tenant) -> ControlResult<()>;
    async fn get_tenant(&self, id: &TenantId) -> ControlResult<Option<Tenant>>;
    async fn list_tenants(&self) -> ControlResult<Vec<Tenant>>;

    async fn get_activity(&self, id: &TenantId) -> ControlResult<Option<TenantActivity>>;
    async fn upsert_activity(&self, activity: &TenantActivity) -> ControlResult<()>;

    async fn scheduled_campaigns_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ControlResult<Vec<ScheduledCampaign>>;

    // -- droplets -----------------------------------------------------------

    /// Insert the droplet-health row and journal its initial lifecycle
    /// event in one transaction. Rejects a tenant that already owns a
    /// non-terminal droplet.
    async fn create_droplet(
        &self,
        droplet: &DropletHealth,
        reason: &str,
        actor: &str,
    ) -> ControlResult<()>;

    async fn get_droplet(&self, tenant: &TenantId) -> ControlResult<Option<DropletHealth>>;
    async fn get_droplet_by_id(&self, id: DropletId) -> ControlResult<Option<DropletHealth>>;
    async fn list_droplets(&self) -> ControlResult<Vec<DropletHealth>>;

    /// Droplets the watchdog sweeps: ACTIVE_HEALTHY and ACTIVE_DEGRADED.
    async fn list_active_droplets(&self) -> ControlResult<Vec<DropletHealth>>;

    /// Bulk last-writer-wins upsert of heartbeat gauges onto existing rows.
    async fn update_gauges_bulk(&self, heartbeats: &[Heartbeat]) -> ControlResult<()>;

    async fn update_droplet_versions(
        &self,
        tenant: &TenantId,
        sidecar_version: Option<&str>,
        credential_fingerprint: Option<&str>,
    ) -> ControlResult<()>;

    // -- lifecycle journal --------------------------------------------------

    /// Validate and apply a state transition: journal row plus state update
    /// atomically, serialized per droplet ID.
    async fn transition(
        &self,
        droplet_id: DropletId,
        to: DropletState,
        reason: &str,
        actor: &str,
        metadata: serde_json::Value,
    ) -> ControlResult<LifecycleEvent>;

    /// Journal the TERMINATED transition and decrement the owning account's
    /// count in the same logical transaction (destruction invariant).
    async fn terminate_droplet(
        &self,
        droplet_id: DropletId,
        reason: &str,
        actor: &str,
    ) -> ControlResult<()>;

    async fn lifecycle_events(&self, droplet_id: DropletId) -> ControlResult<Vec<LifecycleEvent>>;

    /// Checkpoint a step of a strictly ordered flow (hibernate/wake).
    async fn record_flow_step(&self, step: &FlowStepRecord) -> ControlResult<()>;
    async fn flow_steps(
        &self,
        droplet_id: DropletId,
        flow: &str,
    ) -> ControlResult<Vec<FlowStepRecord>>;

    // -- version ledger -----------------------------------------------------

    /// Append one immutable ledger row.
    async fn record_version(&self, entry: &VersionLedgerEntry) -> ControlResult<()>;

    /// Latest row for (tenant, component); the derived "current version".
    async fn current_version(
        &self,
        tenant: &TenantId,
        component: &str,
    ) -> ControlResult<Option<VersionLedgerEntry>>;

    /// Latest row per tenant for a component.
    async fn versions_for_component(
        &self,
        component: &str,
    ) -> ControlResult<Vec<VersionLedgerEntry>>;

    /// Rows appended by a given rollout.
    async fn versions_changed_by(
        &self,
        rollout_id: RolloutId,
    ) -> ControlResult<Vec<VersionLedgerEntry>>;

    // -- rollouts -----------------------------------------------------------

    async fn insert_rollout(&self, rollout: &Rollout) -> ControlResult<()>;
    async fn get_rollout(&self, id: RolloutId) -> ControlResult<Option<Rollout>>;
    async fn update_rollout(&self, rollout: &Rollout) -> ControlResult<()>;

    /// The non-terminal rollout for a component, if any.
    async fn active_rollout_for_component(
        &self,
        component: &str,
    ) -> ControlResult<Option<Rollout>>;

    async fn upsert_wave(&self, wave: &Wave) -> ControlResult<()>;
    async fn get_wave(&self, rollout_id: RolloutId, number: u32) -> ControlResult<Option<Wave>>;
    async fn list_waves(&self, rollout_id: RolloutId) -> ControlResult<Vec<Wave>>;

    // -- workflow templates -------------------------------------------------

    /// Store the body deployed for a logical component at a version.
    async fn upsert_template(
        &self,
        component: &str,
        version: &str,
        body: &serde_json::Value,
    ) -> ControlResult<()>;

    /// Latest stored (version, body) for a component.
    async fn get_template(
        &self,
        component: &str,
    ) -> ControlResult<Option<(String, serde_json::Value)>>;

    // -- credential + cost journals -----------------------------------------

    async fn record_credential_update(&self, update: &CredentialUpdate) -> ControlResult<()>;
    async fn credential_updates(&self, tenant: &TenantId) -> ControlResult<Vec<CredentialUpdate>>;

    async fn record_cost_event(&self, event: &CostEvent) -> ControlResult<()>;

    // -- aggregates ---------------------------------------------------------

    async fn fleet_summary(&self) -> ControlResult<FleetSummary>;

    /// Liveness probe.
    async fn ping(&self) -> ControlResult<()>;
}
