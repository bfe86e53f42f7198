//! In-memory store with Postgres-equivalent semantics
//!
//! One lock around the whole state stands in for the per-droplet critical
//! sections the SQL layer gets from row locks. Used by tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genesis_types::{
    AccountId, AccountStatus, CloudAccount, ControlError, ControlResult, DropletHealth, DropletId,
    DropletState, FlowStepRecord, Heartbeat, LifecycleEvent, Rollout, RolloutId, Tenant, TenantId,
    VersionLedgerEntry, Wave,
};
use parking_lot::RwLock;

use crate::{
    CostEvent, CredentialUpdate, FleetSummary, ScheduledCampaign, Store, TenantActivity,
};

#[derive(Default)]
struct Inner {
    accounts: HashMap<AccountId, CloudAccount>,
    tenants: HashMap<TenantId, Tenant>,
    activity: HashMap<TenantId, TenantActivity>,
    campaigns: Vec<ScheduledCampaign>,
    droplets: HashMap<TenantId, DropletHealth>,
    droplet_tenants: HashMap<DropletId, TenantId>,
    lifecycle: Vec<LifecycleEvent>,
    flow_steps: Vec<FlowStepRecord>,
    ledger: Vec<VersionLedgerEntry>,
    rollouts: HashMap<RolloutId, Rollout>,
    waves: HashMap<(RolloutId, u32), Wave>,
    credential_updates: Vec<CredentialUpdate>,
    cost_events: Vec<CostEvent>,
    templates: HashMap<String, (String, serde_json::Value)>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    fail_droplet_creates: AtomicU32,
    fail_gauge_updates: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            fail_droplet_creates: AtomicU32::new(0),
            fail_gauge_updates: AtomicU32::new(0),
        }
    }

    /// Make the next `n` calls to `update_gauges_bulk` fail, for exercising
    /// heartbeat re-buffering.
    pub fn fail_next_gauge_updates(&self, n: u32) {
        self.fail_gauge_updates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `create_droplet` fail, for exercising
    /// compensating rollback.
    pub fn fail_next_droplet_creates(&self, n: u32) {
        self.fail_droplet_creates.store(n, Ordering::SeqCst);
    }

    pub fn cost_events(&self) -> Vec<CostEvent> {
        self.inner.read().cost_events.clone()
    }

    pub fn add_scheduled_campaign(&self, campaign: ScheduledCampaign) {
        self.inner.write().campaigns.push(campaign);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn derive_status(max: u32, current: u32, existing: AccountStatus) -> AccountStatus {
    if existing == AccountStatus::Disabled {
        AccountStatus::Disabled
    } else {
        CloudAccount::status_for_count(max, current)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_account(&self, account: &CloudAccount) -> ControlResult<()> {
        self.inner
            .write()
            .accounts
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn get_account(&self, id: &AccountId) -> ControlResult<Option<CloudAccount>> {
        Ok(self.inner.read().accounts.get(id).cloned())
    }

    async fn list_accounts(&self) -> ControlResult<Vec<CloudAccount>> {
        Ok(self.inner.read().accounts.values().cloned().collect())
    }

    async fn claim_account_slot(&self, region: &str) -> ControlResult<CloudAccount> {
        let mut inner = self.inner.write();
        let best = inner
            .accounts
            .values()
            .filter(|a| {
                a.region == region
                    && a.status == AccountStatus::Active
                    && a.current_droplets < a.max_droplets
            })
            .max_by(|a, b| {
                a.headroom()
                    .cmp(&b.headroom())
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|a| a.id.clone());
        let Some(id) = best else {
            return Err(ControlError::NoCapacity {
                region: region.to_string(),
            });
        };
        let account = inner.accounts.get_mut(&id).expect("id just selected");
        account.current_droplets += 1;
        account.status = derive_status(
            account.max_droplets,
            account.current_droplets,
            account.status,
        );
        Ok(account.clone())
    }

    async fn release_account_slot(&self, id: &AccountId) -> ControlResult<()> {
        let mut inner = self.inner.write();
        if let Some(account) = inner.accounts.get_mut(id) {
            account.current_droplets = account.current_droplets.saturating_sub(1);
            account.status = derive_status(
                account.max_droplets,
                account.current_droplets,
                account.status,
            );
        }
        Ok(())
    }

    async fn set_account_status(
        &self,
        id: &AccountId,
        status: AccountStatus,
    ) -> ControlResult<()> {
        if let Some(account) = self.inner.write().accounts.get_mut(id) {
            account.status = status;
        }
        Ok(())
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> ControlResult<()> {
        self.inner
            .write()
            .tenants
            .insert(tenant.id.clone(), tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, id: &TenantId) -> ControlResult<Option<Tenant>> {
        Ok(self.inner.read().tenants.get(id).cloned())
    }

    async fn list_tenants(&self) -> ControlResult<Vec<Tenant>> {
        Ok(self.inner.read().tenants.values().cloned().collect())
    }

    async fn get_activity(&self, id: &TenantId) -> ControlResult<Option<TenantActivity>> {
        Ok(self.inner.read().activity.get(id).cloned())
    }

    async fn upsert_activity(&self, activity: &TenantActivity) -> ControlResult<()> {
        self.inner
            .write()
            .activity
            .insert(activity.tenant_id.clone(), activity.clone());
        Ok(())
    }

    async fn scheduled_campaigns_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ControlResult<Vec<ScheduledCampaign>> {
        Ok(self
            .inner
            .read()
            .campaigns
            .iter()
            .filter(|c| c.scheduled_at >= from && c.scheduled_at <= to)
            .cloned()
            .collect())
    }

    async fn create_droplet(
        &self,
        droplet: &DropletHealth,
        reason: &str,
        actor: &str,
    ) -> ControlResult<()> {
        if self
            .fail_droplet_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ControlError::Store("injected insert failure".into()));
        }
        let mut inner = self.inner.write();
        if let Some(existing) = inner.droplets.get(&droplet.tenant_id) {
            if !existing.state.is_terminal() {
                return Err(ControlError::ValidationFailed(format!(
                    "tenant {} already owns droplet {}",
                    droplet.tenant_id, existing.droplet_id
                )));
            }
        }
        inner
            .droplet_tenants
            .insert(droplet.droplet_id, droplet.tenant_id.clone());
        inner
            .droplets
            .insert(droplet.tenant_id.clone(), droplet.clone());
        inner.lifecycle.push(LifecycleEvent {
            droplet_id: droplet.droplet_id,
            tenant_id: droplet.tenant_id.clone(),
            from_state: None,
            to_state: droplet.state,
            reason: reason.to_string(),
            actor: actor.to_string(),
            at: Utc::now(),
            metadata: serde_json::Value::Null,
        });
        Ok(())
    }

    async fn get_droplet(&self, tenant: &TenantId) -> ControlResult<Option<DropletHealth>> {
        Ok(self.inner.read().droplets.get(tenant).cloned())
    }

    async fn get_droplet_by_id(&self, id: DropletId) -> ControlResult<Option<DropletHealth>> {
        let inner = self.inner.read();
        Ok(inner
            .droplet_tenants
            .get(&id)
            .and_then(|tenant| inner.droplets.get(tenant))
            .filter(|d| d.droplet_id == id)
            .cloned())
    }

    async fn list_droplets(&self) -> ControlResult<Vec<DropletHealth>> {
        Ok(self.inner.read().droplets.values().cloned().collect())
    }

    async fn list_active_droplets(&self) -> ControlResult<Vec<DropletHealth>> {
        Ok(self
            .inner
            .read()
            .droplets
            .values()
            .filter(|d| {
                matches!(
                    d.state,
                    DropletState::ActiveHealthy | DropletState::ActiveDegraded
                )
            })
            .cloned()
            .collect())
    }

    async fn update_gauges_bulk(&self, heartbeats: &[Heartbeat]) -> ControlResult<()> {
        if self
            .fail_gauge_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ControlError::Store("injected flush failure".into()));
        }
        let mut inner = self.inner.write();
        for hb in heartbeats {
            if let Some(droplet) = inner.droplets.get_mut(&hb.tenant_id) {
                droplet.last_heartbeat = Some(hb.ts);
                droplet.cpu_pct = hb.cpu_pct;
                droplet.mem_pct = hb.mem_pct;
                droplet.disk_pct = hb.disk_pct;
                droplet.engine_healthy = hb.engine_healthy;
                droplet.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn update_droplet_versions(
        &self,
        tenant: &TenantId,
        sidecar_version: Option<&str>,
        credential_fingerprint: Option<&str>,
    ) -> ControlResult<()> {
        let mut inner = self.inner.write();
        if let Some(droplet) = inner.droplets.get_mut(tenant) {
            if let Some(v) = sidecar_version {
                droplet.sidecar_version = Some(v.to_string());
            }
            if let Some(f) = credential_fingerprint {
                droplet.credential_fingerprint = Some(f.to_string());
            }
            droplet.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn transition(
        &self,
        droplet_id: DropletId,
        to: DropletState,
        reason: &str,
        actor: &str,
        metadata: serde_json::Value,
    ) -> ControlResult<LifecycleEvent> {
        let mut inner = self.inner.write();
        let tenant = inner
            .droplet_tenants
            .get(&droplet_id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(format!("droplet {}", droplet_id)))?;
        let droplet = inner
            .droplets
            .get_mut(&tenant)
            .ok_or_else(|| ControlError::NotFound(format!("droplet {}", droplet_id)))?;
        let from = droplet.state;
        if !from.can_transition_to(to) {
            return Err(ControlError::StateTransitionInvalid { from, to });
        }
        droplet.state = to;
        droplet.updated_at = Utc::now();
        let event = LifecycleEvent {
            droplet_id,
            tenant_id: tenant,
            from_state: Some(from),
            to_state: to,
            reason: reason.to_string(),
            actor: actor.to_string(),
            at: Utc::now(),
            metadata,
        };
        inner.lifecycle.push(event.clone());
        Ok(event)
    }

    async fn terminate_droplet(
        &self,
        droplet_id: DropletId,
        reason: &str,
        actor: &str,
    ) -> ControlResult<()> {
        let mut inner = self.inner.write();
        let tenant = inner
            .droplet_tenants
            .get(&droplet_id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(format!("droplet {}", droplet_id)))?;
        let droplet = inner
            .droplets
            .get_mut(&tenant)
            .ok_or_else(|| ControlError::NotFound(format!("droplet {}", droplet_id)))?;
        let from = droplet.state;
        if !from.can_transition_to(DropletState::Terminated) {
            return Err(ControlError::StateTransitionInvalid {
                from,
                to: DropletState::Terminated,
            });
        }
        droplet.state = DropletState::Terminated;
        droplet.updated_at = Utc::now();
        let account_id = droplet.account_id.clone();
        inner.lifecycle.push(LifecycleEvent {
            droplet_id,
            tenant_id: tenant,
            from_state: Some(from),
            to_state: DropletState::Terminated,
            reason: reason.to_string(),
            actor: actor.to_string(),
            at: Utc::now(),
            metadata: serde_json::Value::Null,
        });
        if let Some(account) = inner.accounts.get_mut(&account_id) {
            account.current_droplets = account.current_droplets.saturating_sub(1);
            account.status = derive_status(
                account.max_droplets,
                account.current_droplets,
                account.status,
            );
        }
        Ok(())
    }

    async fn lifecycle_events(&self, droplet_id: DropletId) -> ControlResult<Vec<LifecycleEvent>> {
        Ok(self
            .inner
            .read()
            .lifecycle
            .iter()
            .filter(|e| e.droplet_id == droplet_id)
            .cloned()
            .collect())
    }

    async fn record_flow_step(&self, step: &FlowStepRecord) -> ControlResult<()> {
        self.inner.write().flow_steps.push(step.clone());
        Ok(())
    }

    async fn flow_steps(
        &self,
        droplet_id: DropletId,
        flow: &str,
    ) -> ControlResult<Vec<FlowStepRecord>> {
        Ok(self
            .inner
            .read()
            .flow_steps
            .iter()
            .filter(|s| s.droplet_id == droplet_id && s.flow == flow)
            .cloned()
            .collect())
    }

    async fn record_version(&self, entry: &VersionLedgerEntry) -> ControlResult<()> {
        self.inner.write().ledger.push(entry.clone());
        Ok(())
    }

    async fn current_version(
        &self,
        tenant: &TenantId,
        component: &str,
    ) -> ControlResult<Option<VersionLedgerEntry>> {
        Ok(self
            .inner
            .read()
            .ledger
            .iter()
            .rev()
            .find(|e| &e.tenant_id == tenant && e.component == component)
            .cloned())
    }

    async fn versions_for_component(
        &self,
        component: &str,
    ) -> ControlResult<Vec<VersionLedgerEntry>> {
        let inner = self.inner.read();
        let mut latest: HashMap<TenantId, VersionLedgerEntry> = HashMap::new();
        for entry in inner.ledger.iter().filter(|e| e.component == component) {
            latest.insert(entry.tenant_id.clone(), entry.clone());
        }
        Ok(latest.into_values().collect())
    }

    async fn versions_changed_by(
        &self,
        rollout_id: RolloutId,
    ) -> ControlResult<Vec<VersionLedgerEntry>> {
        Ok(self
            .inner
            .read()
            .ledger
            .iter()
            .filter(|e| e.rollout_id == Some(rollout_id))
            .cloned()
            .collect())
    }

    async fn insert_rollout(&self, rollout: &Rollout) -> ControlResult<()> {
        self.inner
            .write()
            .rollouts
            .insert(rollout.id, rollout.clone());
        Ok(())
    }

    async fn get_rollout(&self, id: RolloutId) -> ControlResult<Option<Rollout>> {
        Ok(self.inner.read().rollouts.get(&id).cloned())
    }

    async fn update_rollout(&self, rollout: &Rollout) -> ControlResult<()> {
        self.inner
            .write()
            .rollouts
            .insert(rollout.id, rollout.clone());
        Ok(())
    }

    async fn active_rollout_for_component(
        &self,
        component: &str,
    ) -> ControlResult<Option<Rollout>> {
        Ok(self
            .inner
            .read()
            .rollouts
            .values()
            .find(|r| r.component == component && !r.status.is_terminal())
            .cloned())
    }

    async fn upsert_wave(&self, wave: &Wave) -> ControlResult<()> {
        self.inner
            .write()
            .waves
            .insert((wave.rollout_id, wave.number), wave.clone());
        Ok(())
    }

    async fn get_wave(&self, rollout_id: RolloutId, number: u32) -> ControlResult<Option<Wave>> {
        Ok(self.inner.read().waves.get(&(rollout_id, number)).cloned())
    }

    async fn list_waves(&self, rollout_id: RolloutId) -> ControlResult<Vec<Wave>> {
        let mut waves: Vec<Wave> = self
            .inner
            .read()
            .waves
            .values()
            .filter(|w| w.rollout_id == rollout_id)
            .cloned()
            .collect();
        waves.sort_by_key(|w| w.number);
        Ok(waves)
    }

    async fn upsert_template(
        &self,
        component: &str,
        version: &str,
        body: &serde_json::Value,
    ) -> ControlResult<()> {
        self.inner
            .write()
            .templates
            .insert(component.to_string(), (version.to_string(), body.clone()));
        Ok(())
    }

    async fn get_template(
        &self,
        component: &str,
    ) -> ControlResult<Option<(String, serde_json::Value)>> {
        Ok(self.inner.read().templates.get(component).cloned())
    }

    async fn record_credential_update(&self, update: &CredentialUpdate) -> ControlResult<()> {
        self.inner.write().credential_updates.push(update.clone());
        Ok(())
    }

    async fn credential_updates(&self, tenant: &TenantId) -> ControlResult<Vec<CredentialUpdate>> {
        Ok(self
            .inner
            .read()
            .credential_updates
            .iter()
            .filter(|u| &u.tenant_id == tenant)
            .cloned()
            .collect())
    }

    async fn record_cost_event(&self, event: &CostEvent) -> ControlResult<()> {
        self.inner.write().cost_events.push(event.clone());
        Ok(())
    }

    async fn fleet_summary(&self) -> ControlResult<FleetSummary> {
        let inner = self.inner.read();
        let mut summary = FleetSummary::default();
        for droplet in inner.droplets.values() {
            summary.total += 1;
            *summary
                .by_state
                .entry(droplet.state.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(summary)
    }

    async fn ping(&self) -> ControlResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_types::{derive_public_dns, Secret};

    fn account(id: &str, region: &str, max: u32, current: u32, age_days: i64) -> CloudAccount {
        CloudAccount {
            id: AccountId::new(id),
            api_token: Secret::new("tok"),
            region: region.into(),
            max_droplets: max,
            current_droplets: current,
            status: CloudAccount::status_for_count(max, current),
            created_at: Utc::now() - chrono::Duration::days(age_days),
        }
    }

    fn droplet(tenant: &str, id: u64, state: DropletState) -> DropletHealth {
        let ip = format!("203.0.113.{}", id % 250);
        DropletHealth {
            tenant_id: TenantId::from(tenant),
            droplet_id: DropletId(id),
            account_id: AccountId::new("acct-1"),
            region: "nyc3".into(),
            size_slug: "s-2vcpu-4gb".into(),
            public_dns: derive_public_dns(&ip),
            public_ip: ip,
            state,
            last_heartbeat: None,
            cpu_pct: 0.0,
            mem_pct: 0.0,
            disk_pct: 0.0,
            engine_healthy: true,
            sidecar_version: None,
            credential_fingerprint: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn claim_prefers_headroom_then_age() {
        let store = MemoryStore::new();
        store
            .insert_account(&account("roomy-new", "nyc3", 100, 10, 1))
            .await
            .unwrap();
        store
            .insert_account(&account("roomy-old", "nyc3", 100, 10, 30))
            .await
            .unwrap();
        store
            .insert_account(&account("tight", "nyc3", 100, 90, 60))
            .await
            .unwrap();

        let claimed = store.claim_account_slot("nyc3").await.unwrap();
        // Same headroom: the older account wins the tie.
        assert_eq!(claimed.id.as_str(), "roomy-old");
        assert_eq!(claimed.current_droplets, 11);
    }

    #[tokio::test]
    async fn claim_exhausted_pool_is_no_capacity() {
        let store = MemoryStore::new();
        store
            .insert_account(&account("full", "nyc3", 10, 10, 1))
            .await
            .unwrap();
        store
            .insert_account(&account("wrong-region", "sfo2", 10, 0, 1))
            .await
            .unwrap();
        let err = store.claim_account_slot("nyc3").await.unwrap_err();
        assert!(matches!(err, ControlError::NoCapacity { region } if region == "nyc3"));
    }

    #[tokio::test]
    async fn claim_flips_full_at_threshold_and_release_flips_back() {
        let store = MemoryStore::new();
        store
            .insert_account(&account("edge", "nyc3", 20, 18, 1))
            .await
            .unwrap();
        // 19/20 = 0.95: the claim itself flips the account to full.
        let claimed = store.claim_account_slot("nyc3").await.unwrap();
        assert_eq!(claimed.status, AccountStatus::Full);
        // And a full account no longer qualifies.
        assert!(store.claim_account_slot("nyc3").await.is_err());

        store
            .release_account_slot(&AccountId::new("edge"))
            .await
            .unwrap();
        let account = store
            .get_account(&AccountId::new("edge"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.status, AccountStatus::Active);
        assert_eq!(account.current_droplets, 18);
    }

    #[tokio::test]
    async fn release_never_goes_below_zero() {
        let store = MemoryStore::new();
        store
            .insert_account(&account("empty", "nyc3", 10, 0, 1))
            .await
            .unwrap();
        store
            .release_account_slot(&AccountId::new("empty"))
            .await
            .unwrap();
        let account = store
            .get_account(&AccountId::new("empty"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.current_droplets, 0);
    }

    #[tokio::test]
    async fn second_nonterminal_droplet_for_tenant_is_rejected() {
        let store = MemoryStore::new();
        store
            .create_droplet(
                &droplet("t-1", 1, DropletState::Initializing),
                "provisioned",
                "factory",
            )
            .await
            .unwrap();
        let err = store
            .create_droplet(
                &droplet("t-1", 2, DropletState::Initializing),
                "provisioned",
                "factory",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::ValidationFailed(_)));

        // A terminal predecessor frees the slot.
        store
            .transition(DropletId(1), DropletState::Orphan, "rollback", "factory", serde_json::Value::Null)
            .await
            .unwrap();
        store
            .create_droplet(
                &droplet("t-1", 2, DropletState::Initializing),
                "provisioned",
                "factory",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transition_journals_and_rejects_illegal_moves() {
        let store = MemoryStore::new();
        store
            .create_droplet(
                &droplet("t-1", 1, DropletState::ActiveHealthy),
                "test",
                "test",
            )
            .await
            .unwrap();

        let event = store
            .transition(
                DropletId(1),
                DropletState::Zombie,
                "heartbeat stale",
                "watchdog",
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(event.from_state, Some(DropletState::ActiveHealthy));
        assert_eq!(event.to_state, DropletState::Zombie);

        let err = store
            .transition(
                DropletId(1),
                DropletState::ActiveHealthy,
                "bad",
                "test",
                serde_json::Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::StateTransitionInvalid {
                from: DropletState::Zombie,
                to: DropletState::ActiveHealthy
            }
        ));

        // Journal has creation + one transition, nothing for the rejection.
        let events = store.lifecycle_events(DropletId(1)).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn ledger_current_version_is_last_row() {
        let store = MemoryStore::new();
        let tenant = TenantId::from("t-1");
        for (version, previous) in [("v1", None), ("v2", Some("v1"))] {
            store
                .record_version(&VersionLedgerEntry {
                    tenant_id: tenant.clone(),
                    component: "sidecar".into(),
                    version: version.into(),
                    previous_version: previous.map(String::from),
                    rollout_id: None,
                    recorded_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let current = store
            .current_version(&tenant, "sidecar")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.version, "v2");
        assert_eq!(current.previous_version.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn gauges_bulk_update_applies_last_writer() {
        let store = MemoryStore::new();
        store
            .create_droplet(
                &droplet("t-1", 1, DropletState::ActiveHealthy),
                "test",
                "test",
            )
            .await
            .unwrap();
        let now = Utc::now();
        store
            .update_gauges_bulk(&[Heartbeat {
                tenant_id: TenantId::from("t-1"),
                droplet_id: DropletId(1),
                ts: now,
                cpu_pct: 42.0,
                mem_pct: 50.0,
                disk_pct: 10.0,
                engine_healthy: true,
            }])
            .await
            .unwrap();
        let row = store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.cpu_pct, 42.0);
        assert_eq!(row.last_heartbeat, Some(now));
    }
}
