//! The provisioning factory

use std::sync::Arc;

use chrono::Utc;
use genesis_adapters::cloud::{CloudApi, CreateVmRequest, CreatedVm};
use genesis_store::{hourly_rate, CostEvent, Store};
use genesis_types::{
    derive_public_dns, CloudAccount, ControlError, ControlResult, DropletHealth, DropletState,
    TenantId,
};
use tracing::{error, info, warn};

use crate::cloud_init::{self, CloudInitParams};
use crate::secrets::SecretSet;

const ACTOR: &str = "provisioning-factory";

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub tenant_id: TenantId,
    pub slug: String,
    pub size_slug: String,
    pub region: String,
    pub requester: String,
}

pub struct ProvisioningFactory {
    store: Arc<dyn Store>,
    cloud: Arc<dyn CloudApi>,
}

impl ProvisioningFactory {
    pub fn new(store: Arc<dyn Store>, cloud: Arc<dyn CloudApi>) -> Self {
        Self { store, cloud }
    }

    /// Create a droplet for the tenant. Idempotent with respect to the
    /// store: a tenant already holding a live droplet gets it back
    /// unchanged (the bus delivers at-least-once).
    pub async fn provision(&self, req: &ProvisionRequest) -> ControlResult<DropletHealth> {
        if let Some(existing) = self.store.get_droplet(&req.tenant_id).await? {
            if !existing.state.is_terminal() {
                info!(tenant = %req.tenant_id, droplet = %existing.droplet_id,
                      "tenant already provisioned, returning existing droplet");
                return Ok(existing);
            }
        }

        // Step 1: the claim is the only step with no compensation of its
        // own; everything after it rolls back through `compensate`.
        let account = self.store.claim_account_slot(&req.region).await?;

        match self.provision_on(&account, req).await {
            Ok(droplet) => Ok(droplet),
            Err((original, minted)) => {
                self.compensate(&account, req, minted).await;
                Err(original)
            }
        }
    }

    /// Steps 2-5. On error, returns the original failure together with the
    /// minted VM (if any) so compensation can target it.
    async fn provision_on(
        &self,
        account: &CloudAccount,
        req: &ProvisionRequest,
    ) -> Result<DropletHealth, (ControlError, Option<CreatedVm>)> {
        let secrets = SecretSet::generate();
        let droplet_name = format!("genesis-{}", req.slug);
        let user_data = cloud_init::render(
            &CloudInitParams {
                tenant_id: req.tenant_id.as_str(),
                slug: &req.slug,
                region: &req.region,
                droplet_name: &droplet_name,
            },
            &secrets,
        );

        let vm = self
            .cloud
            .create_vm(
                account,
                &CreateVmRequest {
                    name: droplet_name,
                    region: req.region.clone(),
                    size_slug: req.size_slug.clone(),
                    user_data,
                    tags: vec!["genesis".into(), format!("tenant:{}", req.tenant_id)],
                },
            )
            .await
            .map_err(|e| (e, None))?;

        let now = Utc::now();
        let droplet = DropletHealth {
            tenant_id: req.tenant_id.clone(),
            droplet_id: vm.id,
            account_id: account.id.clone(),
            region: req.region.clone(),
            size_slug: req.size_slug.clone(),
            public_dns: derive_public_dns(&vm.public_ipv4),
            public_ip: vm.public_ipv4.clone(),
            state: DropletState::Initializing,
            last_heartbeat: None,
            cpu_pct: 0.0,
            mem_pct: 0.0,
            disk_pct: 0.0,
            engine_healthy: false,
            sidecar_version: None,
            credential_fingerprint: None,
            created_at: now,
            updated_at: now,
        };

        self.store
            .create_droplet(&droplet, "provisioned", &req.requester)
            .await
            .map_err(|e| (e, Some(vm.clone())))?;

        let _ = self
            .store
            .record_cost_event(&CostEvent {
                tenant_id: req.tenant_id.clone(),
                droplet_id: droplet.droplet_id,
                kind: "provision".into(),
                amount_delta: hourly_rate(&req.size_slug),
                at: now,
            })
            .await;

        info!(tenant = %req.tenant_id, droplet = %droplet.droplet_id,
              account = %account.id, "droplet provisioned");
        Ok(droplet)
    }

    /// Compensating rollback: delete the minted VM, release the account
    /// slot, and leave an ORPHAN record for the reaper. Each step logs its
    /// own failure; none of them mask the original error.
    async fn compensate(
        &self,
        account: &CloudAccount,
        req: &ProvisionRequest,
        minted: Option<CreatedVm>,
    ) {
        warn!(tenant = %req.tenant_id, account = %account.id, "provisioning rollback started");

        if let Some(vm) = &minted {
            if let Err(err) = self.cloud.delete_vm(account, vm.id).await {
                error!(droplet = %vm.id, error = %err, "rollback: vm delete failed, manual cleanup required");
            }
        }

        if let Err(err) = self.store.release_account_slot(&account.id).await {
            error!(account = %account.id, error = %err, "rollback: account release failed");
        }

        if let Some(vm) = minted {
            // Record what we know about the stray VM. The row may not
            // exist (the insert itself may have been the failure), so this
            // is an insert of an already-orphaned record.
            let now = Utc::now();
            let orphan = DropletHealth {
                tenant_id: req.tenant_id.clone(),
                droplet_id: vm.id,
                account_id: account.id.clone(),
                region: req.region.clone(),
                size_slug: req.size_slug.clone(),
                public_dns: derive_public_dns(&vm.public_ipv4),
                public_ip: vm.public_ipv4,
                state: DropletState::Orphan,
                last_heartbeat: None,
                cpu_pct: 0.0,
                mem_pct: 0.0,
                disk_pct: 0.0,
                engine_healthy: false,
                sidecar_version: None,
                credential_fingerprint: None,
                created_at: now,
                updated_at: now,
            };
            match self.store.get_droplet(&req.tenant_id).await {
                Ok(Some(existing)) if existing.droplet_id == vm.id => {
                    if let Err(err) = self
                        .store
                        .transition(
                            vm.id,
                            DropletState::Orphan,
                            "provisioning rollback",
                            ACTOR,
                            serde_json::Value::Null,
                        )
                        .await
                    {
                        error!(droplet = %vm.id, error = %err, "rollback: orphan transition failed");
                    }
                }
                _ => {
                    if let Err(err) = self
                        .store
                        .create_droplet(&orphan, "provisioning rollback", ACTOR)
                        .await
                    {
                        error!(droplet = %vm.id, error = %err, "rollback: orphan record failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_adapters::testing::{CloudCall, MockCloudApi};
    use genesis_store::MemoryStore;
    use genesis_types::{AccountId, AccountStatus, Secret};

    fn account(id: &str, region: &str, max: u32) -> CloudAccount {
        CloudAccount {
            id: AccountId::new(id),
            api_token: Secret::new("tok"),
            region: region.into(),
            max_droplets: max,
            current_droplets: 0,
            status: AccountStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn request(tenant: &str) -> ProvisionRequest {
        ProvisionRequest {
            tenant_id: TenantId::from(tenant),
            slug: "acme".into(),
            size_slug: "s-2vcpu-4gb".into(),
            region: "nyc3".into(),
            requester: "upstream-api".into(),
        }
    }

    #[tokio::test]
    async fn provision_creates_droplet_and_journals_initializing() {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(MockCloudApi::new());
        store.insert_account(&account("acct-1", "nyc3", 100)).await.unwrap();
        let factory = ProvisioningFactory::new(store.clone(), cloud.clone());

        let droplet = factory.provision(&request("t-1")).await.unwrap();
        assert_eq!(droplet.state, DropletState::Initializing);
        assert_eq!(droplet.public_dns, derive_public_dns(&droplet.public_ip));

        let events = store.lifecycle_events(droplet.droplet_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to_state, DropletState::Initializing);

        let acct = store
            .get_account(&AccountId::new("acct-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acct.current_droplets, 1);
        assert_eq!(cloud.count(|c| matches!(c, CloudCall::Create(_))), 1);
    }

    #[tokio::test]
    async fn provision_is_idempotent_for_live_tenant() {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(MockCloudApi::new());
        store.insert_account(&account("acct-1", "nyc3", 100)).await.unwrap();
        let factory = ProvisioningFactory::new(store.clone(), cloud.clone());

        let first = factory.provision(&request("t-1")).await.unwrap();
        let second = factory.provision(&request("t-1")).await.unwrap();
        assert_eq!(first.droplet_id, second.droplet_id);
        // One VM, one claim: the second call touched neither.
        assert_eq!(cloud.count(|c| matches!(c, CloudCall::Create(_))), 1);
        let acct = store
            .get_account(&AccountId::new("acct-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acct.current_droplets, 1);
    }

    #[tokio::test]
    async fn exhausted_region_fails_with_no_capacity() {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(MockCloudApi::new());
        let factory = ProvisioningFactory::new(store.clone(), cloud.clone());
        let err = factory.provision(&request("t-1")).await.unwrap_err();
        assert!(matches!(err, ControlError::NoCapacity { .. }));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn create_failure_releases_account_without_delete() {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(MockCloudApi::new());
        store.insert_account(&account("acct-1", "nyc3", 100)).await.unwrap();
        cloud.set_fail_create(true);
        let factory = ProvisioningFactory::new(store.clone(), cloud.clone());

        let err = factory.provision(&request("t-1")).await.unwrap_err();
        assert!(matches!(err, ControlError::CloudApi { .. }));
        // No VM was minted, so nothing to delete.
        assert_eq!(cloud.count(|c| matches!(c, CloudCall::Delete(_))), 0);
        let acct = store
            .get_account(&AccountId::new("acct-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acct.current_droplets, 0);
    }

    #[tokio::test]
    async fn compensating_rollback_after_minted_vm() {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(MockCloudApi::new());
        store.insert_account(&account("acct-1", "nyc3", 100)).await.unwrap();
        // VM mints fine; the droplet-health insert fails once.
        store.fail_next_droplet_creates(1);
        let factory = ProvisioningFactory::new(store.clone(), cloud.clone());

        let err = factory.provision(&request("t-1")).await.unwrap_err();
        // The original error surfaces, not a rollback error.
        assert!(matches!(err, ControlError::Store(_)));

        // Exactly one delete, on the minted VM.
        let deletes: Vec<_> = cloud
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                CloudCall::Delete(id) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(deletes.len(), 1);

        // Account decremented back to zero.
        let acct = store
            .get_account(&AccountId::new("acct-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acct.current_droplets, 0);

        // The stray VM is recorded as ORPHAN.
        let droplet = store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(droplet.state, DropletState::Orphan);
        assert_eq!(droplet.droplet_id, deletes[0]);
    }
}
