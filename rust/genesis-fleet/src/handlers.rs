//! Update job handlers
//!
//! The three handlers the engine's emissions run through. All of them are
//! idempotent against the store: re-delivery re-applies the same versions
//! and the sidecar overwrites same-type credentials.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use genesis_adapters::sidecar::{wait_healthy, SidecarApi};
use genesis_bus::JobHandler;
use genesis_store::{bundle_fingerprint, CredentialUpdate, Store};
use genesis_types::{
    ControlError, ControlResult, DropletHealth, Job, JobPayload, TenantId, VersionLedgerEntry,
};
use tracing::{error, info};

fn sidecar_base_url(droplet: &DropletHealth) -> String {
    format!("https://{}", droplet.public_dns)
}

async fn live_droplet(store: &Arc<dyn Store>, tenant: &TenantId) -> ControlResult<DropletHealth> {
    let droplet = store
        .get_droplet(tenant)
        .await?
        .ok_or_else(|| ControlError::NotFound(format!("droplet for tenant {}", tenant)))?;
    if droplet.state.is_terminal() {
        return Err(ControlError::ValidationFailed(format!(
            "tenant {} droplet is {}",
            tenant,
            droplet.state.as_str()
        )));
    }
    Ok(droplet)
}

/// POST the workflow body to the tenant's sidecar and append the ledger
/// row. HTTP failures surface retryable; the bus owns the retry budget.
pub struct WorkflowUpdateHandler {
    store: Arc<dyn Store>,
    sidecar: Arc<dyn SidecarApi>,
}

impl WorkflowUpdateHandler {
    pub fn new(store: Arc<dyn Store>, sidecar: Arc<dyn SidecarApi>) -> Self {
        Self { store, sidecar }
    }
}

#[async_trait]
impl JobHandler for WorkflowUpdateHandler {
    async fn handle(&self, job: &Job) -> ControlResult<()> {
        let JobPayload::WorkflowUpdate {
            tenant_id,
            workflow_name,
            workflow_body,
            version,
            rollout_id,
            ..
        } = &job.payload
        else {
            return Err(ControlError::ValidationFailed(
                "workflow-update handler got a foreign payload".to_string(),
            ));
        };
        let droplet = live_droplet(&self.store, tenant_id).await?;
        let base_url = sidecar_base_url(&droplet);
        self.sidecar
            .deploy_workflow(&base_url, workflow_name, workflow_body, version)
            .await?;

        let component = format!("workflow:{}", workflow_name);
        let previous = self
            .store
            .current_version(tenant_id, &component)
            .await?
            .map(|e| e.version);
        self.store
            .record_version(&VersionLedgerEntry {
                tenant_id: tenant_id.clone(),
                component,
                version: version.clone(),
                previous_version: previous,
                rollout_id: *rollout_id,
                recorded_at: Utc::now(),
            })
            .await?;
        info!(tenant = %tenant_id, workflow = %workflow_name, version = %version,
              "workflow deployed");
        Ok(())
    }
}

/// Blue-green sidecar image update: drain, pull, checkpoint, swap, health
/// gate. An unhealthy swap is reverted to `from_version` and fails the job
/// with a terminal, distinguishing error so the wave counts it.
pub struct SidecarUpdateHandler {
    store: Arc<dyn Store>,
    sidecar: Arc<dyn SidecarApi>,
    health_budget: Duration,
    health_cadence: Duration,
}

impl SidecarUpdateHandler {
    pub fn new(store: Arc<dyn Store>, sidecar: Arc<dyn SidecarApi>) -> Self {
        Self {
            store,
            sidecar,
            health_budget: Duration::from_secs(60),
            health_cadence: Duration::from_secs(2),
        }
    }

    pub fn with_health_poll(mut self, budget: Duration, cadence: Duration) -> Self {
        self.health_budget = budget;
        self.health_cadence = cadence;
        self
    }
}

#[async_trait]
impl JobHandler for SidecarUpdateHandler {
    async fn handle(&self, job: &Job) -> ControlResult<()> {
        let JobPayload::SidecarUpdate {
            tenant_id,
            droplet_id,
            from_version,
            to_version,
            rollout_id,
            ..
        } = &job.payload
        else {
            return Err(ControlError::ValidationFailed(
                "sidecar-update handler got a foreign payload".to_string(),
            ));
        };
        let droplet = live_droplet(&self.store, tenant_id).await?;
        let base_url = sidecar_base_url(&droplet);

        self.sidecar.prepare_update(&base_url).await?;
        self.sidecar.pull_image(&base_url, to_version).await?;
        self.sidecar.checkpoint(&base_url).await?;
        self.sidecar.swap_container(&base_url, to_version).await?;

        if let Err(err) = wait_healthy(
            self.sidecar.as_ref(),
            &base_url,
            self.health_budget,
            self.health_cadence,
        )
        .await
        {
            if let Err(revert_err) = self.sidecar.swap_container(&base_url, from_version).await {
                error!(tenant = %tenant_id, droplet = %droplet_id, error = %revert_err,
                       "swap-back failed, droplet left on new version");
            }
            return Err(ControlError::UpdateReverted {
                droplet_id: *droplet_id,
                detail: format!(
                    "health check failed after swap to {}: {}",
                    to_version, err
                ),
            });
        }

        self.store
            .record_version(&VersionLedgerEntry {
                tenant_id: tenant_id.clone(),
                component: "sidecar".to_string(),
                version: to_version.clone(),
                previous_version: Some(from_version.clone()),
                rollout_id: *rollout_id,
                recorded_at: Utc::now(),
            })
            .await?;
        self.store
            .update_droplet_versions(tenant_id, Some(to_version), None)
            .await?;
        info!(tenant = %tenant_id, droplet = %droplet_id,
              from = %from_version, to = %to_version, "sidecar updated");
        Ok(())
    }
}

/// Push each encrypted credential, verify it through the type-specific
/// endpoint, and journal an immutable `credential_updates` row. The
/// sidecar overwrites same-type credentials, which is what makes
/// redelivery safe.
pub struct CredentialInjectHandler {
    store: Arc<dyn Store>,
    sidecar: Arc<dyn SidecarApi>,
}

impl CredentialInjectHandler {
    pub fn new(store: Arc<dyn Store>, sidecar: Arc<dyn SidecarApi>) -> Self {
        Self { store, sidecar }
    }
}

#[async_trait]
impl JobHandler for CredentialInjectHandler {
    async fn handle(&self, job: &Job) -> ControlResult<()> {
        let JobPayload::CredentialInject {
            tenant_id,
            droplet_id,
            credentials,
            rollout_id,
            ..
        } = &job.payload
        else {
            return Err(ControlError::ValidationFailed(
                "credential-inject handler got a foreign payload".to_string(),
            ));
        };
        let droplet = live_droplet(&self.store, tenant_id).await?;
        let base_url = sidecar_base_url(&droplet);

        for blob in credentials {
            self.sidecar.inject_credential(&base_url, blob).await?;
            let verified = self
                .sidecar
                .verify_credential(&base_url, &blob.credential_type)
                .await?;
            if !verified {
                return Err(ControlError::ValidationFailed(format!(
                    "credential type {} failed verification on droplet {}",
                    blob.credential_type, droplet_id
                )));
            }
            self.store
                .record_credential_update(&CredentialUpdate {
                    tenant_id: tenant_id.clone(),
                    droplet_id: *droplet_id,
                    credential_type: blob.credential_type.clone(),
                    fingerprint: CredentialUpdate::fingerprint_of(blob),
                    rollout_id: *rollout_id,
                    at: Utc::now(),
                })
                .await?;
        }

        self.store
            .update_droplet_versions(tenant_id, None, Some(&bundle_fingerprint(credentials)))
            .await?;
        info!(tenant = %tenant_id, droplet = %droplet_id,
              credentials = credentials.len(), "credentials injected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_adapters::testing::MockSidecar;
    use genesis_store::MemoryStore;
    use genesis_types::{
        derive_public_dns, AccountId, BackoffPolicy, CredentialBlob, DropletId, DropletState,
        JobId, QueueName,
    };

    fn droplet(tenant: &str, id: u64) -> DropletHealth {
        let ip = format!("203.0.113.{}", id % 250);
        DropletHealth {
            tenant_id: TenantId::from(tenant),
            droplet_id: DropletId(id),
            account_id: AccountId::new("acct-1"),
            region: "nyc3".into(),
            size_slug: "s-2vcpu-4gb".into(),
            public_dns: derive_public_dns(&ip),
            public_ip: ip,
            state: DropletState::ActiveHealthy,
            last_heartbeat: None,
            cpu_pct: 0.0,
            mem_pct: 0.0,
            disk_pct: 0.0,
            engine_healthy: true,
            sidecar_version: Some("v1".into()),
            credential_fingerprint: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn job(payload: JobPayload) -> Job {
        Job {
            id: JobId::new(),
            queue: payload.default_queue(),
            priority: 2,
            attempts: 0,
            max_attempts: 3,
            backoff: BackoffPolicy::fixed(10),
            idempotency_key: None,
            replay_of: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            payload,
        }
    }

    async fn world() -> (Arc<MemoryStore>, Arc<MockSidecar>, String) {
        let store = Arc::new(MemoryStore::new());
        let sidecar = Arc::new(MockSidecar::new());
        let d = droplet("t-1", 42);
        let base = sidecar_base_url(&d);
        store.create_droplet(&d, "test", "test").await.unwrap();
        (store, sidecar, base)
    }

    #[tokio::test]
    async fn workflow_update_deploys_and_records_ledger() {
        let (store, sidecar, base) = world().await;
        let handler = WorkflowUpdateHandler::new(store.clone(), sidecar.clone());
        let payload = JobPayload::WorkflowUpdate {
            tenant_id: TenantId::from("t-1"),
            workflow_name: "lead-warmup".into(),
            workflow_body: serde_json::json!({"nodes": []}),
            version: "v7".into(),
            rollout_id: None,
            wave_number: None,
        };
        handler.handle(&job(payload)).await.unwrap();

        let deployed = sidecar.state.lock().deployed.clone();
        assert_eq!(deployed, vec![(base, "lead-warmup".to_string(), "v7".to_string())]);
        let entry = store
            .current_version(&TenantId::from("t-1"), "workflow:lead-warmup")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.version, "v7");
        assert_eq!(entry.previous_version, None);
    }

    #[tokio::test]
    async fn sidecar_update_walks_blue_green_steps_in_order() {
        let (store, sidecar, base) = world().await;
        let handler = SidecarUpdateHandler::new(store.clone(), sidecar.clone())
            .with_health_poll(Duration::from_millis(200), Duration::from_millis(20));
        let payload = JobPayload::SidecarUpdate {
            tenant_id: TenantId::from("t-1"),
            droplet_id: DropletId(42),
            from_version: "v1".into(),
            to_version: "v2".into(),
            rollout_id: None,
            wave_number: None,
        };
        handler.handle(&job(payload)).await.unwrap();

        {
            let state = sidecar.state.lock();
            assert_eq!(state.prepared, vec![base.clone()]);
            assert_eq!(state.pulled, vec![(base.clone(), "v2".to_string())]);
            assert_eq!(state.checkpoints, vec![base.clone()]);
        }
        assert_eq!(sidecar.swapped_versions(&base), vec!["v2".to_string()]);

        let entry = store
            .current_version(&TenantId::from("t-1"), "sidecar")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.version, "v2");
        assert_eq!(entry.previous_version.as_deref(), Some("v1"));
        let row = store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.sidecar_version.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn unhealthy_swap_reverts_and_fails_terminally() {
        let (store, sidecar, base) = world().await;
        sidecar.script_health(&base, std::iter::repeat(false).take(64));
        let handler = SidecarUpdateHandler::new(store.clone(), sidecar.clone())
            .with_health_poll(Duration::from_millis(100), Duration::from_millis(20));
        let payload = JobPayload::SidecarUpdate {
            tenant_id: TenantId::from("t-1"),
            droplet_id: DropletId(42),
            from_version: "v1".into(),
            to_version: "v2".into(),
            rollout_id: None,
            wave_number: None,
        };
        let err = handler.handle(&job(payload)).await.unwrap_err();
        assert!(matches!(err, ControlError::UpdateReverted { .. }));
        assert!(!err.is_retryable());

        // Swapped forward, then back.
        assert_eq!(
            sidecar.swapped_versions(&base),
            vec!["v2".to_string(), "v1".to_string()]
        );
        // No ledger entry for the failed update.
        assert!(store
            .current_version(&TenantId::from("t-1"), "sidecar")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn credential_inject_verifies_and_journals_each_blob() {
        let (store, sidecar, _) = world().await;
        let handler = CredentialInjectHandler::new(store.clone(), sidecar.clone());
        let blobs = vec![
            CredentialBlob {
                credential_type: "smtp".into(),
                encrypted_payload: "enc-a".into(),
            },
            CredentialBlob {
                credential_type: "oauth".into(),
                encrypted_payload: "enc-b".into(),
            },
        ];
        let payload = JobPayload::CredentialInject {
            tenant_id: TenantId::from("t-1"),
            droplet_id: DropletId(42),
            credentials: blobs.clone(),
            rollout_id: None,
            wave_number: None,
        };
        handler.handle(&job(payload)).await.unwrap();

        let updates = store
            .credential_updates(&TenantId::from("t-1"))
            .await
            .unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].credential_type, "smtp");
        // Fingerprints are hashes of the blob, never the blob.
        assert_ne!(updates[0].fingerprint, "enc-a");
        let row = store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            row.credential_fingerprint.as_deref(),
            Some(bundle_fingerprint(&blobs).as_str())
        );
    }

    #[tokio::test]
    async fn failed_verification_is_terminal() {
        let (store, sidecar, _) = world().await;
        sidecar
            .state
            .lock()
            .verify_results
            .insert("smtp".to_string(), false);
        let handler = CredentialInjectHandler::new(store.clone(), sidecar);
        let payload = JobPayload::CredentialInject {
            tenant_id: TenantId::from("t-1"),
            droplet_id: DropletId(42),
            credentials: vec![CredentialBlob {
                credential_type: "smtp".into(),
                encrypted_payload: "enc".into(),
            }],
            rollout_id: None,
            wave_number: None,
        };
        let err = handler.handle(&job(payload)).await.unwrap_err();
        assert!(matches!(err, ControlError::ValidationFailed(_)));
        assert!(store
            .credential_updates(&TenantId::from("t-1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn handlers_cover_their_queues() {
        // Routing sanity for the wiring layer.
        assert_eq!(
            JobPayload::WorkflowUpdate {
                tenant_id: TenantId::from("t"),
                workflow_name: "w".into(),
                workflow_body: serde_json::Value::Null,
                version: "v".into(),
                rollout_id: None,
                wave_number: None,
            }
            .default_queue(),
            QueueName::WorkflowUpdate
        );
    }
}
