//! Mock adapters for downstream crate tests
//!
//! Deterministic, scriptable stand-ins for the cloud API and the sidecar.
//! Call history is recorded so tests can assert exact side-effect counts
//! (one delete on rollback, one swap-back on failed update, ...).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use genesis_types::{CloudAccount, ControlError, ControlResult, CredentialBlob, DropletId};
use parking_lot::Mutex;

use crate::cloud::{CloudApi, CreateVmRequest, CreatedVm, VmStatus};
use crate::sidecar::SidecarApi;

/// Pool account fixture.
pub fn test_account(id: &str, region: &str, max_droplets: u32) -> CloudAccount {
    use genesis_types::{AccountId, AccountStatus, Secret};
    CloudAccount {
        id: AccountId::new(id),
        api_token: Secret::new(format!("token-{}", id)),
        region: region.to_string(),
        max_droplets,
        current_droplets: 0,
        status: AccountStatus::Active,
        created_at: chrono::Utc::now(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    Create(String),
    Delete(DropletId),
    PowerOn(DropletId),
    PowerOff(DropletId),
    PowerCycle(DropletId),
    GetVm(DropletId),
}

pub struct MockCloudApi {
    next_id: AtomicU64,
    calls: Mutex<Vec<CloudCall>>,
    fail_create: AtomicBool,
    statuses: Mutex<HashMap<DropletId, VmStatus>>,
}

impl MockCloudApi {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(9_000),
            calls: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_status(&self, id: DropletId, status: VmStatus) {
        self.statuses.lock().insert(id, status);
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&CloudCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: CloudCall) {
        self.calls.lock().push(call);
    }
}

impl Default for MockCloudApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudApi for MockCloudApi {
    async fn create_vm(
        &self,
        _account: &CloudAccount,
        req: &CreateVmRequest,
    ) -> ControlResult<CreatedVm> {
        self.record(CloudCall::Create(req.name.clone()));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ControlError::CloudApi {
                status: Some(500),
                message: "provider returned 500 Internal Server Error".into(),
                retry_after_ms: None,
            });
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(CreatedVm {
            id: DropletId(n),
            public_ipv4: format!("198.51.100.{}", n % 250 + 1),
        })
    }

    async fn delete_vm(&self, _account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        self.record(CloudCall::Delete(id));
        Ok(())
    }

    async fn power_on(&self, _account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        self.record(CloudCall::PowerOn(id));
        self.statuses.lock().insert(id, VmStatus::Active);
        Ok(())
    }

    async fn power_off(&self, _account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        self.record(CloudCall::PowerOff(id));
        self.statuses.lock().insert(id, VmStatus::Off);
        Ok(())
    }

    async fn power_cycle(&self, _account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        self.record(CloudCall::PowerCycle(id));
        self.statuses.lock().insert(id, VmStatus::Active);
        Ok(())
    }

    async fn get_vm(&self, _account: &CloudAccount, id: DropletId) -> ControlResult<VmStatus> {
        self.record(CloudCall::GetVm(id));
        Ok(self
            .statuses
            .lock()
            .get(&id)
            .copied()
            .unwrap_or(VmStatus::Active))
    }
}

#[derive(Default)]
pub struct SidecarState {
    pub deployed: Vec<(String, String, String)>,
    pub injected: Vec<(String, String)>,
    pub prepared: Vec<String>,
    pub checkpoints: Vec<String>,
    pub pulled: Vec<(String, String)>,
    pub swapped: Vec<(String, String)>,
    pub stopped: Vec<String>,
    /// Scripted health responses per base URL; empty means healthy.
    pub health_script: HashMap<String, VecDeque<bool>>,
    /// Scripted verify outcomes per credential type; missing means true.
    pub verify_results: HashMap<String, bool>,
    pub fail_deploy: bool,
    pub fail_inject: bool,
    pub fail_stop: bool,
}

#[derive(Default)]
pub struct MockSidecar {
    pub state: Mutex<SidecarState>,
}

impl MockSidecar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_health(&self, base_url: &str, responses: impl IntoIterator<Item = bool>) {
        self.state
            .lock()
            .health_script
            .insert(base_url.to_string(), responses.into_iter().collect());
    }

    pub fn swapped_versions(&self, base_url: &str) -> Vec<String> {
        self.state
            .lock()
            .swapped
            .iter()
            .filter(|(b, _)| b == base_url)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[async_trait]
impl SidecarApi for MockSidecar {
    async fn deploy_workflow(
        &self,
        base_url: &str,
        workflow_name: &str,
        _workflow_json: &serde_json::Value,
        version: &str,
    ) -> ControlResult<()> {
        let mut state = self.state.lock();
        if state.fail_deploy {
            return Err(ControlError::SidecarUnreachable("deploy refused".into()));
        }
        state.deployed.push((
            base_url.to_string(),
            workflow_name.to_string(),
            version.to_string(),
        ));
        Ok(())
    }

    async fn inject_credential(
        &self,
        base_url: &str,
        credential: &CredentialBlob,
    ) -> ControlResult<()> {
        let mut state = self.state.lock();
        if state.fail_inject {
            return Err(ControlError::SidecarUnreachable("inject refused".into()));
        }
        state
            .injected
            .push((base_url.to_string(), credential.credential_type.clone()));
        Ok(())
    }

    async fn verify_credential(
        &self,
        _base_url: &str,
        credential_type: &str,
    ) -> ControlResult<bool> {
        Ok(self
            .state
            .lock()
            .verify_results
            .get(credential_type)
            .copied()
            .unwrap_or(true))
    }

    async fn prepare_update(&self, base_url: &str) -> ControlResult<()> {
        self.state.lock().prepared.push(base_url.to_string());
        Ok(())
    }

    async fn checkpoint(&self, base_url: &str) -> ControlResult<()> {
        self.state.lock().checkpoints.push(base_url.to_string());
        Ok(())
    }

    async fn pull_image(&self, base_url: &str, version: &str) -> ControlResult<()> {
        self.state
            .lock()
            .pulled
            .push((base_url.to_string(), version.to_string()));
        Ok(())
    }

    async fn swap_container(&self, base_url: &str, version: &str) -> ControlResult<()> {
        self.state
            .lock()
            .swapped
            .push((base_url.to_string(), version.to_string()));
        Ok(())
    }

    async fn health(&self, base_url: &str) -> ControlResult<bool> {
        let mut state = self.state.lock();
        match state.health_script.get_mut(base_url) {
            Some(script) => Ok(script.pop_front().unwrap_or(true)),
            None => Ok(true),
        }
    }

    async fn stop_engine(&self, base_url: &str) -> ControlResult<()> {
        let mut state = self.state.lock();
        if state.fail_stop {
            return Err(ControlError::SidecarUnreachable("stop refused".into()));
        }
        state.stopped.push(base_url.to_string());
        Ok(())
    }
}
