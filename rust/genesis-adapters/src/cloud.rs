//! Provider-agnostic cloud API adapter
//!
//! VM lifecycle against the provider's REST surface, one bearer token per
//! pool account. Calls are retried up to 3 times with exponential backoff;
//! 429 responses honour Retry-After. `GovernedCloud` layers the per-account
//! governor budget on top so the in-flight cap and the mutation rate are
//! both enforced on every call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use genesis_governor::Governor;
use genesis_types::{CloudAccount, ControlError, ControlResult, DropletId};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::retry::{with_retry, RetryPolicy};

/// Poll cadence/budget for a freshly created VM's public address.
const IP_POLL_INTERVAL: Duration = Duration::from_secs(5);
const IP_POLL_ATTEMPTS: u32 = 12;

#[derive(Debug, Clone)]
pub struct CreateVmRequest {
    pub name: String,
    pub region: String,
    pub size_slug: String,
    /// Cloud-init user data placed on the VM at boot.
    pub user_data: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedVm {
    pub id: DropletId,
    pub public_ipv4: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    New,
    Active,
    Off,
    Archive,
}

impl VmStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, VmStatus::Active)
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "active" => VmStatus::Active,
            "off" => VmStatus::Off,
            "archive" => VmStatus::Archive,
            _ => VmStatus::New,
        }
    }
}

/// VM lifecycle operations the control plane needs from any provider.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn create_vm(
        &self,
        account: &CloudAccount,
        req: &CreateVmRequest,
    ) -> ControlResult<CreatedVm>;
    async fn delete_vm(&self, account: &CloudAccount, id: DropletId) -> ControlResult<()>;
    async fn power_on(&self, account: &CloudAccount, id: DropletId) -> ControlResult<()>;
    async fn power_off(&self, account: &CloudAccount, id: DropletId) -> ControlResult<()>;
    async fn power_cycle(&self, account: &CloudAccount, id: DropletId) -> ControlResult<()>;
    async fn get_vm(&self, account: &CloudAccount, id: DropletId) -> ControlResult<VmStatus>;
}

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: DropletBody,
}

#[derive(Deserialize)]
struct DropletBody {
    id: u64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    networks: Networks,
}

#[derive(Deserialize, Default)]
struct Networks {
    #[serde(default)]
    v4: Vec<V4Network>,
}

#[derive(Deserialize)]
struct V4Network {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

impl DropletBody {
    fn public_ipv4(&self) -> Option<String> {
        self.networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.clone())
    }
}

/// REST client for the provider API.
pub struct HttpCloudApi {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpCloudApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ControlResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::CloudApi {
                status: None,
                message: format!("client construction failed: {}", e),
                retry_after_ms: None,
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> ControlResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after_ms = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1_000);
        // Response bodies may carry request echoes; only the status line is
        // kept so tokens can never leak into error text.
        Err(ControlError::CloudApi {
            status: Some(status.as_u16()),
            message: format!("provider returned {}", status),
            retry_after_ms,
        })
    }

    fn transport_err(err: reqwest::Error) -> ControlError {
        ControlError::CloudApi {
            status: None,
            message: if err.is_timeout() {
                "request timed out".to_string()
            } else {
                "transport failure".to_string()
            },
            retry_after_ms: None,
        }
    }

    async fn get_droplet(
        &self,
        account: &CloudAccount,
        id: DropletId,
    ) -> ControlResult<DropletBody> {
        let response = self
            .client
            .get(self.url(&format!("/droplets/{}", id)))
            .bearer_auth(account.api_token.expose())
            .send()
            .await
            .map_err(Self::transport_err)?;
        let response = Self::check(response).await?;
        let envelope: DropletEnvelope =
            response.json().await.map_err(Self::transport_err)?;
        Ok(envelope.droplet)
    }

    async fn action(
        &self,
        account: &CloudAccount,
        id: DropletId,
        action: &str,
    ) -> ControlResult<()> {
        with_retry(self.retry, action, || async {
            let response = self
                .client
                .post(self.url(&format!("/droplets/{}/actions", id)))
                .bearer_auth(account.api_token.expose())
                .json(&json!({ "type": action }))
                .send()
                .await
                .map_err(Self::transport_err)?;
            Self::check(response).await.map(|_| ())
        })
        .await
    }
}

#[async_trait]
impl CloudApi for HttpCloudApi {
    async fn create_vm(
        &self,
        account: &CloudAccount,
        req: &CreateVmRequest,
    ) -> ControlResult<CreatedVm> {
        let body = json!({
            "name": req.name,
            "region": req.region,
            "size": req.size_slug,
            "user_data": req.user_data,
            "tags": req.tags,
        });
        let droplet = with_retry(self.retry, "create_vm", || async {
            let response = self
                .client
                .post(self.url("/droplets"))
                .bearer_auth(account.api_token.expose())
                .json(&body)
                .send()
                .await
                .map_err(Self::transport_err)?;
            let response = Self::check(response).await?;
            let envelope: DropletEnvelope =
                response.json().await.map_err(Self::transport_err)?;
            Ok(envelope.droplet)
        })
        .await?;

        let id = DropletId(droplet.id);
        if let Some(ip) = droplet.public_ipv4() {
            return Ok(CreatedVm {
                id,
                public_ipv4: ip,
            });
        }

        // The provider allocates the address asynchronously; poll until it
        // shows up or the budget runs out.
        for _ in 0..IP_POLL_ATTEMPTS {
            tokio::time::sleep(IP_POLL_INTERVAL).await;
            let droplet = self.get_droplet(account, id).await?;
            if let Some(ip) = droplet.public_ipv4() {
                return Ok(CreatedVm {
                    id,
                    public_ipv4: ip,
                });
            }
        }
        Err(ControlError::CloudApi {
            status: None,
            message: format!("droplet {} never received a public address", id),
            retry_after_ms: None,
        })
    }

    async fn delete_vm(&self, account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        with_retry(self.retry, "delete_vm", || async {
            let response = self
                .client
                .delete(self.url(&format!("/droplets/{}", id)))
                .bearer_auth(account.api_token.expose())
                .send()
                .await
                .map_err(Self::transport_err)?;
            // Idempotent delete: a droplet already gone is success.
            if response.status().as_u16() == 404 {
                return Ok(());
            }
            Self::check(response).await.map(|_| ())
        })
        .await
    }

    async fn power_on(&self, account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        self.action(account, id, "power_on").await
    }

    async fn power_off(&self, account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        self.action(account, id, "power_off").await
    }

    async fn power_cycle(&self, account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        self.action(account, id, "power_cycle").await
    }

    async fn get_vm(&self, account: &CloudAccount, id: DropletId) -> ControlResult<VmStatus> {
        let droplet = with_retry(self.retry, "get_vm", || async {
            self.get_droplet(account, id).await
        })
        .await?;
        Ok(VmStatus::parse(&droplet.status))
    }
}

/// Wraps any [`CloudApi`] with the governor's per-account budget: in-flight
/// cap and mutation-rate window are acquired before every call and released
/// after.
pub struct GovernedCloud {
    inner: Arc<dyn CloudApi>,
    governor: Arc<Governor>,
}

impl GovernedCloud {
    pub fn new(inner: Arc<dyn CloudApi>, governor: Arc<Governor>) -> Self {
        Self { inner, governor }
    }

    async fn governed<T, Fut>(
        &self,
        account: &CloudAccount,
        fut: Fut,
    ) -> ControlResult<T>
    where
        Fut: std::future::Future<Output = ControlResult<T>>,
    {
        let guard = self.governor.acquire_account(&account.id).await?;
        let result = fut.await;
        guard.release().await?;
        result
    }
}

#[async_trait]
impl CloudApi for GovernedCloud {
    async fn create_vm(
        &self,
        account: &CloudAccount,
        req: &CreateVmRequest,
    ) -> ControlResult<CreatedVm> {
        self.governed(account, self.inner.create_vm(account, req))
            .await
    }

    async fn delete_vm(&self, account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        self.governed(account, self.inner.delete_vm(account, id))
            .await
    }

    async fn power_on(&self, account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        self.governed(account, self.inner.power_on(account, id))
            .await
    }

    async fn power_off(&self, account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        self.governed(account, self.inner.power_off(account, id))
            .await
    }

    async fn power_cycle(&self, account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        self.governed(account, self.inner.power_cycle(account, id))
            .await
    }

    async fn get_vm(&self, account: &CloudAccount, id: DropletId) -> ControlResult<VmStatus> {
        self.governed(account, self.inner.get_vm(account, id)).await
    }
}

/// No-op provider for dry runs: mints deterministic IDs and private-range
/// addresses so the control plane can be staged against production stores
/// without touching the provider.
pub struct DryRunCloudApi {
    next_id: AtomicU64,
}

impl DryRunCloudApi {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for DryRunCloudApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudApi for DryRunCloudApi {
    async fn create_vm(
        &self,
        _account: &CloudAccount,
        req: &CreateVmRequest,
    ) -> ControlResult<CreatedVm> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!(name = %req.name, id = n, "dry-run create_vm");
        Ok(CreatedVm {
            id: DropletId(n),
            public_ipv4: format!("10.0.{}.{}", (n >> 8) & 0xff, n & 0xff),
        })
    }

    async fn delete_vm(&self, _account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        warn!(%id, "dry-run delete_vm");
        Ok(())
    }

    async fn power_on(&self, _account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        info!(%id, "dry-run power_on");
        Ok(())
    }

    async fn power_off(&self, _account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        info!(%id, "dry-run power_off");
        Ok(())
    }

    async fn power_cycle(&self, _account: &CloudAccount, id: DropletId) -> ControlResult<()> {
        info!(%id, "dry-run power_cycle");
        Ok(())
    }

    async fn get_vm(&self, _account: &CloudAccount, _id: DropletId) -> ControlResult<VmStatus> {
        Ok(VmStatus::Active)
    }
}
