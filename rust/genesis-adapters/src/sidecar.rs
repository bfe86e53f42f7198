//! Per-droplet sidecar client
//!
//! HTTPS client to the on-droplet agent. Base URLs are resolved per call
//! from droplet-health (the sidecar moves when a droplet is recreated).
//! Transport failures and non-2xx responses surface as
//! `SIDECAR_UNREACHABLE`, which is retryable and feeds the breaker.

use std::time::Duration;

use async_trait::async_trait;
use genesis_types::{ControlError, ControlResult, CredentialBlob};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Health endpoint gets a tighter timeout than mutation calls.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Operations the control plane drives on a droplet's sidecar.
#[async_trait]
pub trait SidecarApi: Send + Sync {
    async fn deploy_workflow(
        &self,
        base_url: &str,
        workflow_name: &str,
        workflow_json: &serde_json::Value,
        version: &str,
    ) -> ControlResult<()>;

    async fn inject_credential(
        &self,
        base_url: &str,
        credential: &CredentialBlob,
    ) -> ControlResult<()>;

    async fn verify_credential(
        &self,
        base_url: &str,
        credential_type: &str,
    ) -> ControlResult<bool>;

    /// Drain in-flight engine operations ahead of an update.
    async fn prepare_update(&self, base_url: &str) -> ControlResult<()>;

    /// Snapshot engine state to disk.
    async fn checkpoint(&self, base_url: &str) -> ControlResult<()>;

    /// Pull the sidecar image for `version` onto the droplet.
    async fn pull_image(&self, base_url: &str, version: &str) -> ControlResult<()>;

    /// Swap the running container to `version` (blue-green).
    async fn swap_container(&self, base_url: &str, version: &str) -> ControlResult<()>;

    /// True when the container is up and answering.
    async fn health(&self, base_url: &str) -> ControlResult<bool>;

    /// Ask the engine to stop gracefully (hibernation path).
    async fn stop_engine(&self, base_url: &str) -> ControlResult<()>;
}

/// Poll `health` until it reports true or the budget elapses.
pub async fn wait_healthy(
    api: &dyn SidecarApi,
    base_url: &str,
    budget: Duration,
    cadence: Duration,
) -> ControlResult<()> {
    let deadline = Instant::now() + budget;
    loop {
        match api.health(base_url).await {
            Ok(true) => return Ok(()),
            Ok(false) => debug!(base_url, "sidecar up but not healthy yet"),
            Err(err) => debug!(base_url, error = %err, "sidecar health probe failed"),
        }
        if Instant::now() + cadence > deadline {
            return Err(ControlError::Timeout(format!(
                "sidecar at {} not healthy within {:?}",
                base_url, budget
            )));
        }
        sleep(cadence).await;
    }
}

#[derive(Deserialize)]
struct VerifyResponse {
    verified: bool,
}

pub struct HttpSidecarClient {
    client: reqwest::Client,
    health_client: reqwest::Client,
}

impl HttpSidecarClient {
    pub fn new(timeout: Duration) -> ControlResult<Self> {
        let build = |t: Duration| {
            reqwest::Client::builder()
                .timeout(t)
                .build()
                .map_err(|e| ControlError::SidecarUnreachable(format!("client build: {}", e)))
        };
        Ok(Self {
            client: build(timeout)?,
            health_client: build(HEALTH_TIMEOUT)?,
        })
    }

    fn unreachable(err: reqwest::Error) -> ControlError {
        ControlError::SidecarUnreachable(if err.is_timeout() {
            "request timed out".to_string()
        } else if err.is_connect() {
            "connection failed".to_string()
        } else {
            "transport failure".to_string()
        })
    }

    async fn post_ok(
        &self,
        base_url: &str,
        path: &str,
        body: &serde_json::Value,
    ) -> ControlResult<()> {
        let response = self
            .client
            .post(format!("{}{}", base_url, path))
            .json(body)
            .send()
            .await
            .map_err(Self::unreachable)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ControlError::SidecarUnreachable(format!(
                "{} returned {}",
                path,
                response.status()
            )))
        }
    }
}

#[async_trait]
impl SidecarApi for HttpSidecarClient {
    async fn deploy_workflow(
        &self,
        base_url: &str,
        workflow_name: &str,
        workflow_json: &serde_json::Value,
        version: &str,
    ) -> ControlResult<()> {
        self.post_ok(
            base_url,
            "/api/workflows/deploy",
            &json!({
                "workflow_name": workflow_name,
                "workflow_json": workflow_json,
                "version": version,
            }),
        )
        .await
    }

    async fn inject_credential(
        &self,
        base_url: &str,
        credential: &CredentialBlob,
    ) -> ControlResult<()> {
        self.post_ok(
            base_url,
            "/api/credentials/inject",
            &json!({
                "credential_type": credential.credential_type,
                "encrypted_payload": credential.encrypted_payload,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        )
        .await
    }

    async fn verify_credential(
        &self,
        base_url: &str,
        credential_type: &str,
    ) -> ControlResult<bool> {
        let response = self
            .client
            .get(format!("{}/api/credentials/verify", base_url))
            .query(&[("type", credential_type)])
            .send()
            .await
            .map_err(Self::unreachable)?;
        if !response.status().is_success() {
            return Err(ControlError::SidecarUnreachable(format!(
                "verify returned {}",
                response.status()
            )));
        }
        let body: VerifyResponse = response.json().await.map_err(Self::unreachable)?;
        Ok(body.verified)
    }

    async fn prepare_update(&self, base_url: &str) -> ControlResult<()> {
        self.post_ok(base_url, "/api/lifecycle/prepare-update", &json!({}))
            .await
    }

    async fn checkpoint(&self, base_url: &str) -> ControlResult<()> {
        self.post_ok(base_url, "/api/lifecycle/checkpoint", &json!({}))
            .await
    }

    async fn pull_image(&self, base_url: &str, version: &str) -> ControlResult<()> {
        self.post_ok(
            base_url,
            "/api/lifecycle/pull-image",
            &json!({ "version": version }),
        )
        .await
    }

    async fn swap_container(&self, base_url: &str, version: &str) -> ControlResult<()> {
        self.post_ok(
            base_url,
            "/api/lifecycle/swap",
            &json!({ "version": version }),
        )
        .await
    }

    async fn health(&self, base_url: &str) -> ControlResult<bool> {
        let response = self
            .health_client
            .get(format!("{}/health", base_url))
            .send()
            .await
            .map_err(Self::unreachable)?;
        Ok(response.status().is_success())
    }

    async fn stop_engine(&self, base_url: &str) -> ControlResult<()> {
        self.post_ok(base_url, "/api/lifecycle/stop", &json!({}))
            .await
    }
}
