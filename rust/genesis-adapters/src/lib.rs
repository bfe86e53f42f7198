// genesis-adapters: Outbound HTTP adapters
//
// Two clients the workers call through: the provider-agnostic cloud API
// (VM lifecycle, bounded retry, Retry-After honoured) and the per-droplet
// sidecar agent (workflow deploy, credential inject, blue-green lifecycle,
// health). Both surface failures as control-plane error kinds.

pub mod cloud;
pub mod retry;
pub mod sidecar;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cloud::{
    CloudApi, CreateVmRequest, CreatedVm, DryRunCloudApi, GovernedCloud, HttpCloudApi, VmStatus,
};
pub use retry::{with_retry, RetryPolicy};
pub use sidecar::{wait_healthy, HttpSidecarClient, SidecarApi};
