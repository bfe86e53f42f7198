// genesis-provision: Provisioning factory
//
// Creates a droplet for a tenant with compensating-transaction semantics:
// account claim, secret generation, cloud-init render, VM create, journal +
// droplet-health insert. Any failure after the claim runs the rollback
// chain (delete VM if minted, release the account slot, orphan the record)
// without masking the original error.

pub mod cloud_init;
pub mod factory;
pub mod handlers;
pub mod secrets;

pub use factory::{ProvisionRequest, ProvisioningFactory};
pub use handlers::IgnitionHandler;
pub use secrets::SecretSet;
