// genesis-fleet: Fleet update engine
//
// Wave-based rollouts (canary, staged percentages, 100%) with health-gated
// promotion, operator pause/resume/skip/abort, version-ledger recording,
// and reverse rollouts for rollback. Also hosts the job handlers the
// engine's emissions run through: workflow deploy, blue-green sidecar
// update, credential injection.

pub mod engine;
pub mod handlers;
pub mod plan;

pub use engine::{FleetUpdateEngine, GateThresholds, RollbackScope, RolloutSpec};
pub use handlers::{CredentialInjectHandler, SidecarUpdateHandler, WorkflowUpdateHandler};
pub use plan::partition_waves;
