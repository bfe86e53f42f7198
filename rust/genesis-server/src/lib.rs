// genesis-server: Process root
//
// Wires settings into a running control plane: backends, governor, bus,
// worker pools, background services, the `/health` surface, and graceful
// shutdown.

pub mod app;
pub mod health;

pub use app::ControlPlane;
pub use health::{router, HealthReport, HealthState};
