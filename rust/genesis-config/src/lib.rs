// genesis-config: Environment configuration
//
// Read once at process start. Missing required variables fail fast; every
// optional knob has the documented default.

pub mod settings;
pub mod topology;

pub use settings::{
    ConfigError, DlqSettings, GovernorSettings, HibernationSettings, Settings,
};
pub use topology::{QueueConfig, QueueTopology};
