// genesis-hibernate: Hibernation and wake control
//
// Eligibility evaluation, the strictly ordered hibernate and wake flows
// (every step checkpointed before the next begins), staggered wake
// scheduling under the provider's mutation-rate ceiling, and predictive
// pre-warming for high-priority tenants.

pub mod controller;
pub mod eligibility;
pub mod predictive;
pub mod stagger;
pub mod sweep;

pub use controller::{HibernationController, WakeDropletHandler};
pub use eligibility::{check_eligibility, Eligibility};
pub use predictive::PredictiveWarmer;
pub use stagger::{plan_staggered_wakes, ScheduledWake, WakePlan, WakeRequest};
pub use sweep::HibernationSweep;
