// genesis-watchdog: Fleet health services
//
// The watchdog sweep (zombie detection, resource alerts, fail-open
// degradation), the heartbeat processor (pub/sub ingest, last-writer-wins
// buffer, batched flush), the scale-alerts sampler, and the remediation
// handlers for the reboot/health/metric queues.

pub mod heartbeat;
pub mod remediation;
pub mod scale_alerts;
pub mod status;
pub mod watchdog;

pub use heartbeat::HeartbeatProcessor;
pub use remediation::{HealthProbeHandler, MetricSnapshotHandler, RebootHandler};
pub use scale_alerts::ScaleAlerts;
pub use status::{new_status, AlertSeverity, AlertSink, LogAlertSink, MemoryAlertSink, ServiceStatus, ServiceStatusHandle};
pub use watchdog::Watchdog;
