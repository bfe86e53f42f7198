// genesis-bus: Job bus and worker runtime
//
// Typed submission with idempotent dedup, priority dispatch, bounded retry
// with per-queue backoff, atomic dead-lettering with replay, an internal
// event stream, and the per-queue worker pools that execute handlers inside
// governor acquisitions.

pub mod bus;
pub mod dlq;
pub mod events;
pub mod worker;

pub use bus::{AddOpts, JobBus};
pub use dlq::DlqEntry;
pub use events::JobEvent;
pub use worker::{JobHandler, WorkerCounters, WorkerPool, WorkerRegistry};
