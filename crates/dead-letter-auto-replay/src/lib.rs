//! Dead-letter auto-replay.
//!
//! Periodically re-attempts dead outbox events and exports that look
//! recoverable, bounded per org by a budget and a failure-streak breaker.
//! Every attempt is audited as `dlq_auto_replay` by the `system` actor.

mod audit;
mod error;
mod metrics;
mod scheduler;
mod worker;

pub use audit::{AuditTrail, AUTO_REPLAY_ACTION, SYSTEM_ACTOR};
pub use error::{ReplayError, ReplayResult};
pub use metrics::{BREAKER_TRIPS, DLQ_DEPTH, REPLAY_OUTCOMES};
pub use scheduler::{AutoReplayScheduler, ReplayReport, REPLAYED_BY};
pub use worker::ReplayWorker;
