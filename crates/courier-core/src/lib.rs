//! Shared types, configuration, and utilities for courier.

mod config;
mod error;
mod kinds;
mod logging;
mod paths;

pub use config::{
    AutoReplayConfig, Config, IdempotencyConfig, OutboxConfig, ReplayPriority, UrlPolicyConfig,
    DEFAULT_LOG_LEVEL,
};
pub use error::{CoreError, CoreResult};
pub use kinds::{EventKind, ExportMode};
pub use logging::init_logging;
pub use paths::Paths;
