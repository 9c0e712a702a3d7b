//! # Observability
//!
//! Tracing subscriber setup for the courier processes.
//!
//! Components only ever use `tracing` macros. The binary calls
//! [`init_with_config`] once at startup and decides where events go:
//!
//! - [`LogFormat::Compact`]: human readable lines on stderr.
//! - [`LogFormat::Json`]: one JSON object per line appended to `log_path`,
//!   optionally mirrored to stderr.
//!
//! Delivery and replay code logs with `org_id` and `event_id` fields. The JSON
//! layer lifts `org_id` to a top-level key so a tenant's activity can be
//! filtered with `jq 'select(.org_id == "...")'`.
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "courier".into(),
//!     default_level: "debug".into(),
//!     format: observability::LogFormat::Json,
//!     log_path: Some("/var/lib/courier/logs/courier.jsonl".into()),
//!     ..Default::default()
//! })?;
//! ```

mod file;
mod json_layer;

use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use file::AppendLogWriter;
pub use json_layer::{JsonLayer, LogEntry};

/// Output encoding for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    /// Parse a format name, falling back to compact for anything unrecognised.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" | "jsonl" => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the process, written to every JSON line.
    pub service_name: String,

    /// Default filter directive. `RUST_LOG` wins when set.
    pub default_level: String,

    /// Output encoding.
    pub format: LogFormat,

    /// JSONL destination. Required for [`LogFormat::Json`].
    pub log_path: Option<PathBuf>,

    /// Mirror JSON output to stderr in compact form.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "courier".into(),
            default_level: "info".into(),
            format: LogFormat::Compact,
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Errors raised while installing the subscriber.
#[derive(Error, Debug)]
pub enum ObservabilityError {
    #[error("JSON log format requires a log path")]
    MissingLogPath,

    #[error("failed to open log file {path}: {source}")]
    OpenLogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber described by `config`.
pub fn init_with_config(config: LogConfig) -> Result<(), ObservabilityError> {
    match config.format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(env_filter(&config.default_level))
            .with_target(true)
            .compact()
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| ObservabilityError::AlreadyInstalled(e.to_string())),
        LogFormat::Json => {
            let path = config
                .log_path
                .clone()
                .ok_or(ObservabilityError::MissingLogPath)?;
            let writer = AppendLogWriter::open(&path).map_err(|source| {
                ObservabilityError::OpenLogFile {
                    path: path.clone(),
                    source,
                }
            })?;

            let json_layer = JsonLayer::new(config.service_name.clone(), writer)
                .with_filter(env_filter(&config.default_level));

            let stderr_layer = config.also_stderr.then(|| {
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_filter(env_filter(&config.default_level))
            });

            tracing_subscriber::registry()
                .with(json_layer)
                .with(stderr_layer)
                .try_init()
                .map_err(|e| ObservabilityError::AlreadyInstalled(e.to_string()))?;

            tracing::info!(log_path = %path.display(), "json logging initialized");
            Ok(())
        }
    }
}

pub use tracing::{debug, error, info, instrument, trace, warn};
