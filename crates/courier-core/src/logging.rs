//! Logging initialization.
//!
//! Compact stderr output by default. `COURIER_LOG_FORMAT=json` switches to
//! JSONL at `COURIER_LOG_FILE` (or `<base>/logs/courier.jsonl`), mirrored to
//! stderr.

use crate::{CoreResult, Paths};
use observability::{LogConfig, LogFormat};
use std::path::PathBuf;

/// Install the process-wide subscriber.
///
/// `level` is the default filter; `RUST_LOG` still takes precedence.
pub fn init_logging(level: &str, paths: &Paths) -> CoreResult<()> {
    let config = log_config(level, paths, |name| std::env::var(name).ok());
    observability::init_with_config(config)?;
    Ok(())
}

fn log_config(level: &str, paths: &Paths, lookup: impl Fn(&str) -> Option<String>) -> LogConfig {
    let format = lookup("COURIER_LOG_FORMAT")
        .map(|raw| LogFormat::parse(&raw))
        .unwrap_or_default();

    let log_path = match format {
        LogFormat::Json => Some(
            lookup("COURIER_LOG_FILE")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| paths.log_file()),
        ),
        LogFormat::Compact => None,
    };

    LogConfig {
        service_name: "courier".into(),
        default_level: level.into(),
        format,
        log_path,
        also_stderr: true,
    }
}
