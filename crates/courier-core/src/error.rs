//! Core error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Home directory could not be resolved.
    #[error("Path error: {0}")]
    Path(String),

    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error("Unknown export mode: {0}")]
    UnknownExportMode(String),

    #[error("Logging error: {0}")]
    Logging(#[from] observability::ObservabilityError),
}

/// Result type alias using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
