//! Outbox error types.

use courier_core::CoreError;
use courier_database::DatabaseError;
use thiserror::Error;

use crate::url_policy::UrlRejection;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Unknown event kind or export mode.
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Target URL rejected: {0}")]
    UrlRejected(#[from] UrlRejection),

    #[error("Event not found: {0}")]
    NotFound(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type OutboxResult<T> = Result<T, OutboxError>;
