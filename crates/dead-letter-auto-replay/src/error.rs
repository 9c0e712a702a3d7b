//! Replay error types.

use courier_database::DatabaseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid org id: {0:?}")]
    InvalidOrg(String),
}

pub type ReplayResult<T> = Result<T, ReplayError>;
