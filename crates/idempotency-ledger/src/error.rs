//! Ledger error types.

use courier_database::DatabaseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    #[error("Missing org context")]
    MissingOrg,

    /// The pending claim was released, swept, or taken over by another request.
    #[error("Claim for key {0} is no longer held")]
    ClaimLost(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
