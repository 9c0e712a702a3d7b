//! Query helpers.
//!
//! Every function takes a plain `&Connection`. Pass a
//! [`UnitOfWork`](crate::UnitOfWork) (it derefs to `Connection`) when the
//! statement must be atomic with other writes.

mod audit;
mod dead_letter;
mod exports;
mod idempotency;
mod outbox;

pub use audit::*;
pub use dead_letter::*;
pub use exports::*;
pub use idempotency::*;
pub use outbox::*;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use std::str::FromStr;

/// Short-lived ownership of a set of rows.
///
/// Rows claimed with a lease carry `claim_token` and `claimed_until`. Other
/// claimers skip them until the lease runs out, so a crashed process never
/// strands rows.
#[derive(Debug, Clone)]
pub struct ClaimLease {
    pub token: String,
    pub now: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl ClaimLease {
    pub fn new(token: impl Into<String>, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            token: token.into(),
            now,
            until: now + ttl,
        }
    }
}

/// Stored timestamp format. Fixed width so text comparison is chronological.
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, ty: Type, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(e))
}

fn parse_datetime(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, Type::Text, e))
}

fn parse_opt_datetime(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_datetime(idx, s)).transpose()
}

fn parse_column<T>(idx: usize, s: String) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.parse::<T>().map_err(|e| conversion_error(idx, Type::Text, e))
}

fn parse_json(idx: usize, s: String) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, Type::Text, e))
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::migrations::run_migrations;
    use chrono::{DateTime, TimeZone, Utc};
    use rusqlite::Connection;

    pub fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, minute, 0).unwrap()
    }
}
