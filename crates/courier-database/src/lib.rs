//! SQLite storage for courier.
//!
//! This crate provides:
//! - An async executor with a dedicated SQLite thread ([`AsyncDatabase`])
//! - Explicit transactions ([`UnitOfWork`]) for writes that must commit together
//! - Schema migrations with storage-level guards (unique dedupe keys,
//!   monotonic counters, legal status transitions, retained rows)
//! - Row models and standalone query functions in [`queries`]
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let counts = db
//!     .call(|conn| queries::count_outbox_by_status(conn, Some("org-a")))
//!     .await?;
//! ```

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::{run_in_transaction, AsyncDatabase, UnitOfWork};
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;
