//! Request idempotency for write endpoints.
//!
//! Clients send an `Idempotency-Key` header. The first request with a given
//! key runs; retries with the same body get the stored response without the
//! handler running again, and reuse of the key with a different body is
//! rejected.
//!
//! ```ignore
//! let ledger = IdempotencyLedger::new(db, config.idempotency.clone());
//! let app = Router::new()
//!     .route("/bookings", post(create_booking))
//!     .layer(middleware::from_fn_with_state(ledger, idempotency_middleware))
//!     .layer(middleware::from_fn(authenticate)); // inserts OrgId
//! ```

mod error;
mod fingerprint;
mod http;
mod ledger;
mod worker;

pub use error::{LedgerError, LedgerResult};
pub use fingerprint::{canonical_body, fingerprint};
pub use http::{idempotency_middleware, OrgId, REPLAYED_HEADER};
pub use ledger::{validate_key, ClaimOutcome, IdempotencyLedger, SweepReport, MAX_KEY_LENGTH};
pub use worker::LedgerSweeper;
