//! Transactional outbox for side effects.
//!
//! Business code records an email or webhook with [`OutboxStore::enqueue`]
//! inside its own [`UnitOfWork`](courier_database::UnitOfWork); the event
//! commits with the business rows or not at all. A [`DeliveryProcessor`]
//! later claims pending rows, calls the adapter registered for each kind, and
//! records the outcome. Rows that keep failing end up `dead` after
//! `max_attempts`, where the dead-letter replay picks them up.
//!
//! Exports are the same machinery for HTTP pushes to customer-owned targets.
//!
//! ```ignore
//! let store = OutboxStore::new(policy.clone());
//! db.transaction(move |uow| {
//!     insert_booking(uow, &booking)?;
//!     store.enqueue(uow, EnqueueRequest { org_id, kind: EventKind::Email, payload, dedupe_key })
//! })
//! .await?;
//! ```

mod adapters;
mod error;
mod metrics;
mod payload;
mod processor;
mod sender;
mod store;
mod url_policy;
mod worker;

pub use adapters::{
    AdapterError, AdapterSet, DeliveryOutcome, EmailSender, WebhookReceipt, WebhookSender,
};
pub use error::{OutboxError, OutboxResult};
pub use metrics::DELIVERIES;
pub use payload::{decode_payload, DeliveryPayload, EmailPayload, WebhookPayload};
pub use processor::{DeliveryProcessor, ProcessReport};
pub use sender::HttpWebhookSender;
pub use store::{EnqueueRequest, ExportRequest, OutboxStore, MANUAL_REQUEUE_ACTION};
pub use url_policy::{
    host_of, HostResolver, SystemResolver, UrlPolicy, UrlRejection, UrlValidator,
};
pub use worker::DeliveryWorker;
