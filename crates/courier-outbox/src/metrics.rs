//! Delivery instruments.
//!
//! Recorded against the global meter provider; without an installed SDK they are no-ops.

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{global, KeyValue};
use std::sync::LazyLock;

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("courier.outbox"));

/// First-line delivery outcomes, labelled by `outcome` and `source`.
pub static DELIVERIES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.outbox.deliveries")
        .with_description("Outbox and export delivery outcomes")
        .build()
});

pub(crate) fn record_delivery(source: &'static str, outcome: &'static str) {
    DELIVERIES.add(
        1,
        &[KeyValue::new("source", source), KeyValue::new("outcome", outcome)],
    );
}
