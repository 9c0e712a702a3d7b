//! Dead-letter instruments.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::{global, KeyValue};
use std::sync::LazyLock;

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("courier.dead_letter"));

/// Dead rows per org, sampled before and after each run.
pub static DLQ_DEPTH: LazyLock<Gauge<u64>> = LazyLock::new(|| {
    METER
        .u64_gauge("courier.dlq.depth")
        .with_description("Dead outbox and export rows per org")
        .build()
});

pub static REPLAY_OUTCOMES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.dlq.replay.outcomes")
        .with_description("Auto-replay attempts by outcome")
        .build()
});

pub static BREAKER_TRIPS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.dlq.replay.breaker_trips")
        .with_description("Auto-replay runs stopped by the failure-streak breaker")
        .build()
});

pub(crate) fn record_depth(org_id: &str, phase: &'static str, depth: u64) {
    DLQ_DEPTH.record(
        depth,
        &[
            KeyValue::new("org_id", org_id.to_string()),
            KeyValue::new("phase", phase),
        ],
    );
}

pub(crate) fn record_outcome(outcome: &'static str) {
    REPLAY_OUTCOMES.add(1, &[KeyValue::new("outcome", outcome)]);
}

pub(crate) fn record_breaker_trip(org_id: &str) {
    BREAKER_TRIPS.add(1, &[KeyValue::new("org_id", org_id.to_string())]);
}
