//! Aggregation metrics.
//!
//! Recorded against the global meter; the aggregator service installs a
//! Prometheus-backed provider, tests run against the no-op default.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

pub struct AggregationMetrics {
    pub rounds_opened_total: Counter<u64>,
    pub rounds_completed_total: Counter<u64>,
    pub rounds_aborted_total: Counter<u64>,
    pub submissions_rejected_total: Counter<u64>,
    pub validation_outcomes_total: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
}

static AGG_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("equiverse_aggregation"));

pub static AGGREGATION_METRICS: Lazy<AggregationMetrics> = Lazy::new(|| AggregationMetrics {
    rounds_opened_total: AGG_METER.u64_counter("equiverse_rounds_opened_total").with_description("Secure aggregation rounds opened").build(),
    rounds_completed_total: AGG_METER.u64_counter("equiverse_rounds_completed_total").with_description("Rounds that reached unmasking").build(),
    rounds_aborted_total: AGG_METER.u64_counter("equiverse_rounds_aborted_total").with_description("Rounds aborted, by reason").build(),
    submissions_rejected_total: AGG_METER.u64_counter("equiverse_submissions_rejected_total").with_description("Protocol messages refused by the aggregator").build(),
    validation_outcomes_total: AGG_METER.u64_counter("equiverse_validation_outcomes_total").with_description("Benchmark validation outcomes").build(),
    aggregation_latency_ms: AGG_METER.f64_histogram("equiverse_aggregation_latency_ms").with_description("Open-to-unmask latency per period ms").with_unit("ms").build(),
});

pub fn record_abort(reason: impl std::fmt::Display) {
    AGGREGATION_METRICS.rounds_aborted_total.add(1, &[KeyValue::new("reason", reason.to_string())]);
}

pub fn record_outcome(outcome: &'static str) {
    AGGREGATION_METRICS.validation_outcomes_total.add(1, &[KeyValue::new("outcome", outcome)]);
}
