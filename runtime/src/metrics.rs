//! Metrics for the outbox, the event bus and the sagas.
//!
//! Metrics go through the `metrics` facade. The library never installs a
//! recorder; the host service picks an exporter and calls
//! [`register_metrics`] once at startup so the descriptions show up.
//!
//! # Example
//!
//! ```rust,no_run
//! consent_runtime::metrics::register_metrics();
//! ```

use metrics::{describe_counter, describe_histogram};
use std::time::Duration;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Register all metric descriptions.
pub fn register_metrics() {
    // Outbox
    describe_counter!(
        "consent_events_committed_total",
        "Total number of permission events committed, by event type"
    );
    describe_histogram!(
        "consent_commit_duration_seconds",
        "Time taken to append, project and publish one event"
    );
    describe_counter!(
        "consent_illegal_transitions_total",
        "Total number of commits rejected by the transition table"
    );
    describe_counter!(
        "consent_status_conflicts_total",
        "Total number of commits that lost a race against another writer"
    );

    // Event bus
    describe_counter!(
        "consent_events_published_total",
        "Total number of events handed to the event bus"
    );
    describe_counter!(
        "consent_events_delivered_total",
        "Total number of event deliveries to handlers"
    );
    describe_counter!(
        "consent_handler_failures_total",
        "Total number of handler failures and panics, by handler"
    );

    // Sagas
    describe_counter!(
        "consent_retry_attempts_total",
        "Total number of scheduled retries, by loop"
    );
    describe_counter!(
        "consent_retry_exhausted_total",
        "Total number of requests left in a failure status after the retry budget ran out"
    );
    describe_counter!(
        "consent_requests_timed_out_total",
        "Total number of requests timed out by the stale request sweeper"
    );
}

/// Outbox metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record a committed event.
    pub fn record_commit(event_type: &'static str, duration: Duration) {
        counter!("consent_events_committed_total", "event_type" => event_type).increment(1);
        histogram!("consent_commit_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a commit rejected by the transition table.
    pub fn record_illegal_transition() {
        counter!("consent_illegal_transitions_total").increment(1);
    }

    /// Record a commit that lost a race.
    pub fn record_status_conflict() {
        counter!("consent_status_conflicts_total").increment(1);
    }
}

/// Event bus metrics recorder.
pub struct EventBusMetrics;

impl EventBusMetrics {
    /// Record a publish.
    pub fn record_publish() {
        counter!("consent_events_published_total").increment(1);
    }

    /// Record a delivery to one handler.
    pub fn record_delivery() {
        counter!("consent_events_delivered_total").increment(1);
    }

    /// Record a failed or panicked handler.
    pub fn record_handler_failure(handler: &'static str) {
        counter!("consent_handler_failures_total", "handler" => handler).increment(1);
    }
}

/// Saga metrics recorder.
pub struct SagaMetrics;

impl SagaMetrics {
    /// Record a scheduled retry of `retry_loop` (`"send"` or `"termination"`).
    pub fn record_retry(retry_loop: &'static str) {
        counter!("consent_retry_attempts_total", "loop" => retry_loop).increment(1);
    }

    /// Record an exhausted retry budget.
    pub fn record_exhausted(retry_loop: &'static str) {
        counter!("consent_retry_exhausted_total", "loop" => retry_loop).increment(1);
    }

    /// Record requests timed out by one sweep.
    pub fn record_timed_out(count: usize) {
        counter!("consent_requests_timed_out_total").increment(count as u64);
    }
}
