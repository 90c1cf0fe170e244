//! Metric definitions and recording helpers
//!
//! All metric names and label sets defined here are a stable scrape API;
//! renaming one is a breaking change for dashboards and alerts.

use std::sync::Once;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

static INIT: Once = Once::new();

/// Result label for allowed requests
pub const RESULT_ALLOW: &str = "allow";
/// Result label for denied requests
pub const RESULT_DENY: &str = "deny";

/// Error type label for credential verification failures
pub const ERROR_JWT_VERIFY: &str = "jwt_verify";
/// Error type label for revocation lookup failures
pub const ERROR_REVOCATION: &str = "revocation";

/// Register metric descriptions. Call once at startup, after the
/// Prometheus recorder is installed.
pub fn init_metrics() {
    INIT.call_once(|| {
        describe_counter!(
            "requests_total",
            "Total number of authorization checks by result and reason"
        );
        describe_histogram!(
            "request_duration_seconds",
            "End-to-end duration of authorization checks in seconds"
        );
        describe_gauge!(
            "requests_in_flight",
            "Number of authorization checks currently being processed"
        );
        describe_histogram!(
            "jwt_verify_duration_seconds",
            "Duration of credential verification in seconds"
        );
        describe_histogram!(
            "revocation_lookup_duration_seconds",
            "Duration of revocation lookups in seconds"
        );
        describe_counter!(
            "errors_total",
            "Total number of internal errors by error type"
        );
        describe_counter!(
            "revocation_hits_total",
            "Total number of requests denied because the credential was revoked"
        );
        describe_gauge!(
            "revocation_cache_entries",
            "Current number of entries in the local revocation cache"
        );
        describe_counter!(
            "mq_events_received_total",
            "Total number of revocation events received from the event bus"
        );
        describe_counter!(
            "mq_events_processed_total",
            "Total number of revocation events successfully processed"
        );
        describe_counter!(
            "mq_events_failed_total",
            "Total number of revocation events that failed to process"
        );
        describe_gauge!(
            "mq_connection_status",
            "Event bus connection status (1=connected, 0=disconnected)"
        );
        describe_counter!(
            "mq_reconnects_total",
            "Total number of event bus reconnection attempts"
        );
    });
}

/// Record a completed authorization check
pub fn record_request(result: &'static str, reason: &'static str, duration: Duration) {
    counter!("requests_total", "result" => result, "reason" => reason).increment(1);
    histogram!("request_duration_seconds", "result" => result, "reason" => reason)
        .record(duration.as_secs_f64());
}

/// Increment the in-flight gauge
pub fn inflight_inc() {
    gauge!("requests_in_flight").increment(1.0);
}

/// Decrement the in-flight gauge
pub fn inflight_dec() {
    gauge!("requests_in_flight").decrement(1.0);
}

/// Record credential verification duration
pub fn record_jwt_verify(duration: Duration) {
    histogram!("jwt_verify_duration_seconds").record(duration.as_secs_f64());
}

/// Record revocation lookup duration
pub fn record_revocation_lookup(duration: Duration) {
    histogram!("revocation_lookup_duration_seconds").record(duration.as_secs_f64());
}

/// Record an internal error of the given type
pub fn record_error(error_type: &'static str) {
    counter!("errors_total", "type" => error_type).increment(1);
}

/// Record a deny caused by a revoked credential
pub fn record_revocation_hit() {
    counter!("revocation_hits_total").increment(1);
}

/// Update the revocation cache size gauge
pub fn set_cache_entries(count: usize) {
    gauge!("revocation_cache_entries").set(count as f64);
}

/// Record a received revocation event by type
pub fn record_event_received(event_type: &str) {
    counter!("mq_events_received_total", "type" => event_type.to_string()).increment(1);
}

/// Record a successfully processed revocation event by type
pub fn record_event_processed(event_type: &str) {
    counter!("mq_events_processed_total", "type" => event_type.to_string()).increment(1);
}

/// Record a revocation event that failed to process
pub fn record_event_failed() {
    counter!("mq_events_failed_total").increment(1);
}

/// Flip the event bus connection gauge
pub fn set_bus_connected(connected: bool) {
    gauge!("mq_connection_status").set(if connected { 1.0 } else { 0.0 });
}

/// Record an event bus reconnection attempt
pub fn record_bus_reconnect() {
    counter!("mq_reconnects_total").increment(1);
}
