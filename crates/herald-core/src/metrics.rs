//! Metric instrumentation for the hub.
//!
//! Records through the `metrics` facade; the embedding binary decides where
//! they are exported.

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "herald_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "herald_connections_active";
    pub const CONNECTIONS_CLOSED_TOTAL: &str = "herald_connections_closed_total";
    pub const CONNECTIONS_REJECTED_TOTAL: &str = "herald_connections_rejected_total";
    pub const UPGRADES_FAILED_TOTAL: &str = "herald_upgrades_failed_total";
    pub const DELIVERIES_TOTAL: &str = "herald_deliveries_total";
    pub const BROADCASTS_TOTAL: &str = "herald_broadcasts_total";
    pub const WRITE_LATENCY_SECONDS: &str = "herald_write_latency_seconds";
}

/// Register metric descriptions with the installed recorder.
pub fn describe() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of accepted connections since start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of registered connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_CLOSED_TOTAL,
        "Closed connections by reason"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED_TOTAL,
        "Connections refused at admission by reason"
    );
    metrics::describe_counter!(
        names::UPGRADES_FAILED_TOTAL,
        "Handshakes that failed or timed out"
    );
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Per-connection delivery attempts by outcome"
    );
    metrics::describe_counter!(names::BROADCASTS_TOTAL, "Broadcast notifications");
    metrics::describe_histogram!(
        names::WRITE_LATENCY_SECONDS,
        "Transport write latency in seconds"
    );
}

/// Record an accepted connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a deregistered connection.
pub fn record_disconnection(reason: &'static str) {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    counter!(names::CONNECTIONS_CLOSED_TOTAL, "reason" => reason).increment(1);
}

/// Record a refused connection.
pub fn record_rejection(reason: &'static str) {
    counter!(names::CONNECTIONS_REJECTED_TOTAL, "reason" => reason).increment(1);
}

/// Record a failed handshake.
pub fn record_upgrade_failure() {
    counter!(names::UPGRADES_FAILED_TOTAL).increment(1);
}

/// Record delivery outcomes in bulk.
pub fn record_deliveries(outcome: &'static str, count: u64) {
    if count > 0 {
        counter!(names::DELIVERIES_TOTAL, "outcome" => outcome).increment(count);
    }
}

/// Record a broadcast.
pub fn record_broadcast() {
    counter!(names::BROADCASTS_TOTAL).increment(1);
}

/// Record transport write latency.
pub fn record_write_latency(seconds: f64) {
    histogram!(names::WRITE_LATENCY_SECONDS).record(seconds);
}
