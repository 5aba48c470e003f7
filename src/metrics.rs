// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Primary writes and publishes
//! - Background applies, redeliveries and quarantines
//! - Channel depth and replication lag
//! - Mirror commits, aborts and compensations
//! - Circuit breaker state
//! - Store probes
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use store_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_publish("db_replication", true);
//! metrics::record_apply("db_replication", "applied", Duration::from_millis(3));
//! ```
//!
//! The library only emits; installing a recorder/exporter is up to the process.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Write Path
// =============================================================================

/// Record a primary store write.
pub fn record_primary_write(target: &str, kind: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_primary_writes_total",
        "target" => target.to_string(),
        "kind" => kind.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("replication_primary_write_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record a publish to a replication channel.
pub fn record_publish(channel: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_publishes_total", "channel" => channel.to_string(), "status" => status).increment(1);
}

// =============================================================================
// Consumer
// =============================================================================

/// Record a background apply and its outcome.
///
/// `outcome` is one of `applied`, `already_applied`, `failed`.
pub fn record_apply(channel: &str, outcome: &str, duration: Duration) {
    counter!(
        "replication_applies_total",
        "channel" => channel.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("replication_apply_duration_seconds", "channel" => channel.to_string())
        .record(duration.as_secs_f64());
}

/// Record a redelivery request (nack).
pub fn record_redelivery(channel: &str, delivery_count: u32) {
    counter!("replication_redeliveries_total", "channel" => channel.to_string()).increment(1);
    histogram!("replication_delivery_attempts", "channel" => channel.to_string())
        .record(delivery_count as f64);
}

/// Record a duplicate insert tolerated on redelivery.
pub fn record_duplicate_tolerated(channel: &str) {
    counter!("replication_duplicates_tolerated_total", "channel" => channel.to_string()).increment(1);
}

/// Record a record moved to the dead-letter channel.
pub fn record_quarantine(channel: &str, reason: &str) {
    counter!(
        "replication_quarantined_total",
        "channel" => channel.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Gauge for not-yet-acknowledged messages on a channel.
pub fn set_pending_depth(channel: &str, depth: u64) {
    gauge!("replication_pending_operations", "channel" => channel.to_string()).set(depth as f64);
}

/// Record replication lag in milliseconds (age of oldest pending message).
pub fn record_replication_lag_ms(channel: &str, lag_ms: u64) {
    gauge!("replication_lag_ms", "channel" => channel.to_string()).set(lag_ms as f64);
}

/// Record channel receive latency.
pub fn record_channel_read_latency(channel: &str, duration: Duration) {
    histogram!("replication_channel_read_duration_seconds", "channel" => channel.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Mirror
// =============================================================================

/// Record a mirrored write's final state.
///
/// `stage` is the last stage reached, `outcome` is `committed` or `aborted`.
pub fn record_mirror_outcome(target: &str, stage: &str, outcome: &str, duration: Duration) {
    counter!(
        "replication_mirror_writes_total",
        "target" => target.to_string(),
        "stage" => stage.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("replication_mirror_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

/// Record a compensation attempt on the secondary.
pub fn record_compensation(target: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_compensations_total",
        "target" => target.to_string(),
        "status" => status
    )
    .increment(1);
}

// =============================================================================
// Engine / Health
// =============================================================================

/// Record errors by type.
pub fn record_error(component: &str, error_type: &str) {
    counter!(
        "replication_errors_total",
        "component" => component.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replication_engine_state").set(value);
}

/// Record a store liveness probe.
pub fn record_store_probe(store: &str, healthy: bool, latency: Duration) {
    gauge!("replication_store_up", "store" => store.to_string()).set(if healthy { 1.0 } else { 0.0 });
    histogram!("replication_store_probe_duration_seconds", "store" => store.to_string())
        .record(latency.as_secs_f64());
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_sqlite_retry(operation: &str) {
    counter!("replication_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "replication_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("replication_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}
