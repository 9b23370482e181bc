// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for dualsync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding daemon is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `dualsync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: primary, secondary
//! - `outcome`: success, primary_failed, secondary_failed, compensated, unrecovered
//! - `action`: secondary_sync_retry, legacy_delete, legacy_secondary_cleanup

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record the outcome of one dual-write orchestration
pub fn record_write(outcome: &str) {
    counter!(
        "dualsync_writes_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record dual-write latency
pub fn record_write_latency(duration: Duration) {
    histogram!("dualsync_write_seconds").record(duration.as_secs_f64());
}

/// Record which store answered a coordinated read
pub fn record_read(store: &str, outcome: &str) {
    counter!(
        "dualsync_reads_total",
        "store" => store.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a recovery-queue publication
pub fn record_queue_publish(action: &str) {
    counter!(
        "dualsync_recovery_published_total",
        "action" => action.to_string()
    )
    .increment(1);
}

/// Record one reconciliation attempt outcome
pub fn record_recovery(action: &str, outcome: &str) {
    counter!(
        "dualsync_recovery_attempts_total",
        "action" => action.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record reconciliation latency for one event
pub fn record_recovery_latency(duration: Duration) {
    histogram!("dualsync_recovery_seconds").record(duration.as_secs_f64());
}

/// Set current recovery-queue depth
pub fn set_queue_depth(depth: usize) {
    gauge!("dualsync_recovery_queue_depth").set(depth as f64);
}

/// Set current terminal-failure set size
pub fn set_failed_events(count: usize) {
    gauge!("dualsync_recovery_failed_events").set(count as f64);
}

/// Record an operator alert emission
pub fn record_alert(severity: &str) {
    counter!(
        "dualsync_alerts_total",
        "severity" => severity.to_string()
    )
    .increment(1);
}

/// Set store health from the last probe (1 = reachable)
pub fn set_store_healthy(store: &str, healthy: bool) {
    gauge!(
        "dualsync_store_healthy",
        "store" => store.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}
