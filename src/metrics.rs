// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Records through the [`metrics`] facade for:
//! - Variables sent to and received from peers
//! - Sync responses, durations and skipped triggers
//! - Peer connection status
//! - Fan-out drops
//! - Garbage collection
//!
//! No exporter is installed here; the host application picks one.
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
//! use counter_replication::metrics;
//! use std::time::Duration;
//!
//! // In a peer link after an acknowledged sync
//! metrics::record_variables_sent("10.0.0.2:7946", 42);
//! metrics::record_sync_response("10.0.0.2:7946", 0, Duration::from_millis(3));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Peer link
// =============================================================================

/// Record a connect attempt (dial + Hello).
pub fn record_peer_connection(peer_addr: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_peer_connections_total", "peer" => peer_addr.to_string(), "status" => status).increment(1);
}

/// Record peer link state. The gauge for the current state is 1.
pub fn record_peer_state(peer_addr: &str, state: &str) {
    gauge!("replication_peer_state", "peer" => peer_addr.to_string(), "state" => state.to_string()).set(1.0);
}

/// Clear a state gauge when leaving it.
pub fn clear_peer_state(peer_addr: &str, state: &str) {
    gauge!("replication_peer_state", "peer" => peer_addr.to_string(), "state" => state.to_string()).set(0.0);
}

/// Record counter entries acknowledged by a peer.
pub fn record_variables_sent(peer_addr: &str, count: usize) {
    counter!("replication_variables_sent_total", "peer" => peer_addr.to_string()).increment(count as u64);
}

/// Record a sync response and how long the call took.
///
/// Transport failures and timeouts are recorded with `code = "error"`.
pub fn record_sync_response(peer_addr: &str, code: i64, duration: Duration) {
    counter!("replication_sync_responses_total", "peer" => peer_addr.to_string(), "code" => code.to_string()).increment(1);
    histogram!("replication_sync_duration_seconds", "peer" => peer_addr.to_string())
        .record(duration.as_secs_f64());
}

/// Record a sync call that never got a response.
pub fn record_sync_error(peer_addr: &str, duration: Duration) {
    counter!("replication_sync_responses_total", "peer" => peer_addr.to_string(), "code" => "error").increment(1);
    histogram!("replication_sync_duration_seconds", "peer" => peer_addr.to_string())
        .record(duration.as_secs_f64());
}

/// Record a sync trigger that did not run (`busy`, `retry_exhausted`).
pub fn record_sync_skipped(peer_addr: &str, reason: &'static str) {
    counter!("replication_sync_skipped_total", "peer" => peer_addr.to_string(), "reason" => reason).increment(1);
}

// =============================================================================
// Inbound
// =============================================================================

/// Record counter entries received in one inbound sync.
pub fn record_variables_received(origin: &str, count: usize) {
    counter!("replication_variables_received_total", "origin" => origin.to_string()).increment(count as u64);
}

/// Record an inbound sync rejected before merge.
pub fn record_sync_rejected(reason: &'static str) {
    counter!("replication_sync_rejected_total", "reason" => reason).increment(1);
}

// =============================================================================
// Core
// =============================================================================

/// Record a fan-out update that never reached a link (`queue_full`, `closed`, `timeout`).
pub fn record_fanout_dropped(reason: &'static str) {
    counter!("replication_fanout_dropped_total", "reason" => reason).increment(1);
}

/// Record one GC sweep.
pub fn record_gc_sweep(collected: usize, duration: Duration) {
    counter!("replication_gc_collected_total").increment(collected as u64);
    histogram!("replication_gc_sweep_duration_seconds").record(duration.as_secs_f64());
}

/// Gauge for counters in the local table.
pub fn set_counters(count: usize) {
    gauge!("replication_counters").set(count as f64);
}

/// Gauge for links that completed Hello.
pub fn set_registered_peers(count: usize) {
    gauge!("replication_registered_peers").set(count as f64);
}

/// Gauge for core lifecycle state.
pub fn set_core_state(state: &str) {
    // Numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("replication_core_state").set(value);
}
