//! Metrics instrumentation for the gateway core.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the host
//! daemon chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `edge_gateway_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `source`: cloud, store, default
//! - `outcome`: per-operation result labels (applied, stale, gap, ...)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record where a twin read was served from
pub fn record_twin_pull(source: &str) {
    counter!(
        "edge_gateway_twin_pulls_total",
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record arbitration of a desired-property patch
pub fn record_desired_patch(outcome: &str) {
    counter!(
        "edge_gateway_desired_patches_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a resync attempt
pub fn record_resync(outcome: &str) {
    counter!(
        "edge_gateway_twin_resyncs_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a desired-delta fanout attempt
pub fn record_fanout(outcome: &str) {
    counter!(
        "edge_gateway_desired_fanout_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an accepted reported-property update
pub fn record_reported_update() {
    counter!("edge_gateway_reported_updates_total").increment(1);
}

/// Record an upstream drain attempt for pending reported state
pub fn record_reported_drain(outcome: &str) {
    counter!(
        "edge_gateway_reported_drains_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set the number of ids with pending reported state
pub fn set_pending_reported(count: usize) {
    gauge!("edge_gateway_reported_pending").set(count as f64);
}

/// Record a completed identity refresh cycle
pub fn record_refresh_cycle(updated: usize, removed: usize) {
    counter!("edge_gateway_identity_cycles_total").increment(1);
    counter!("edge_gateway_identity_upserts_total").increment(updated as u64);
    counter!("edge_gateway_identity_removals_total").increment(removed as u64);
}

/// Record an identity change event dispatch
pub fn record_identity_change(kind: &str) {
    counter!(
        "edge_gateway_identity_changes_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record latency of an external call
pub fn record_latency(subsystem: &str, operation: &str, duration: Duration) {
    histogram!(
        "edge_gateway_operation_seconds",
        "subsystem" => subsystem.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    subsystem: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(subsystem: &'static str, operation: &'static str) -> Self {
        Self {
            subsystem,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.subsystem, self.operation, self.start.elapsed());
    }
}
