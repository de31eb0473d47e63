//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Inbound event flow (received, deduplicated, ignored)
//! - Replication outcomes per config
//! - Rate limiting and retries
//! - Sequential queue depth and pending timers
//! - Media-group sealing
//! - Edit synchronization
//! - Destination circuit breakers
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `channel_replication_` and follow
//! Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use channel_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_event_received("channel_post");
//! metrics::record_clone_success(7, "photo");
//! metrics::record_replication_latency(7, Duration::from_millis(120));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Inbound
// =============================================================================

/// Record an inbound platform event.
pub fn record_event_received(kind: &str) {
    counter!("channel_replication_events_received_total", "kind" => kind.to_string()).increment(1);
}

/// Record an event rejected by the dedup filter.
pub fn record_dedup_skip() {
    counter!("channel_replication_events_deduped_total").increment(1);
}

/// Record an event from a channel with no active config.
pub fn record_ignored_event() {
    counter!("channel_replication_events_ignored_total").increment(1);
}

/// Record a unit rejected by the content filter.
pub fn record_filtered(config_id: i64) {
    counter!("channel_replication_filtered_total", "config_id" => config_id.to_string()).increment(1);
}

// =============================================================================
// Replication
// =============================================================================

/// Record a unit delivered to every destination.
pub fn record_clone_success(config_id: i64, kind: &str) {
    counter!(
        "channel_replication_clones_total",
        "config_id" => config_id.to_string(),
        "kind" => kind.to_string(),
        "status" => "success"
    )
    .increment(1);
}

/// Record a terminal replication failure.
pub fn record_clone_failure(config_id: i64, error_kind: &str) {
    counter!(
        "channel_replication_clones_total",
        "config_id" => config_id.to_string(),
        "kind" => error_kind.to_string(),
        "status" => "failure"
    )
    .increment(1);
}

/// Record a retry scheduled after a failed attempt.
pub fn record_retry(config_id: i64, attempt: u32) {
    counter!("channel_replication_retries_total", "config_id" => config_id.to_string()).increment(1);
    histogram!("channel_replication_retry_attempt", "config_id" => config_id.to_string())
        .record(f64::from(attempt));
}

/// Record an attempt denied by the per-config token bucket.
pub fn record_rate_limited(config_id: i64) {
    counter!("channel_replication_rate_limited_total", "config_id" => config_id.to_string()).increment(1);
}

/// Record time spent in transport calls for one unit (all destinations).
pub fn record_replication_latency(config_id: i64, duration: Duration) {
    histogram!("channel_replication_latency_seconds", "config_id" => config_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a mapping that could not be persisted.
pub fn record_mapping_write_failure(config_id: i64) {
    counter!("channel_replication_mapping_write_failures_total", "config_id" => config_id.to_string())
        .increment(1);
}

// =============================================================================
// Queues and timers
// =============================================================================

/// Set the sequential queue depth for a config.
pub fn set_queue_depth(config_id: i64, depth: usize) {
    gauge!("channel_replication_queue_depth", "config_id" => config_id.to_string()).set(depth as f64);
}

/// Set the number of pending timer jobs (seals and delayed deliveries).
pub fn set_pending_timers(count: usize) {
    gauge!("channel_replication_pending_timers").set(count as f64);
}

/// Record tasks dropped by an admin flush.
pub fn record_queue_flush(config_id: i64, dropped: usize) {
    counter!("channel_replication_flushed_tasks_total", "config_id" => config_id.to_string())
        .increment(dropped as u64);
}

// =============================================================================
// Media groups
// =============================================================================

/// Record a sealed media group and its item count.
pub fn record_group_sealed(config_id: i64, items: usize) {
    counter!("channel_replication_groups_sealed_total", "config_id" => config_id.to_string()).increment(1);
    histogram!("channel_replication_group_items", "config_id" => config_id.to_string()).record(items as f64);
}

/// Record a sealed group that produced nothing deliverable.
pub fn record_group_dropped(config_id: i64, reason: &str) {
    counter!(
        "channel_replication_groups_dropped_total",
        "config_id" => config_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a member that arrived after its group was sealed.
pub fn record_stale_group_member(config_id: i64) {
    counter!("channel_replication_stale_group_members_total", "config_id" => config_id.to_string())
        .increment(1);
}

// =============================================================================
// Edit synchronization
// =============================================================================

/// Record an edit-sync outcome (`synced`, `no_mapping`, `unsupported`, `failed`).
pub fn record_edit_sync(config_id: i64, outcome: &str) {
    counter!(
        "channel_replication_edit_sync_total",
        "config_id" => config_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record a guarded call: `success`, `failure` or `rejected` (circuit open).
pub fn record_circuit_call(destination: i64, outcome: &str) {
    counter!(
        "channel_replication_circuit_calls_total",
        "destination" => destination.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// =============================================================================
// Engine
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("channel_replication_engine_state").set(value);
}
