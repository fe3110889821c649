//! Metrics definitions for the Room Registry.
//!
//! All metrics follow Prometheus naming conventions:
//! - `rr_` prefix for Room Registry
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `actor_type`: 3 values (registry, room, connection)
//! - `event`: bounded by the signaling event vocabulary (~17 values)
//! - `status`: `ok` or an error kind (~14 values)
//! - `outcome`: 4 values (created, incompatible, producer_not_found, error)
//! - `role`: 2 values (send, recv)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling requests are in-process actor round trips plus engine calls
        .set_buckets_for_metric(
            Matcher::Prefix("rr_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set request latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Participant Metrics (Gauges)
// ============================================================================

/// Set the number of live rooms.
///
/// Metric: `rr_rooms_active`
/// Labels: none
pub fn set_rooms_active(count: usize) {
    // usize to f64 conversion is safe for realistic room counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("rr_rooms_active").set(count as f64);
}

/// Set the number of participants across all rooms.
///
/// Metric: `rr_participants_active`
/// Labels: none
pub fn set_participants_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rr_participants_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `rr_mailbox_depth`
/// Labels: `actor_type` (registry, room, connection)
///
/// High values indicate the actor is falling behind in message processing.
pub fn set_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rr_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record one handled client request.
///
/// Metrics: `rr_requests_total`, `rr_request_duration_seconds`
/// Labels: `event`, `status` (counter only)
pub fn record_request(event: &str, status: &str, duration: Duration) {
    counter!("rr_requests_total",
        "event" => event.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!("rr_request_duration_seconds", "event" => event.to_string())
        .record(duration.as_secs_f64());
}

/// Record a room broadcast.
///
/// Metric: `rr_broadcasts_total`
/// Labels: `event`
pub fn record_broadcast(event: &str) {
    counter!("rr_broadcasts_total", "event" => event.to_string()).increment(1);
}

// ============================================================================
// Media Object Metrics (Counters)
// ============================================================================

/// Metric: `rr_producers_total`
pub fn record_producer_created() {
    counter!("rr_producers_total").increment(1);
}

/// Record a consume attempt.
///
/// Metric: `rr_consumers_total`
/// Labels: `outcome` (created, incompatible, producer_not_found, error)
pub fn record_consumer(outcome: &str) {
    counter!("rr_consumers_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a transport replaced by a newer one of the same role.
///
/// Metric: `rr_transports_superseded_total`
/// Labels: `role` (send, recv)
///
/// Sustained growth means clients are stuck in a recovery loop.
pub fn record_transport_superseded(role: &str) {
    counter!("rr_transports_superseded_total", "role" => role.to_string()).increment(1);
}

/// Record an actor panic event.
///
/// Metric: `rr_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("rr_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}
