//! Metrics definitions for the signaling service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sig_` prefix for the signaling service
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `event`: bounded by signaling event names (~16 values)
//! - `error_type`: bounded by `SignalingError::error_type_label`
//! - `operation`: bounded by engine and storage calls (~10 values each)
//! - `reason`: bounded by session end reasons (4 values)
//! - `actor_type`: 3 values (registry, session, connection)
//!
//! Room ids, participant ids and other identifiers are never labels.

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
        // Signaling event handling, p99 < 100ms excluding engine time
        .set_buckets_for_metric(
            Matcher::Prefix("sig_event".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set event latency buckets: {e}"))?
        // Media engine calls
        .set_buckets_for_metric(
            Matcher::Prefix("sig_engine".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set engine latency buckets: {e}"))?
        // Storage writes, p99 < 10ms
        .set_buckets_for_metric(
            Matcher::Prefix("sig_storage".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set storage latency buckets: {e}"))?
        // Consultations run minutes to hours
        .set_buckets_for_metric(
            Matcher::Full("sig_session_duration_seconds".to_string()),
            &[
                30.0, 60.0, 300.0, 600.0, 900.0, 1800.0, 2700.0, 3600.0, 5400.0, 7200.0,
            ],
        )
        .map_err(|e| format!("Failed to set session duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session & Connection Metrics (Gauges)
// ============================================================================

/// Metric: `sig_sessions_active`
/// Labels: none
pub fn set_active_sessions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sig_sessions_active").set(count as f64);
}

/// Metric: `sig_participants_active`
/// Labels: none
pub fn set_active_participants(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sig_participants_active").set(count as f64);
}

/// Metric: `sig_connections_active`
/// Labels: none
pub fn set_active_connections(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sig_connections_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `sig_actor_mailbox_depth`
/// Labels: `actor_type` (registry, session, connection)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sig_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Latency Metrics (Histograms)
// ============================================================================

/// Record how long the gateway spent handling one inbound event.
///
/// Metric: `sig_event_latency_seconds`
/// Labels: `event`
pub fn record_event_latency(event: &str, duration: Duration) {
    histogram!("sig_event_latency_seconds", "event" => event.to_string())
        .record(duration.as_secs_f64());
}

/// Record a media engine call.
///
/// Metric: `sig_engine_call_duration_seconds`, `sig_engine_calls_total`
/// Labels: `operation`, `status` (success, error)
pub fn record_engine_call(operation: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "error" };
    histogram!("sig_engine_call_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
    counter!(
        "sig_engine_calls_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a storage operation.
///
/// Metric: `sig_storage_latency_seconds`, `sig_storage_operations_total`
/// Labels: `operation`, `status` (success, error)
pub fn record_storage_operation(operation: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "error" };
    histogram!("sig_storage_latency_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
    counter!(
        "sig_storage_operations_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a finished session.
///
/// Metric: `sig_session_duration_seconds`, `sig_sessions_ended_total`
/// Labels: `reason` (requested, last_participant_left, max_duration, abandoned, shutdown)
pub fn record_session_ended(reason: &str, duration: Duration) {
    histogram!("sig_session_duration_seconds").record(duration.as_secs_f64());
    counter!("sig_sessions_ended_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Counters
// ============================================================================

/// Record an error answered to a client.
///
/// Metric: `sig_errors_total`
/// Labels: `event`, `error_type`
pub fn record_signaling_error(event: &str, error_type: &str) {
    counter!(
        "sig_errors_total",
        "event" => event.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a denied join attempt.
///
/// Metric: `sig_join_denied_total`
/// Labels: `reason` (unauthorized, not_found, capacity)
pub fn record_join_denied(reason: &str) {
    counter!("sig_join_denied_total", "reason" => reason.to_string()).increment(1);
}

/// Record negotiation resources reclaimed by the stale sweep.
///
/// Metric: `sig_stale_resources_reclaimed_total`
/// Labels: `kind` (transport, consumer)
pub fn record_stale_reclaimed(kind: &str, count: usize) {
    counter!("sig_stale_resources_reclaimed_total", "kind" => kind.to_string())
        .increment(count as u64);
}

/// Record a media worker death. Always followed by process exit.
///
/// Metric: `sig_worker_deaths_total`
/// Labels: none
pub fn record_worker_death() {
    counter!("sig_worker_deaths_total").increment(1);
}

/// Record an audit delivery outcome.
///
/// Metric: `sig_audit_events_total`
/// Labels: `status` (delivered, retried, failed, dropped)
pub fn record_audit_event(status: &str) {
    counter!("sig_audit_events_total", "status" => status.to_string()).increment(1);
}

/// Record an actor panic event.
///
/// Metric: `sig_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("sig_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}
