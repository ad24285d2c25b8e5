//! Metrics definitions for the Ingest Controller per ADR-0011
//!
//! All metrics follow Prometheus naming conventions:
//! - `ingest_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion (ADR-0011). Stream IDs
//! are never used as labels.
//! - `level`: 2 values (high, low)
//! - `rule`: bounded by registered admission rules (3 by default)
//! - `outcome`: 4 values (completed, retrying, failed, abandoned)
//! - `actor_type`: 2 values (coordinator, pass)
//! - `operation` / `kind`: bounded by code

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// ADR-0011: Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Pass duration buckets - a pass drains a whole backlog, so allow seconds
        .set_buckets_for_metric(
            Matcher::Prefix("ingest_pass".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set pass duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Stream & Buffer Metrics
// ============================================================================

/// Set the number of registered streams.
///
/// Metric: `ingest_streams_active`
pub fn set_streams_active(count: usize) {
    // usize to f64 conversion is safe for realistic stream counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("ingest_streams_active").set(count as f64);
}

/// Record frames accepted into stream buffers.
///
/// Metric: `ingest_frames_received_total`
pub fn record_frames_received(count: usize) {
    counter!("ingest_frames_received_total").increment(count as u64);
}

/// Record frames evicted by buffer overflow.
///
/// Metric: `ingest_frames_evicted_total`
pub fn record_frames_evicted(count: usize) {
    counter!("ingest_frames_evicted_total").increment(count as u64);
}

/// Record a watermark crossing.
///
/// Metric: `ingest_buffer_watermark_total`
/// Labels: `level` (high, low)
pub fn record_watermark(level: &str) {
    counter!("ingest_buffer_watermark_total", "level" => level.to_string()).increment(1);
}

// ============================================================================
// Admission Metrics
// ============================================================================

/// Record a stream rejected by an admission rule.
///
/// Metric: `ingest_admission_rejected_total`
/// Labels: `rule`
pub fn record_admission_rejected(rule: &str) {
    counter!("ingest_admission_rejected_total", "rule" => rule.to_string()).increment(1);
}

// ============================================================================
// Processing Metrics
// ============================================================================

/// Set the number of queued processing jobs.
///
/// Metric: `ingest_processing_queue_depth`
pub fn set_processing_queue_depth(depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("ingest_processing_queue_depth").set(depth as f64);
}

/// Set the number of passes currently running.
///
/// Metric: `ingest_passes_active`
pub fn set_passes_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("ingest_passes_active").set(count as f64);
}

/// Record the end of a pass.
///
/// Metrics: `ingest_passes_total`, `ingest_pass_duration_seconds`
/// Labels: `outcome` (completed, retrying, failed, abandoned)
pub fn record_pass(outcome: &str, duration: Duration) {
    counter!("ingest_passes_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("ingest_pass_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

/// Record frames handed to the enhancer.
///
/// Metric: `ingest_frames_enhanced_total`
pub fn record_frames_enhanced(count: usize) {
    counter!("ingest_frames_enhanced_total").increment(count as u64);
}

// ============================================================================
// Actor & Error Metrics
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `ingest_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("ingest_actor_mailbox_depth", "actor_type" => actor_type.to_string())
        .set(depth as f64);
}

/// Record an actor panic.
///
/// Metric: `ingest_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &str) {
    counter!("ingest_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Record an error returned to a caller.
///
/// Metric: `ingest_errors_total`
/// Labels: `operation`, `kind`
pub fn record_error(operation: &str, kind: &str) {
    counter!(
        "ingest_errors_total",
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}
