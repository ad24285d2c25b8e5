//! Message types for the processing coordinator.
//!
//! Callers talk to the coordinator through [`CoordinatorMessage`] on a bounded
//! `mpsc` mailbox with `oneshot` replies. Pass tasks and retry timers report
//! back on a separate internal channel ([`CoordinatorEvent`]) so that the
//! public mailbox closes once every handle is dropped.

use crate::errors::IngestError;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to `ProcessingCoordinatorActor`.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Queue a stream for processing, or raise its queued priority.
    Enqueue {
        stream_id: String,
        priority: u32,
        respond_to: oneshot::Sender<EnqueueOutcome>,
    },

    /// Raise a stream's priority by one after a buffer overflow.
    Escalate {
        stream_id: String,
        /// New priority, or `None` if the stream is unknown to the coordinator.
        respond_to: oneshot::Sender<Option<u32>>,
    },

    /// Forget a stream entirely. Responds `true` if anything was removed.
    Remove {
        stream_id: String,
        respond_to: oneshot::Sender<bool>,
    },

    /// Resume dispatching passes.
    Start { respond_to: oneshot::Sender<()> },

    /// Stop dispatching new passes. In-flight passes run to completion.
    Stop { respond_to: oneshot::Sender<()> },

    /// List queued jobs in queue order.
    GetQueue {
        respond_to: oneshot::Sender<Vec<ProcessingJobInfo>>,
    },

    /// Look up one stream's processing record.
    GetStreamState {
        stream_id: String,
        respond_to: oneshot::Sender<Option<StreamJobInfo>>,
    },

    /// Initiate graceful shutdown.
    Shutdown {
        /// How long to wait for in-flight passes to stop.
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), IngestError>>,
    },
}

/// Internal notifications from pass tasks and retry timers.
#[derive(Debug)]
pub(crate) enum CoordinatorEvent {
    PassFinished {
        stream_id: String,
        pass_id: u64,
        outcome: PassOutcome,
    },
    RetryDue {
        stream_id: String,
        retry_count: u32,
    },
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PassOutcome {
    /// The backlog was drained.
    Completed(PassStats),
    /// The enhancer failed outright.
    Failed { error: String, stats: PassStats },
    /// Cancelled at a batch boundary.
    Abandoned,
}

/// Counters collected by a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct PassStats {
    pub frames_processed: usize,
    pub frames_rejected: usize,
    pub elapsed: Duration,
}

/// Result of [`CoordinatorMessage::Enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// A new job entered the queue.
    Queued,
    /// The stream was already queued; its priority is now the max of both.
    PriorityUpdated,
    /// The stream is active or waiting to retry; it is re-queued afterwards.
    Deferred,
    /// The stream failed terminally, or the coordinator is shutting down.
    Rejected,
}

/// Per-stream processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamProcessingState {
    Queued,
    Active,
    Completed,
    Retrying,
    Failed,
}

impl StreamProcessingState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            StreamProcessingState::Queued => "queued",
            StreamProcessingState::Active => "active",
            StreamProcessingState::Completed => "completed",
            StreamProcessingState::Retrying => "retrying",
            StreamProcessingState::Failed => "failed",
        }
    }
}

/// A queued job, as reported by [`CoordinatorMessage::GetQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingJobInfo {
    pub stream_id: String,
    pub priority: u32,
    pub retry_count: u32,
    /// Time spent in the queue so far.
    pub waiting: Duration,
}

/// A stream's processing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamJobInfo {
    pub state: StreamProcessingState,
    pub priority: u32,
    pub retry_count: u32,
}

/// Coordinator status (for health checks and the status endpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessingStatus {
    pub running: bool,
    pub queue_depth: usize,
    pub active_count: usize,
    pub max_concurrent_streams: usize,
}

/// Metrics computed at the end of each completed pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMetrics {
    /// Wall time of the pass divided by frames processed.
    pub avg_frame_latency_ms: f64,
    pub frames_per_second: f64,
    /// Rejected frames as a percentage of frames in the pass.
    pub error_rate: f64,
    /// Frames left in the buffer when the pass ended.
    pub backlog_depth: usize,
    /// Frames handed to the enhancer in the last pass.
    pub frames_processed: usize,
    /// Frames handed to the enhancer across all completed passes.
    pub total_frames_processed: u64,
    pub passes_completed: u64,
    pub last_pass_at: DateTime<Utc>,
}

impl StreamMetrics {
    /// Fold one pass into the previous metrics (if any).
    pub(crate) fn from_pass(
        stats: &PassStats,
        backlog_depth: usize,
        previous: Option<&StreamMetrics>,
    ) -> Self {
        // Frame counts stay far below 2^53
        #[allow(clippy::cast_precision_loss)]
        let frames = stats.frames_processed as f64;
        #[allow(clippy::cast_precision_loss)]
        let rejected = stats.frames_rejected as f64;
        let secs = stats.elapsed.as_secs_f64();

        let (avg_frame_latency_ms, error_rate) = if stats.frames_processed == 0 {
            (0.0, 0.0)
        } else {
            (secs * 1000.0 / frames, rejected / frames * 100.0)
        };
        let frames_per_second = if secs > 0.0 { frames / secs } else { 0.0 };

        Self {
            avg_frame_latency_ms,
            frames_per_second,
            error_rate,
            backlog_depth,
            frames_processed: stats.frames_processed,
            total_frames_processed: previous.map_or(0, |p| p.total_frames_processed)
                + stats.frames_processed as u64,
            passes_completed: previous.map_or(0, |p| p.passes_completed) + 1,
            last_pass_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_from_pass() {
        let stats = PassStats {
            frames_processed: 10,
            frames_rejected: 2,
            elapsed: Duration::from_millis(500),
        };

        let metrics = StreamMetrics::from_pass(&stats, 3, None);
        assert!((metrics.avg_frame_latency_ms - 50.0).abs() < 1e-9);
        assert!((metrics.frames_per_second - 20.0).abs() < 1e-9);
        assert!((metrics.error_rate - 20.0).abs() < 1e-9);
        assert_eq!(metrics.backlog_depth, 3);
        assert_eq!(metrics.total_frames_processed, 10);
        assert_eq!(metrics.passes_completed, 1);

        let next = StreamMetrics::from_pass(&stats, 0, Some(&metrics));
        assert_eq!(next.total_frames_processed, 20);
        assert_eq!(next.passes_completed, 2);
    }

    #[test]
    fn test_metrics_guard_against_zero() {
        let metrics = StreamMetrics::from_pass(&PassStats::default(), 0, None);
        assert!(metrics.avg_frame_latency_ms.abs() < f64::EPSILON);
        assert!(metrics.frames_per_second.abs() < f64::EPSILON);
        assert!(metrics.error_rate.abs() < f64::EPSILON);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(StreamProcessingState::Retrying.as_str(), "retrying");
        assert_eq!(StreamProcessingState::Failed.as_str(), "failed");
    }
}
