//! Typed pipeline notifications.
//!
//! Each component emits its own narrow event type through an [`EventSink`]
//! handed to it at construction. The sink wraps an optional unbounded
//! `mpsc` sender; there is no global bus, and a disabled sink drops events.
//!
//! Events are for monitoring and tests, not a wire protocol.

use crate::actors::StreamMetrics;
use std::time::Duration;
use tokio::sync::mpsc;

/// Notifications from the ingestion façade.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestionEvent {
    /// A stream ID was allocated for a new connection.
    StreamAccepted {
        stream_id: String,
        connection_id: String,
    },
    /// A validated stream was registered with the buffer.
    StreamAdded {
        stream_id: String,
        user_id: String,
        frames: usize,
    },
    /// A stream was torn down.
    StreamRemoved { stream_id: String },
}

/// Notifications from the frame buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    /// The oldest frames were evicted to make room.
    Overflow { stream_id: String, evicted: usize },
    /// Occupancy rose to the high water mark.
    HighWaterMark { stream_id: String, size: usize },
    /// Occupancy fell to the low water mark.
    LowWaterMark { stream_id: String, size: usize },
    /// A stream's backlog was discarded.
    Removed { stream_id: String, discarded: usize },
}

/// Notifications from the stream router.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    /// A stream was admitted or its priority raised.
    Admitted { stream_id: String, priority: u32 },
    /// The best-known next candidate after an admission.
    SchedulingHint { next_candidate: Option<String> },
    /// An admission rule rejected a stream.
    RuleFailed { stream_id: String, rule: String },
    /// A stream's admission was withdrawn.
    Withdrawn { stream_id: String },
}

/// Notifications from the processing coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingEvent {
    /// A job entered the processing queue.
    JobQueued { stream_id: String, priority: u32 },
    /// A job (or active pass) was removed with its stream.
    JobRemoved { stream_id: String },
    /// Buffer overflow raised a stream's priority.
    PriorityEscalated { stream_id: String, priority: u32 },
    /// A pass started.
    Started { stream_id: String },
    /// A pass drained the backlog successfully.
    Completed {
        stream_id: String,
        frames_processed: usize,
    },
    /// A pass failed and will be retried after `delay`.
    Retrying {
        stream_id: String,
        retry_count: u32,
        delay: Duration,
        error: String,
    },
    /// Retries are exhausted; no further automatic attempts.
    Failed {
        stream_id: String,
        retry_count: u32,
        error: String,
    },
    /// Metrics computed at the end of a completed pass.
    MetricsSnapshot {
        stream_id: String,
        metrics: StreamMetrics,
    },
}

/// Any pipeline notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Ingestion(IngestionEvent),
    Buffer(BufferEvent),
    Router(RouterEvent),
    Processing(ProcessingEvent),
}

impl From<IngestionEvent> for PipelineEvent {
    fn from(event: IngestionEvent) -> Self {
        PipelineEvent::Ingestion(event)
    }
}

impl From<BufferEvent> for PipelineEvent {
    fn from(event: BufferEvent) -> Self {
        PipelineEvent::Buffer(event)
    }
}

impl From<RouterEvent> for PipelineEvent {
    fn from(event: RouterEvent) -> Self {
        PipelineEvent::Router(event)
    }
}

impl From<ProcessingEvent> for PipelineEvent {
    fn from(event: ProcessingEvent) -> Self {
        PipelineEvent::Processing(event)
    }
}

/// Destination for pipeline events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl EventSink {
    /// Create a sink that forwards to `sender`.
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Create a sink and the receiver that observes it.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Create a sink that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Emit an event. Never blocks; a closed receiver is ignored.
    pub fn emit(&self, event: impl Into<PipelineEvent>) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event.into());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_forwards_events() {
        let (sink, mut rx) = EventSink::channel();

        sink.emit(BufferEvent::Overflow {
            stream_id: "s1".to_string(),
            evicted: 9,
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            PipelineEvent::Buffer(BufferEvent::Overflow {
                stream_id: "s1".to_string(),
                evicted: 9
            })
        );
    }

    #[test]
    fn test_disabled_sink_drops_events() {
        let sink = EventSink::disabled();
        // Must not panic
        sink.emit(RouterEvent::Withdrawn {
            stream_id: "s1".to_string(),
        });
    }

    #[test]
    fn test_sink_survives_closed_receiver() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(IngestionEvent::StreamRemoved {
            stream_id: "s1".to_string(),
        });
    }
}
