//! Bounded per-stream frame buffer.
//!
//! Each stream gets its own FIFO capped at `capacity` frames. Producers are
//! never blocked: pushing into a full buffer evicts the oldest 30% of the
//! backlog first, trading stale frames for bounded latency.
//!
//! | Threshold | Value | Signal |
//! |-----------|-------|--------|
//! | Low water | ⌊0.3·capacity⌋ | after a pop leaves exactly this many frames |
//! | High water | ⌊0.8·capacity⌋ | after a push leaves exactly this many frames |
//! | Eviction | max(1, ⌊0.3·capacity⌋) | on push at capacity |
//!
//! The stream map sits behind one `RwLock`; each stream's queue has its own
//! `Mutex`, so operations on distinct streams do not contend.

use crate::events::{BufferEvent, EventSink};
use crate::observability::metrics;

use media_protocol::Frame;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of pushing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Always true: a push never rejects a frame.
    pub admitted: bool,
    /// Frames evicted to make room (0 unless the buffer was full).
    pub evicted: usize,
    /// Whether this push brought occupancy to the high water mark.
    pub high_water_reached: bool,
    /// Buffer length after the push.
    pub len: usize,
}

/// Per-stream queue.
#[derive(Debug, Default)]
struct StreamBuffer {
    frames: VecDeque<Frame>,
}

/// Bounded FIFO of frames for every registered stream.
#[derive(Debug)]
pub struct FrameBuffer {
    capacity: usize,
    low_water_mark: usize,
    high_water_mark: usize,
    eviction_count: usize,
    streams: RwLock<HashMap<String, Arc<Mutex<StreamBuffer>>>>,
    events: EventSink,
}

impl FrameBuffer {
    /// Create a buffer holding up to `capacity` frames per stream.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize, events: EventSink) -> Self {
        let capacity = capacity.max(1);
        let low_water_mark = capacity * 3 / 10;
        let high_water_mark = capacity * 8 / 10;

        Self {
            capacity,
            low_water_mark,
            high_water_mark,
            eviction_count: low_water_mark.max(1),
            streams: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Frames held per stream before eviction.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Occupancy that triggers the low water signal on pop.
    #[must_use]
    pub fn low_water_mark(&self) -> usize {
        self.low_water_mark
    }

    /// Occupancy that triggers the high water signal on push.
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Number of streams with a live buffer.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Append a frame, evicting the oldest frames first if the stream is full.
    ///
    /// The stream's buffer is created on its first frame.
    pub fn push(&self, stream_id: &str, frame: Frame) -> PushOutcome {
        let entry = self.entry_or_create(stream_id);
        let mut buffer = entry.lock();

        let mut evicted = 0;
        if buffer.frames.len() >= self.capacity {
            evicted = self.eviction_count.min(buffer.frames.len());
            buffer.frames.drain(..evicted);

            warn!(
                target: "ingest.buffer",
                stream_id = %stream_id,
                evicted,
                capacity = self.capacity,
                "Buffer overflow, evicted oldest frames"
            );
            metrics::record_frames_evicted(evicted);
            self.events.emit(BufferEvent::Overflow {
                stream_id: stream_id.to_string(),
                evicted,
            });
        }

        buffer.frames.push_back(frame);
        let len = buffer.frames.len();
        metrics::record_frames_received(1);

        let high_water_reached = len == self.high_water_mark;
        if high_water_reached {
            debug!(
                target: "ingest.buffer",
                stream_id = %stream_id,
                size = len,
                "High water mark reached"
            );
            metrics::record_watermark("high");
            self.events.emit(BufferEvent::HighWaterMark {
                stream_id: stream_id.to_string(),
                size: len,
            });
        }

        PushOutcome {
            admitted: true,
            evicted,
            high_water_reached,
            len,
        }
    }

    /// Remove and return the oldest frame.
    pub fn pop(&self, stream_id: &str) -> Option<Frame> {
        let entry = self.entry(stream_id)?;
        let mut buffer = entry.lock();

        let frame = buffer.frames.pop_front()?;
        if buffer.frames.len() == self.low_water_mark {
            self.signal_low_water(stream_id, buffer.frames.len());
        }
        Some(frame)
    }

    /// Remove and return up to `max_count` of the oldest frames, oldest first.
    pub fn drain(&self, stream_id: &str, max_count: usize) -> Vec<Frame> {
        let Some(entry) = self.entry(stream_id) else {
            return Vec::new();
        };
        let mut buffer = entry.lock();

        let before = buffer.frames.len();
        let take = max_count.min(before);
        let batch: Vec<Frame> = buffer.frames.drain(..take).collect();
        let after = buffer.frames.len();

        if take > 0 && before > self.low_water_mark && after <= self.low_water_mark {
            self.signal_low_water(stream_id, after);
        }
        batch
    }

    /// Put frames back at the head of a stream's queue, oldest first.
    ///
    /// Only free slots are filled; if newer frames arrived in the meantime the
    /// oldest restored frames are dropped. A removed stream is not recreated.
    /// Returns the number of frames restored.
    pub fn restore(&self, stream_id: &str, frames: Vec<Frame>) -> usize {
        let Some(entry) = self.entry(stream_id) else {
            return 0;
        };
        let mut buffer = entry.lock();

        let free = self.capacity.saturating_sub(buffer.frames.len());
        let skip = frames.len().saturating_sub(free);
        let mut restored = 0;
        for frame in frames.into_iter().skip(skip).rev() {
            buffer.frames.push_front(frame);
            restored += 1;
        }
        restored
    }

    /// Clone the current backlog without removing it.
    #[must_use]
    pub fn snapshot(&self, stream_id: &str) -> Vec<Frame> {
        self.entry(stream_id)
            .map(|entry| entry.lock().frames.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Frames currently buffered for a stream (0 if unknown).
    #[must_use]
    pub fn size(&self, stream_id: &str) -> usize {
        self.entry(stream_id)
            .map_or(0, |entry| entry.lock().frames.len())
    }

    /// Whether a stream has no buffered frames (true if unknown).
    #[must_use]
    pub fn is_empty(&self, stream_id: &str) -> bool {
        self.size(stream_id) == 0
    }

    /// Whether a stream is at capacity (false if unknown).
    #[must_use]
    pub fn is_full(&self, stream_id: &str) -> bool {
        self.size(stream_id) >= self.capacity
    }

    /// Occupancy as a percentage of capacity (0.0 if unknown).
    #[must_use]
    pub fn utilization(&self, stream_id: &str) -> f64 {
        // usize to f64 conversion is exact for realistic buffer sizes
        #[allow(clippy::cast_precision_loss)]
        let percent = self.size(stream_id) as f64 / self.capacity as f64 * 100.0;
        percent
    }

    /// Discard a stream's backlog. Returns the number of frames discarded.
    ///
    /// Idempotent: removing an unknown stream returns 0 and emits nothing.
    pub fn remove(&self, stream_id: &str) -> usize {
        let Some(entry) = self.streams.write().remove(stream_id) else {
            return 0;
        };
        let discarded = entry.lock().frames.len();

        debug!(
            target: "ingest.buffer",
            stream_id = %stream_id,
            discarded,
            "Stream buffer removed"
        );
        self.events.emit(BufferEvent::Removed {
            stream_id: stream_id.to_string(),
            discarded,
        });
        discarded
    }

    fn entry(&self, stream_id: &str) -> Option<Arc<Mutex<StreamBuffer>>> {
        self.streams.read().get(stream_id).cloned()
    }

    fn entry_or_create(&self, stream_id: &str) -> Arc<Mutex<StreamBuffer>> {
        if let Some(entry) = self.entry(stream_id) {
            return entry;
        }
        let mut streams = self.streams.write();
        Arc::clone(streams.entry(stream_id.to_string()).or_default())
    }

    fn signal_low_water(&self, stream_id: &str, size: usize) {
        debug!(
            target: "ingest.buffer",
            stream_id = %stream_id,
            size,
            "Low water mark reached"
        );
        metrics::record_watermark("low");
        self.events.emit(BufferEvent::LowWaterMark {
            stream_id: stream_id.to_string(),
            size,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::events::PipelineEvent;
    use media_protocol::FrameFormat;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn frame(timestamp: u64) -> Frame {
        Frame::new(vec![0u8; 16], timestamp, 640, 480, FrameFormat::I420)
    }

    fn buffer_events(rx: &mut UnboundedReceiver<PipelineEvent>) -> Vec<BufferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::Buffer(e) = event {
                events.push(e);
            }
        }
        events
    }

    #[test]
    fn test_watermarks_for_default_capacity() {
        let buffer = FrameBuffer::new(30, EventSink::disabled());
        assert_eq!(buffer.capacity(), 30);
        assert_eq!(buffer.low_water_mark(), 9);
        assert_eq!(buffer.high_water_mark(), 24);
    }

    #[test]
    fn test_overflow_evicts_oldest_thirty_percent() {
        let (sink, mut rx) = EventSink::channel();
        let buffer = FrameBuffer::new(30, sink);

        for ts in 0..35 {
            let outcome = buffer.push("s1", frame(ts));
            assert!(outcome.admitted);
            assert!(buffer.size("s1") <= 30);
        }

        assert_eq!(buffer.size("s1"), 26);

        let overflows: Vec<_> = buffer_events(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, BufferEvent::Overflow { .. }))
            .collect();
        assert_eq!(
            overflows,
            vec![BufferEvent::Overflow {
                stream_id: "s1".to_string(),
                evicted: 9
            }]
        );

        // Frames 0..9 were evicted; the oldest survivor is frame 9
        assert_eq!(buffer.pop("s1").unwrap().timestamp, 9);
    }

    #[test]
    fn test_size_after_overflow_matches_formula() {
        let buffer = FrameBuffer::new(30, EventSink::disabled());
        for ts in 0..30 {
            buffer.push("s1", frame(ts));
        }
        let outcome = buffer.push("s1", frame(30));

        assert_eq!(outcome.evicted, 9);
        assert_eq!(outcome.len, 30 - 9 + 1);
    }

    #[test]
    fn test_small_capacity_still_bounded() {
        let buffer = FrameBuffer::new(2, EventSink::disabled());
        for ts in 0..10 {
            buffer.push("tiny", frame(ts));
            assert!(buffer.size("tiny") <= 2);
        }
        // Newest frame always survives
        let frames = buffer.drain("tiny", 10);
        assert_eq!(frames.last().unwrap().timestamp, 9);
    }

    #[test]
    fn test_high_water_is_edge_triggered() {
        let (sink, mut rx) = EventSink::channel();
        let buffer = FrameBuffer::new(10, sink);

        let mut reached = Vec::new();
        for ts in 0..10 {
            if buffer.push("s1", frame(ts)).high_water_reached {
                reached.push(buffer.size("s1"));
            }
        }

        // High water = 8, reported once on the push that lands on it
        assert_eq!(reached, vec![8]);
        let highs = buffer_events(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, BufferEvent::HighWaterMark { .. }))
            .count();
        assert_eq!(highs, 1);
    }

    #[test]
    fn test_low_water_on_pop() {
        let (sink, mut rx) = EventSink::channel();
        let buffer = FrameBuffer::new(10, sink);
        for ts in 0..5 {
            buffer.push("s1", frame(ts));
        }
        buffer_events(&mut rx);

        // Low water = 3: popping from 5 -> 4 is silent, 4 -> 3 signals
        buffer.pop("s1");
        assert!(buffer_events(&mut rx).is_empty());
        buffer.pop("s1");
        assert_eq!(
            buffer_events(&mut rx),
            vec![BufferEvent::LowWaterMark {
                stream_id: "s1".to_string(),
                size: 3
            }]
        );
    }

    #[test]
    fn test_drain_is_fifo_and_bounded() {
        let buffer = FrameBuffer::new(30, EventSink::disabled());
        for ts in 0..12 {
            buffer.push("s1", frame(ts));
        }

        let first: Vec<u64> = buffer.drain("s1", 5).iter().map(|f| f.timestamp).collect();
        let second: Vec<u64> = buffer.drain("s1", 5).iter().map(|f| f.timestamp).collect();
        let third: Vec<u64> = buffer.drain("s1", 5).iter().map(|f| f.timestamp).collect();

        assert_eq!(first, vec![0, 1, 2, 3, 4]);
        assert_eq!(second, vec![5, 6, 7, 8, 9]);
        assert_eq!(third, vec![10, 11]);
        assert!(buffer.drain("s1", 5).is_empty());
    }

    #[test]
    fn test_drain_and_pop_preserve_push_order_across_eviction() {
        let buffer = FrameBuffer::new(10, EventSink::disabled());
        let mut seen = Vec::new();

        for ts in 0..40 {
            buffer.push("s1", frame(ts));
            if ts % 7 == 0 {
                if let Some(f) = buffer.pop("s1") {
                    seen.push(f.timestamp);
                }
            }
            if ts % 11 == 0 {
                seen.extend(buffer.drain("s1", 3).iter().map(|f| f.timestamp));
            }
        }
        seen.extend(buffer.drain("s1", 100).iter().map(|f| f.timestamp));

        assert!(
            seen.windows(2).all(|w| w[0] < w[1]),
            "output must be a subsequence of push order: {seen:?}"
        );
    }

    #[test]
    fn test_queries_default_for_unknown_stream() {
        let buffer = FrameBuffer::new(30, EventSink::disabled());
        assert_eq!(buffer.size("missing"), 0);
        assert!(buffer.is_empty("missing"));
        assert!(!buffer.is_full("missing"));
        assert!(buffer.utilization("missing").abs() < f64::EPSILON);
        assert!(buffer.pop("missing").is_none());
        assert!(buffer.drain("missing", 5).is_empty());
        assert!(buffer.snapshot("missing").is_empty());
    }

    #[test]
    fn test_is_full_and_utilization() {
        let buffer = FrameBuffer::new(4, EventSink::disabled());
        buffer.push("s1", frame(0));
        assert!((buffer.utilization("s1") - 25.0).abs() < f64::EPSILON);

        for ts in 1..4 {
            buffer.push("s1", frame(ts));
        }
        assert!(buffer.is_full("s1"));
        assert!((buffer.utilization("s1") - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (sink, mut rx) = EventSink::channel();
        let buffer = FrameBuffer::new(30, sink);
        for ts in 0..7 {
            buffer.push("s1", frame(ts));
        }
        buffer_events(&mut rx);

        assert_eq!(buffer.remove("s1"), 7);
        assert_eq!(buffer.remove("s1"), 0);
        assert_eq!(buffer.stream_count(), 0);
        assert_eq!(
            buffer_events(&mut rx),
            vec![BufferEvent::Removed {
                stream_id: "s1".to_string(),
                discarded: 7
            }]
        );
    }

    #[test]
    fn test_streams_are_isolated() {
        let buffer = FrameBuffer::new(5, EventSink::disabled());
        for ts in 0..20 {
            buffer.push("noisy", frame(ts));
        }
        buffer.push("quiet", frame(0));

        assert_eq!(buffer.size("quiet"), 1);
        assert!(buffer.size("noisy") <= 5);
        assert_eq!(buffer.stream_count(), 2);
    }

    #[test]
    fn test_restore_puts_frames_back_in_order() {
        let buffer = FrameBuffer::new(30, EventSink::disabled());
        for ts in 0..8 {
            buffer.push("s1", frame(ts));
        }

        let batch = buffer.drain("s1", 5);
        assert_eq!(buffer.restore("s1", batch), 5);

        let order: Vec<u64> = buffer.drain("s1", 30).iter().map(|f| f.timestamp).collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_restore_respects_capacity_and_removal() {
        let buffer = FrameBuffer::new(4, EventSink::disabled());
        for ts in 0..4 {
            buffer.push("s1", frame(ts));
        }
        let batch = buffer.drain("s1", 2);
        buffer.push("s1", frame(4));

        // One free slot: only the newer of the two restored frames fits
        assert_eq!(buffer.restore("s1", batch), 1);
        assert_eq!(buffer.size("s1"), 4);
        assert_eq!(buffer.pop("s1").unwrap().timestamp, 1);

        buffer.remove("s1");
        assert_eq!(buffer.restore("s1", vec![frame(9)]), 0);
        assert_eq!(buffer.stream_count(), 0);
    }

    #[test]
    fn test_snapshot_does_not_consume() {
        let buffer = FrameBuffer::new(30, EventSink::disabled());
        buffer.push("s1", frame(1));
        buffer.push("s1", frame(2));

        assert_eq!(buffer.snapshot("s1").len(), 2);
        assert_eq!(buffer.size("s1"), 2);
    }
}
