//! Mock enhancer for Ingest Controller testing.
//!
//! Can be configured to:
//! - Succeed, fail every call, or fail the first N calls
//! - Reject a number of frames per batch
//! - Fail only for specific streams
//! - Hold each call for a delay, so concurrency is observable
//!
//! Every call is recorded along with the peak number of concurrent calls and
//! whether any stream was ever enhanced by two calls at once.
//!
//! # Example
//!
//! ```rust,ignore
//! use ingest_test_utils::MockEnhancer;
//!
//! let enhancer = MockEnhancer::builder()
//!     .fail_times(1)
//!     .with_delay(Duration::from_millis(50))
//!     .build();
//!
//! // ... run the pipeline ...
//! assert_eq!(enhancer.call_count(), 2);
//! assert!(enhancer.max_in_flight() <= 5);
//! ```

use async_trait::async_trait;
use ingest_controller::enhancer::Enhancer;
use ingest_controller::errors::EnhanceError;
use media_protocol::Frame;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What the mock does on each call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnhancerBehavior {
    AlwaysSucceed,
    AlwaysFail(String),
    /// Fail the first `n` calls, then succeed.
    FailTimes(u32),
    /// Report `n` rejected frames on every call.
    RejectFrames(usize),
}

/// One recorded `enhance` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhanceCall {
    pub stream_id: String,
    pub timestamps: Vec<u64>,
}

/// Scriptable enhancer for pipeline tests.
#[derive(Debug)]
pub struct MockEnhancer {
    behavior: EnhancerBehavior,
    failing_streams: Mutex<HashSet<String>>,
    delay: Duration,
    failures: AtomicU32,
    calls: Mutex<Vec<EnhanceCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    per_stream: Mutex<HashMap<String, usize>>,
    overlapped: Mutex<HashSet<String>>,
}

impl MockEnhancer {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> MockEnhancerBuilder {
        MockEnhancerBuilder::default()
    }

    /// Mock that always succeeds with no delay.
    #[must_use]
    pub fn succeeding() -> Arc<Self> {
        Self::builder().build()
    }

    /// All recorded calls, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<EnhanceCall> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls made for one stream.
    #[must_use]
    pub fn calls_for(&self, stream_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.stream_id == stream_id)
            .count()
    }

    /// Total frames handed to the mock for one stream.
    #[must_use]
    pub fn frames_for(&self, stream_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.stream_id == stream_id)
            .map(|c| c.timestamps.len())
            .sum()
    }

    /// Streams in the order their first call arrived.
    #[must_use]
    pub fn stream_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for call in self.calls.lock().iter() {
            if !order.contains(&call.stream_id) {
                order.push(call.stream_id.clone());
            }
        }
        order
    }

    /// Calls currently executing.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Peak number of concurrent calls.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Streams that were ever enhanced by two calls at once.
    #[must_use]
    pub fn overlapping_streams(&self) -> HashSet<String> {
        self.overlapped.lock().clone()
    }

    /// Fail every later call for `stream_id`, for IDs only known once the
    /// service is running.
    pub fn poison(&self, stream_id: impl Into<String>) {
        self.failing_streams.lock().insert(stream_id.into());
    }

    fn enter(&self, stream_id: &str) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut per_stream = self.per_stream.lock();
        let count = per_stream.entry(stream_id.to_string()).or_insert(0);
        *count += 1;
        if *count > 1 {
            self.overlapped.lock().insert(stream_id.to_string());
        }
    }

    fn exit(&self, stream_id: &str) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let mut per_stream = self.per_stream.lock();
        if let Some(count) = per_stream.get_mut(stream_id) {
            *count = count.saturating_sub(1);
        }
    }

    fn outcome(&self, stream_id: &str) -> Result<(), EnhanceError> {
        if self.failing_streams.lock().contains(stream_id) {
            return Err(EnhanceError::Failed(format!("{stream_id} is poisoned")));
        }

        match &self.behavior {
            EnhancerBehavior::AlwaysSucceed => Ok(()),
            EnhancerBehavior::AlwaysFail(message) => Err(EnhanceError::Failed(message.clone())),
            EnhancerBehavior::FailTimes(n) => {
                let failed = self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                        (f < *n).then_some(f + 1)
                    })
                    .is_ok();
                if failed {
                    Err(EnhanceError::Failed("transient enhancer failure".to_string()))
                } else {
                    Ok(())
                }
            }
            EnhancerBehavior::RejectFrames(count) => {
                Err(EnhanceError::FramesRejected { count: *count })
            }
        }
    }
}

#[async_trait]
impl Enhancer for MockEnhancer {
    async fn enhance(&self, stream_id: &str, frames: &[Frame]) -> Result<(), EnhanceError> {
        self.calls.lock().push(EnhanceCall {
            stream_id: stream_id.to_string(),
            timestamps: frames.iter().map(|f| f.timestamp).collect(),
        });

        self.enter(stream_id);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.exit(stream_id);

        self.outcome(stream_id)
    }
}

/// Builder for [`MockEnhancer`].
#[derive(Debug)]
pub struct MockEnhancerBuilder {
    behavior: EnhancerBehavior,
    failing_streams: HashSet<String>,
    delay: Duration,
}

impl Default for MockEnhancerBuilder {
    fn default() -> Self {
        Self {
            behavior: EnhancerBehavior::AlwaysSucceed,
            failing_streams: HashSet::new(),
            delay: Duration::ZERO,
        }
    }
}

impl MockEnhancerBuilder {
    #[must_use]
    pub fn behavior(mut self, behavior: EnhancerBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    #[must_use]
    pub fn always_fail(self, message: impl Into<String>) -> Self {
        self.behavior(EnhancerBehavior::AlwaysFail(message.into()))
    }

    #[must_use]
    pub fn fail_times(self, n: u32) -> Self {
        self.behavior(EnhancerBehavior::FailTimes(n))
    }

    #[must_use]
    pub fn reject_frames(self, count: usize) -> Self {
        self.behavior(EnhancerBehavior::RejectFrames(count))
    }

    /// Fail every call for `stream_id`, regardless of behavior.
    #[must_use]
    pub fn fail_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.failing_streams.insert(stream_id.into());
        self
    }

    /// Hold each call for `delay` (virtual time under a paused clock).
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<MockEnhancer> {
        Arc::new(MockEnhancer {
            behavior: self.behavior,
            failing_streams: Mutex::new(self.failing_streams),
            delay: self.delay,
            failures: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            per_stream: Mutex::new(HashMap::new()),
            overlapped: Mutex::new(HashSet::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::test_frames;

    #[tokio::test]
    async fn test_fail_times_then_succeed() {
        let enhancer = MockEnhancer::builder().fail_times(2).build();
        let frames = test_frames(3);

        assert!(enhancer.enhance("s1", &frames).await.is_err());
        assert!(enhancer.enhance("s1", &frames).await.is_err());
        assert!(enhancer.enhance("s1", &frames).await.is_ok());
        assert_eq!(enhancer.call_count(), 3);
        assert_eq!(enhancer.frames_for("s1"), 9);
    }

    #[tokio::test]
    async fn test_failing_stream_overrides_behavior() {
        let enhancer = MockEnhancer::builder().fail_stream("bad").build();
        let frames = test_frames(1);

        assert!(enhancer.enhance("good", &frames).await.is_ok());
        assert!(matches!(
            enhancer.enhance("bad", &frames).await,
            Err(EnhanceError::Failed(_))
        ));
        assert_eq!(enhancer.stream_order(), vec!["good", "bad"]);
    }

    #[tokio::test]
    async fn test_poison_applies_to_later_calls() {
        let enhancer = MockEnhancer::succeeding();
        let frames = test_frames(1);

        assert!(enhancer.enhance("s1", &frames).await.is_ok());
        enhancer.poison("s1");
        assert!(enhancer.enhance("s1", &frames).await.is_err());
        assert!(enhancer.enhance("s2", &frames).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracks_concurrency_and_overlap() {
        let enhancer = MockEnhancer::builder()
            .with_delay(Duration::from_millis(10))
            .build();
        let frames = test_frames(1);

        let (a, b, c) = tokio::join!(
            enhancer.enhance("s1", &frames),
            enhancer.enhance("s1", &frames),
            enhancer.enhance("s2", &frames),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());

        assert_eq!(enhancer.max_in_flight(), 3);
        assert_eq!(enhancer.in_flight(), 0);
        assert!(enhancer.overlapping_streams().contains("s1"));
        assert!(!enhancer.overlapping_streams().contains("s2"));
    }
}
