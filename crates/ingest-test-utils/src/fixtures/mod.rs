//! Pre-configured test data for Ingest Controller testing.
//!
//! Provides builders and test data for:
//! - Frames and stream descriptions
//! - Configuration with test-friendly overrides
//! - A wired-up `IngestionService` with an observable event channel

use ingest_controller::config::Config;
use ingest_controller::enhancer::Enhancer;
use ingest_controller::events::{EventSink, PipelineEvent};
use ingest_controller::ingestion::IngestionService;
use media_protocol::{Frame, FrameFormat, StreamConfig, StreamDescription};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Microseconds between frames at 30 fps.
pub const FRAME_INTERVAL_US: u64 = 33_333;

/// A small I420 frame at 640x480.
#[must_use]
pub fn test_frame(index: u64) -> Frame {
    Frame::new(
        bytes::Bytes::from(vec![0u8; 16]),
        index * FRAME_INTERVAL_US,
        640,
        480,
        FrameFormat::I420,
    )
}

/// `count` consecutive test frames.
#[must_use]
pub fn test_frames(count: u64) -> Vec<Frame> {
    (0..count).map(test_frame).collect()
}

/// Test stream fixture.
#[derive(Debug, Clone)]
pub struct TestStream {
    /// Stream ID.
    pub stream_id: String,
    /// Owning user.
    pub user_id: String,
    /// Stream configuration.
    pub config: StreamConfig,
    /// Frames supplied at registration.
    pub frames: u64,
}

impl TestStream {
    /// 640x480 at 30 fps, owned by `user-<stream_id>`, with no frames.
    #[must_use]
    pub fn new(stream_id: impl Into<String>) -> Self {
        let stream_id = stream_id.into();
        Self {
            user_id: format!("user-{stream_id}"),
            stream_id,
            config: StreamConfig {
                width: 640,
                height: 480,
                frame_rate: 30,
                bitrate: 2_500_000,
                audio_enabled: true,
            },
            frames: 0,
        }
    }

    /// Create a test stream with a random ID.
    #[must_use]
    pub fn random() -> Self {
        Self::new(format!("stream-{}", Uuid::new_v4()))
    }

    /// Test stream on an ID issued by `service` for a fresh connection.
    #[must_use]
    pub fn accepted(service: &IngestionService) -> Self {
        Self::new(service.accept_stream(&format!("conn-{}", Uuid::new_v4())))
    }

    /// The stream ID, for service queries.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    #[must_use]
    pub fn with_frames(mut self, frames: u64) -> Self {
        self.frames = frames;
        self
    }

    #[must_use]
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.config.width = width;
        self.config.height = height;
        self
    }

    #[must_use]
    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.config.frame_rate = frame_rate;
        self
    }

    /// Build the description handed to the service.
    #[must_use]
    pub fn description(&self) -> StreamDescription {
        StreamDescription::new(
            self.stream_id.clone(),
            self.user_id.clone(),
            self.config,
            test_frames(self.frames),
        )
    }
}

/// Config with defaults plus the given `INGEST_*` overrides.
#[must_use]
pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = HashMap::from([(
        "INGEST_ID".to_string(),
        "ingest-test".to_string(),
    )]);
    for (key, value) in overrides {
        vars.insert((*key).to_string(), (*value).to_string());
    }
    Config::from_vars(&vars).expect("test config should be valid")
}

/// Service on default config with an observable event channel.
#[must_use]
pub fn test_service(
    enhancer: Arc<dyn Enhancer>,
) -> (Arc<IngestionService>, mpsc::UnboundedReceiver<PipelineEvent>) {
    test_service_with(&test_config(&[]), enhancer)
}

/// Service on the given config with an observable event channel.
#[must_use]
pub fn test_service_with(
    config: &Config,
    enhancer: Arc<dyn Enhancer>,
) -> (Arc<IngestionService>, mpsc::UnboundedReceiver<PipelineEvent>) {
    let (sink, events) = EventSink::channel();
    let service = Arc::new(IngestionService::new(config, enhancer, sink));
    (service, events)
}

/// Everything currently sitting in the event channel.
pub fn drain_events(events: &mut mpsc::UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
