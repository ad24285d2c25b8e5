//! Stream configuration and producer-supplied stream descriptions.

use crate::frame::Frame;
use serde::{Deserialize, Serialize};

/// Encoding parameters declared by the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub frame_rate: u32,
    /// Target bitrate in bits per second
    pub bitrate: u64,
    /// Whether the stream carries audio
    pub audio_enabled: bool,
}

impl StreamConfig {
    /// Total pixels per frame
    #[must_use]
    pub const fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// The first description a producer sends for a stream
///
/// Identity and config are optional so that missing fields can be reported
/// by validation instead of failing deserialization.
#[derive(Debug, Clone, Default)]
pub struct StreamDescription {
    /// Stream identifier allocated at acceptance
    pub stream_id: Option<String>,
    /// Producer identity
    pub user_id: Option<String>,
    /// Declared encoding parameters
    pub config: Option<StreamConfig>,
    /// Initial frames, oldest first
    pub frames: Vec<Frame>,
}

impl StreamDescription {
    /// Create a fully-populated description
    #[must_use]
    pub fn new(
        stream_id: impl Into<String>,
        user_id: impl Into<String>,
        config: StreamConfig,
        frames: Vec<Frame>,
    ) -> Self {
        Self {
            stream_id: Some(stream_id.into()),
            user_id: Some(user_id.into()),
            config: Some(config),
            frames,
        }
    }

    /// Stream ID, if present
    #[must_use]
    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// User ID, if present
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserializes_from_producer_json() {
        let json = r#"{"width":1280,"height":720,"frame_rate":30,"bitrate":2500000,"audio_enabled":true}"#;
        let config: StreamConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.width, 1280);
        assert_eq!(config.pixel_count(), 921_600);
        assert!(config.audio_enabled);
    }

    #[test]
    fn test_default_description_has_no_identity() {
        let description = StreamDescription::default();
        assert!(description.stream_id().is_none());
        assert!(description.user_id().is_none());
        assert!(description.config.is_none());
        assert!(description.frames.is_empty());
    }
}
