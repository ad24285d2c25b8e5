//! Video frame types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Pixel or bitstream format of a frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    /// Planar YUV 4:2:0
    I420,
    /// Semi-planar YUV 4:2:0
    Nv12,
    /// Packed 24-bit RGB
    Rgb24,
    /// Packed 32-bit RGBA
    Rgba,
    /// JPEG-compressed still
    Jpeg,
    /// H.264 access unit
    H264,
}

impl FrameFormat {
    /// Returns the format tag as a string (for logging and metric labels)
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            FrameFormat::I420 => "i420",
            FrameFormat::Nv12 => "nv12",
            FrameFormat::Rgb24 => "rgb24",
            FrameFormat::Rgba => "rgba",
            FrameFormat::Jpeg => "jpeg",
            FrameFormat::H264 => "h264",
        }
    }
}

/// A single captured video frame
///
/// Timestamps are microseconds on the producer's clock. They are expected to be
/// non-decreasing within a stream; the pipeline relies on producer order and
/// does not validate them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw frame payload
    pub payload: Bytes,
    /// Capture timestamp in microseconds
    pub timestamp: u64,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Payload format
    pub format: FrameFormat,
}

impl Frame {
    /// Create a new frame
    #[must_use]
    pub fn new(
        payload: impl Into<Bytes>,
        timestamp: u64,
        width: u32,
        height: u32,
        format: FrameFormat,
    ) -> Self {
        Self {
            payload: payload.into(),
            timestamp,
            width,
            height,
            format,
        }
    }

    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
