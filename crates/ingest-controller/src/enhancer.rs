//! Enhancement stage boundary.
//!
//! The enhancement algorithm itself lives outside this crate. The coordinator
//! calls [`Enhancer::enhance`] once per drained batch and interprets the
//! result:
//!
//! - `Ok(())`: the batch is done.
//! - `Err(EnhanceError::FramesRejected { count })`: the pass continues; the
//!   rejected frames raise the stream's error rate.
//! - `Err(EnhanceError::Failed(_))`: the pass ends and is retried with backoff.

use crate::errors::EnhanceError;

use async_trait::async_trait;
use media_protocol::Frame;

/// An opaque, possibly failing frame transformation.
#[async_trait]
pub trait Enhancer: Send + Sync {
    /// Enhance one batch of frames for a stream, oldest first.
    async fn enhance(&self, stream_id: &str, frames: &[Frame]) -> Result<(), EnhanceError>;
}

/// Enhancer that accepts every batch unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEnhancer;

#[async_trait]
impl Enhancer for PassthroughEnhancer {
    async fn enhance(&self, _stream_id: &str, _frames: &[Frame]) -> Result<(), EnhanceError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use media_protocol::FrameFormat;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_passthrough_accepts_batches() {
        let enhancer: Arc<dyn Enhancer> = Arc::new(PassthroughEnhancer);
        let frames = vec![Frame::new(vec![0u8; 4], 0, 640, 480, FrameFormat::Nv12)];

        assert!(enhancer.enhance("s1", &frames).await.is_ok());
        assert!(enhancer.enhance("s1", &[]).await.is_ok());
    }
}
