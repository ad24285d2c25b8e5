//! Ingest Controller error types.
//!
//! Validation and admission failures are returned synchronously to the caller
//! that registered or routed a stream. Processing failures never are: they are
//! observable only through pipeline events and per-stream metrics.

use thiserror::Error;

/// Ingest Controller error type.
///
/// Each variant maps to a bounded `kind()` label for the
/// `ingest_errors_total` metric:
/// - `Validation`: `validation` (malformed stream, never retried)
/// - `Admission`: `admission` (policy-excluded stream, never retried)
/// - `Processing`: `processing` (enhancer failure, retried with backoff)
/// - `StreamNotFound`: `not_found`
/// - `Draining`, `Config`, `Internal`: `internal`
#[derive(Debug, Error)]
pub enum IngestError {
    /// Stream description failed structural validation.
    #[error("Stream validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    /// A named admission rule rejected the stream.
    #[error("Admission rule failed: {rule}")]
    Admission { rule: String },

    /// The enhancement stage failed.
    #[error("Processing error: {0}")]
    Processing(String),

    /// Operation referenced an unknown stream.
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Coordinator is shutting down.
    #[error("Ingest controller is draining")]
    Draining,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (actor channel failures).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Returns the error kind label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            IngestError::Validation { .. } => "validation",
            IngestError::Admission { .. } => "admission",
            IngestError::Processing(_) => "processing",
            IngestError::StreamNotFound(_) => "not_found",
            IngestError::Draining | IngestError::Config(_) | IngestError::Internal(_) => {
                "internal"
            }
        }
    }

    /// Whether the pipeline retries this error on its own.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Processing(_))
    }
}

/// Error returned by an [`Enhancer`](crate::enhancer::Enhancer) for one batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnhanceError {
    /// Some frames in the batch could not be enhanced; the pass continues and
    /// the count feeds the stream's error rate.
    #[error("{count} frame(s) rejected by enhancer")]
    FramesRejected { count: usize },

    /// The enhancer failed outright; the pass ends and is retried.
    #[error("Enhancer failed: {0}")]
    Failed(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            IngestError::Validation {
                errors: vec!["missing user_id".to_string()]
            }
            .kind(),
            "validation"
        );
        assert_eq!(
            IngestError::Admission {
                rule: "has_frames".to_string()
            }
            .kind(),
            "admission"
        );
        assert_eq!(
            IngestError::Processing("boom".to_string()).kind(),
            "processing"
        );
        assert_eq!(
            IngestError::StreamNotFound("stream-1".to_string()).kind(),
            "not_found"
        );
        assert_eq!(IngestError::Draining.kind(), "internal");
        assert_eq!(IngestError::Config("bad".to_string()).kind(), "internal");
        assert_eq!(
            IngestError::Internal("channel closed".to_string()).kind(),
            "internal"
        );
    }

    #[test]
    fn test_only_processing_errors_are_retryable() {
        assert!(IngestError::Processing("timeout".to_string()).is_retryable());
        assert!(!IngestError::Validation { errors: vec![] }.is_retryable());
        assert!(!IngestError::Admission {
            rule: "resolution_range".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_display_formatting() {
        let err = IngestError::Validation {
            errors: vec![
                "stream_id is required".to_string(),
                "bitrate must be positive".to_string(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Stream validation failed: stream_id is required; bitrate must be positive"
        );

        assert_eq!(
            IngestError::Admission {
                rule: "resolution_range".to_string()
            }
            .to_string(),
            "Admission rule failed: resolution_range"
        );

        assert_eq!(
            EnhanceError::FramesRejected { count: 2 }.to_string(),
            "2 frame(s) rejected by enhancer"
        );
    }
}
