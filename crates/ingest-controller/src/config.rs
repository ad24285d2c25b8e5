//! Ingest Controller configuration.
//!
//! Configuration is loaded from environment variables with defaults matching
//! the pipeline's documented behaviour (30-frame buffers, 5 concurrent passes,
//! 3 retries with 2s/4s/8s backoff).

use crate::actors::CoordinatorConfig;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8082";

/// Default per-stream frame buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 30;

/// Default number of streams processed concurrently.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 5;

/// Default frames drained per enhancer call.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Default retry attempts before a stream fails terminally.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry base delay in milliseconds (delay = base * 2^attempt).
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;

/// Default scheduler poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Default pause between batches within a pass, in milliseconds.
pub const DEFAULT_BATCH_YIELD_MS: u64 = 1;

/// Default ingest instance ID prefix.
pub const DEFAULT_INGEST_ID_PREFIX: &str = "ingest";

/// Ingest Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Health endpoint bind address (default: "0.0.0.0:8082").
    pub health_bind_address: String,

    /// Unique identifier for this ingest instance.
    pub ingest_id: String,

    /// Frames held per stream before the oldest are evicted.
    pub buffer_capacity: usize,

    /// Maximum streams inside the enhancement stage at once.
    pub max_concurrent_streams: usize,

    /// Frames handed to the enhancer per call.
    pub batch_size: usize,

    /// Retry attempts after a failed pass.
    pub max_retries: u32,

    /// Base delay for exponential retry backoff in milliseconds.
    pub retry_base_delay_ms: u64,

    /// Scheduler poll interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Pause between batches within a pass in milliseconds (0 = yield only).
    pub batch_yield_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let health_bind_address = vars
            .get("INGEST_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let buffer_capacity = vars
            .get("INGEST_BUFFER_CAPACITY")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BUFFER_CAPACITY);

        let max_concurrent_streams = vars
            .get("INGEST_MAX_CONCURRENT_STREAMS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONCURRENT_STREAMS);

        let batch_size = vars
            .get("INGEST_BATCH_SIZE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BATCH_SIZE);

        let max_retries = vars
            .get("INGEST_MAX_RETRIES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let retry_base_delay_ms = vars
            .get("INGEST_RETRY_BASE_DELAY_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS);

        let poll_interval_ms = vars
            .get("INGEST_POLL_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let batch_yield_ms = vars
            .get("INGEST_BATCH_YIELD_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BATCH_YIELD_MS);

        for (name, value) in [
            ("INGEST_BUFFER_CAPACITY", buffer_capacity as u64),
            ("INGEST_MAX_CONCURRENT_STREAMS", max_concurrent_streams as u64),
            ("INGEST_BATCH_SIZE", batch_size as u64),
            ("INGEST_POLL_INTERVAL_MS", poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        // Generate ingest instance ID
        let ingest_id = vars.get("INGEST_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INGEST_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            health_bind_address,
            ingest_id,
            buffer_capacity,
            max_concurrent_streams,
            batch_size,
            max_retries,
            retry_base_delay_ms,
            poll_interval_ms,
            batch_yield_ms,
        })
    }

    /// Scheduling parameters for the processing coordinator.
    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_concurrent_streams: self.max_concurrent_streams,
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_yield: Duration::from_millis(self.batch_yield_ms),
        }
    }
}
