//! # Ingest Test Utilities
//!
//! Shared test utilities for the Ingest Controller.
//!
//! ## Modules
//!
//! - `mock_enhancer` - Scriptable [`Enhancer`](ingest_controller::enhancer::Enhancer)
//!   that records calls and concurrency
//! - `fixtures` - Stream descriptions, frames and a ready-made service
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ingest_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let enhancer = MockEnhancer::builder()
//!         .fail_times(2)
//!         .with_delay(Duration::from_millis(20))
//!         .build();
//!
//!     let (service, events) = test_service(enhancer.clone());
//!     let stream = TestStream::accepted(&service).with_frames(10);
//!
//!     service.register_stream(stream.description()).await.unwrap();
//!     // ...
//! }
//! ```

pub mod fixtures;
pub mod mock_enhancer;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_enhancer::*;
