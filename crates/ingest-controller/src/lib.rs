//! Ingest Controller Library
//!
//! Core of the live video ingestion pipeline:
//!
//! - Per-stream bounded frame buffering with overflow eviction and watermarks
//! - Admission rules and priority tracking for streams awaiting enhancement
//! - Prioritized, concurrency-capped enhancement passes with retry backoff
//! - Connection lifecycle handling and per-stream processing metrics
//!
//! # Architecture
//!
//! ```text
//! IngestionService (façade)
//! ├── FrameBuffer      per-stream FIFO, shared with passes
//! ├── StreamRouter     admission rules + priorities
//! └── ProcessingCoordinatorHandle
//!     └── ProcessingCoordinatorActor
//!         └── N pass tasks -> Enhancer
//! ```
//!
//! Components report through typed [`events`] rather than a shared bus.
//!
//! # Modules
//!
//! - [`actors`] - Processing coordinator actor and pass tasks
//! - [`buffer`] - Per-stream frame buffer
//! - [`config`] - Service configuration from environment
//! - [`connection`] - Transport connection records and events
//! - [`enhancer`] - The enhancement seam
//! - [`errors`] - Error types with metric labels
//! - [`events`] - Typed pipeline notifications
//! - [`ingestion`] - Ingestion service façade
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`router`] - Admission rules and stream priorities

pub mod actors;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod enhancer;
pub mod errors;
pub mod events;
pub mod ingestion;
pub mod observability;
pub mod router;
