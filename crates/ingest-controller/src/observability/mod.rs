//! Observability for the Ingest Controller
//!
//! - [`health`] - Liveness, readiness and status endpoints
//! - [`metrics`] - Prometheus metric definitions (ADR-0011)

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState, StatusReport};
pub use metrics::init_metrics_recorder;
