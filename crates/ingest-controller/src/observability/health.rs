//! Health and status endpoints for the Ingest Controller
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (is the coordinator dispatching passes?)
//! - `GET /status` - JSON snapshot of processing state
//!
//! The `/metrics` endpoint is merged in by `main` from the Prometheus handle.

use crate::actors::ProcessingStatus;
use crate::ingestion::IngestionService;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Probe state shared with the HTTP handlers.
///
/// Readiness is derived: the service must be attached, the coordinator must
/// be running, and shutdown must not have begun.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    draining: AtomicBool,
    service: Option<Arc<IngestionService>>,
}

impl HealthState {
    /// State with no service attached; never ready.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            live: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            service: None,
        }
    }

    #[must_use]
    pub fn new(service: Arc<IngestionService>) -> Self {
        Self {
            service: Some(service),
            ..Self::detached()
        }
    }

    /// Fail readiness ahead of shutdown so traffic drains first.
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.draining.load(Ordering::SeqCst)
            && self
                .service
                .as_ref()
                .is_some_and(|svc| svc.processing_status().running)
    }

    fn report(&self) -> Option<StatusReport> {
        self.service.as_ref().map(|svc| StatusReport {
            ready: self.is_ready(),
            active_streams: svc.active_stream_count(),
            processing: svc.processing_status(),
        })
    }
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub ready: bool,
    pub active_streams: usize,
    pub processing: ProcessingStatus,
}

/// Create the health router with liveness, readiness and status endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .route("/status", get(status_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status_handler(
    State(state): State<Arc<HealthState>>,
) -> Result<Json<StatusReport>, StatusCode> {
    state.report().map(Json).ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::enhancer::PassthroughEnhancer;
    use crate::events::EventSink;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::util::ServiceExt;

    fn service() -> Arc<IngestionService> {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        Arc::new(IngestionService::new(
            &config,
            Arc::new(PassthroughEnhancer),
            EventSink::disabled(),
        ))
    }

    async fn get_status(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app
            .oneshot(request)
            .await
            .expect("Failed to execute request");
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[test]
    fn test_detached_state_is_live_not_ready() {
        let state = HealthState::detached();
        assert!(state.is_live());
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_ready_follows_coordinator() {
        let svc = service();
        let state = HealthState::new(Arc::clone(&svc));
        assert!(state.is_ready());

        svc.coordinator().stop().await.unwrap();
        assert!(!state.is_ready());

        svc.coordinator().start().await.unwrap();
        assert!(state.is_ready());
    }

    #[tokio::test]
    async fn test_draining_fails_readiness() {
        let state = HealthState::new(service());
        state.set_draining();
        assert!(!state.is_ready());
        assert!(state.is_live());
    }

    #[tokio::test]
    async fn test_health_router_probes() {
        let state = Arc::new(HealthState::new(service()));
        let app = health_router(Arc::clone(&state));

        let (status, _) = get_status(app.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get_status(app.clone(), "/ready").await;
        assert_eq!(status, StatusCode::OK);

        state.set_draining();
        let (status, _) = get_status(app.clone(), "/ready").await;
        assert_eq!(
            status,
            StatusCode::SERVICE_UNAVAILABLE,
            "/ready should return 503 while draining"
        );

        let (status, _) = get_status(app, "/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_endpoint_reports_processing() {
        let app = health_router(Arc::new(HealthState::new(service())));

        let (status, body) = get_status(app, "/status").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ready"], true);
        assert_eq!(json["active_streams"], 0);
        assert_eq!(json["processing"]["running"], true);
        assert_eq!(json["processing"]["max_concurrent_streams"], 5);
    }

    #[tokio::test]
    async fn test_status_endpoint_unavailable_when_detached() {
        let app = health_router(Arc::new(HealthState::detached()));
        let (status, _) = get_status(app, "/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
