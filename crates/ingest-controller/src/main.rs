//! Ingest Controller
//!
//! Buffers live video frames per stream and drives them through the
//! enhancement stage with bounded concurrency.
//!
//! # Servers
//!
//! - HTTP server for health, status and metrics (default: 0.0.0.0:8082)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder (ADR-0011)
//! 3. Build the ingestion service (buffer, router, coordinator)
//! 4. Spawn pipeline event logging and the connection event loop
//! 5. Start health HTTP server (liveness, readiness, status, metrics)
//! 6. Wait for shutdown signal, then drain

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use ingest_controller::config::Config;
use ingest_controller::connection::ConnectionEvent;
use ingest_controller::enhancer::PassthroughEnhancer;
use ingest_controller::events::{BufferEvent, EventSink, PipelineEvent, ProcessingEvent};
use ingest_controller::ingestion::IngestionService;
use ingest_controller::observability::{health_router, init_metrics_recorder, HealthState};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Connection events buffered between the transport and the service.
const CONNECTION_EVENT_BUFFER: usize = 256;

/// How long in-flight passes get to finish on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingest_controller=debug,ingest=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Ingest Controller");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        ingest_id = %config.ingest_id,
        health_bind_address = %config.health_bind_address,
        buffer_capacity = config.buffer_capacity,
        max_concurrent_streams = config.max_concurrent_streams,
        batch_size = config.batch_size,
        max_retries = config.max_retries,
        retry_base_delay_ms = config.retry_base_delay_ms,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder (ADR-0011)
    // This must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let shutdown_token = CancellationToken::new();

    // Pipeline events go to the log
    let (events, event_rx) = EventSink::channel();
    let event_log_token = shutdown_token.child_token();
    tokio::spawn(async move {
        log_pipeline_events(event_rx, event_log_token).await;
    });

    info!("Initializing ingestion service...");
    let service = Arc::new(IngestionService::new(
        &config,
        Arc::new(PassthroughEnhancer),
        events,
    ));
    info!("Ingestion service initialized");

    // The transport feeds this channel; the sender lives until shutdown
    let (connection_tx, connection_rx) = mpsc::channel::<ConnectionEvent>(CONNECTION_EVENT_BUFFER);
    let connection_token = shutdown_token.child_token();
    let connection_service = Arc::clone(&service);
    tokio::spawn(async move {
        connection_service
            .run_connection_events(connection_rx, connection_token)
            .await;
    });

    let health_state = Arc::new(HealthState::new(Arc::clone(&service)));

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    // Add /metrics endpoint served by Prometheus exporter
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let app = health_router(Arc::clone(&health_state))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    info!("Ingest Controller running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Fail readiness first so traffic drains
    health_state.set_draining();
    drop(connection_tx);

    if let Err(e) = service.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Coordinator shutdown error");
    }

    shutdown_token.cancel();

    info!("Ingest Controller shutdown complete");
    Ok(())
}

/// Log pipeline events until cancelled or every sink is dropped.
///
/// Failures and overflow are warnings; the rest is debug noise.
async fn log_pipeline_events(
    mut receiver: mpsc::UnboundedReceiver<PipelineEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel_token.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match &event {
            PipelineEvent::Processing(ProcessingEvent::Failed {
                stream_id,
                retry_count,
                error,
            }) => {
                warn!(
                    target: "ingest.events",
                    stream_id = %stream_id,
                    retry_count,
                    error = %error,
                    "Stream processing failed permanently"
                );
            }
            PipelineEvent::Buffer(BufferEvent::Overflow {
                stream_id,
                evicted,
            }) => {
                warn!(
                    target: "ingest.events",
                    stream_id = %stream_id,
                    evicted,
                    "Frame buffer overflow"
                );
            }
            other => debug!(target: "ingest.events", event = ?other, "Pipeline event"),
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
