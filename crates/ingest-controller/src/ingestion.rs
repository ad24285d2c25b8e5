//! Ingestion service façade.
//!
//! The entry point for producers and the transport. It allocates stream IDs,
//! validates stream descriptions, registers frames with the [`FrameBuffer`],
//! routes streams through the [`StreamRouter`] into the coordinator, and tears
//! everything down on disconnect.
//!
//! Session maps (connections, issued IDs, user to stream, registered streams)
//! sit behind one `RwLock` that is never held across an `.await`. A user's
//! slot is claimed and the displaced stream detached under a single write
//! lock; the displaced stream's buffer, admission and job are released after.

use crate::actors::{
    EnqueueOutcome, ProcessingCoordinatorHandle, ProcessingStatus, StreamMetrics,
};
use crate::buffer::{FrameBuffer, PushOutcome};
use crate::config::Config;
use crate::connection::{Connection, ConnectionEvent, ConnectionState};
use crate::enhancer::Enhancer;
use crate::errors::IngestError;
use crate::events::{EventSink, IngestionEvent};
use crate::observability::metrics;
use crate::router::StreamRouter;

use chrono::{DateTime, Utc};
use media_protocol::{Frame, StreamConfig, StreamDescription};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Priority given to a stream on first routing.
pub const DEFAULT_PRIORITY: u32 = 1;

/// Highest accepted frame rate.
pub const MAX_FRAME_RATE: u32 = 120;

/// Resolution above which validation warns about performance.
pub const PERFORMANCE_WARNING_RESOLUTION: (u32, u32) = (1920, 1080);

/// Outcome of structural validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Buffer occupancy for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BufferStatus {
    pub size: usize,
    pub capacity: usize,
    pub utilization_percent: f64,
}

#[derive(Debug, Clone)]
struct RegisteredStream {
    user_id: String,
    config: StreamConfig,
    registered_at: DateTime<Utc>,
    /// Overflows seen before the stream had a job to escalate.
    pending_escalations: u32,
}

/// Result of claiming a user's slot.
struct Claim {
    superseded: Option<(String, RegisteredStream)>,
    active: usize,
}

#[derive(Debug, Default)]
struct Sessions {
    connections: HashMap<String, Connection>,
    /// Issued by `accept_stream`, not yet added or torn down.
    accepted: HashSet<String>,
    /// One live stream per user.
    user_streams: HashMap<String, String>,
    streams: HashMap<String, RegisteredStream>,
}

/// Accepts, registers, routes and tears down streams.
pub struct IngestionService {
    buffer: Arc<FrameBuffer>,
    router: Arc<StreamRouter>,
    coordinator: ProcessingCoordinatorHandle,
    sessions: RwLock<Sessions>,
    events: EventSink,
}

impl std::fmt::Debug for IngestionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionService")
            .field("active_streams", &self.active_stream_count())
            .field("processing", &self.processing_status())
            .finish_non_exhaustive()
    }
}

impl IngestionService {
    /// Build the buffer, router and coordinator from configuration.
    ///
    /// Must be called from within a Tokio runtime (spawns the coordinator).
    #[must_use]
    pub fn new(config: &Config, enhancer: Arc<dyn Enhancer>, events: EventSink) -> Self {
        let buffer = Arc::new(FrameBuffer::new(config.buffer_capacity, events.clone()));
        let router = Arc::new(StreamRouter::new(events.clone()));
        let coordinator = ProcessingCoordinatorHandle::new(
            config.ingest_id.clone(),
            config.coordinator_config(),
            Arc::clone(&buffer),
            Arc::clone(&router),
            enhancer,
            events.clone(),
        );

        Self {
            buffer,
            router,
            coordinator,
            sessions: RwLock::new(Sessions::default()),
            events,
        }
    }

    /// Allocate a stream ID for a connection.
    ///
    /// Frames and config arrive later with the stream description.
    pub fn accept_stream(&self, connection_id: &str) -> String {
        let stream_id = format!("stream-{}", uuid::Uuid::new_v4());

        {
            let mut sessions = self.sessions.write();
            let connection = sessions
                .connections
                .entry(connection_id.to_string())
                .or_insert_with(|| Connection::new(connection_id));
            connection.state = ConnectionState::Connected;
            let replaced = connection.stream_id.replace(stream_id.clone());
            if let Some(replaced) = replaced {
                sessions.accepted.remove(&replaced);
            }
            sessions.accepted.insert(stream_id.clone());
        }

        info!(
            target: "ingest.service",
            connection_id = %connection_id,
            stream_id = %stream_id,
            "Stream accepted"
        );
        self.events.emit(IngestionEvent::StreamAccepted {
            stream_id: stream_id.clone(),
            connection_id: connection_id.to_string(),
        });
        stream_id
    }

    /// Structural validation, independent of admission rules.
    #[must_use]
    pub fn validate(&self, description: &StreamDescription) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if description.stream_id.is_none() {
            errors.push("stream_id is required".to_string());
        }
        if description.user_id.is_none() {
            errors.push("user_id is required".to_string());
        }

        match &description.config {
            None => errors.push("config is required".to_string()),
            Some(config) => {
                if config.width == 0 {
                    errors.push("width must be greater than zero".to_string());
                }
                if config.height == 0 {
                    errors.push("height must be greater than zero".to_string());
                }
                if config.frame_rate == 0 || config.frame_rate > MAX_FRAME_RATE {
                    errors.push(format!(
                        "frame_rate must be in (0, {MAX_FRAME_RATE}], got {}",
                        config.frame_rate
                    ));
                }
                if config.bitrate == 0 {
                    errors.push("bitrate must be greater than zero".to_string());
                }

                let (max_w, max_h) = PERFORMANCE_WARNING_RESOLUTION;
                if config.width > max_w || config.height > max_h {
                    warnings.push(format!(
                        "resolution {}x{} exceeds {max_w}x{max_h}; processing may lag",
                        config.width, config.height
                    ));
                }
            }
        }

        if description.frames.is_empty() {
            warnings.push("no frames supplied".to_string());
        }

        ValidationReport {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Validate and register a stream, superseding the user's previous one.
    ///
    /// The stream ID must have been issued by [`Self::accept_stream`] and not
    /// torn down since, or already belong to the same user. Overflow while
    /// buffering the initial frames is escalated once the stream is routed.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Validation` listing every structural problem, or
    /// naming the ownership conflict for the stream ID.
    #[instrument(skip_all, fields(stream_id = ?description.stream_id()))]
    pub async fn add_stream(&self, description: StreamDescription) -> Result<String, IngestError> {
        let report = self.validate(&description);
        let (Some(stream_id), Some(user_id), Some(config), true) = (
            description.stream_id,
            description.user_id,
            description.config,
            report.is_valid,
        ) else {
            metrics::record_error("add_stream", "validation");
            return Err(IngestError::Validation {
                errors: report.errors,
            });
        };

        for warning in &report.warnings {
            debug!(target: "ingest.service", stream_id = %stream_id, warning = %warning, "Validation warning");
        }

        let frames = description.frames.len();
        let claim = self
            .claim_stream(&stream_id, &user_id, config, description.frames)
            .inspect_err(|_| metrics::record_error("add_stream", "validation"))?;
        metrics::set_streams_active(claim.active);

        if let Some((previous, registered)) = claim.superseded {
            info!(
                target: "ingest.service",
                user_id = %user_id,
                previous_stream_id = %previous,
                stream_id = %stream_id,
                "Superseding previous stream for user"
            );
            self.release(&previous, Some(registered), claim.active).await;
        }

        info!(
            target: "ingest.service",
            stream_id = %stream_id,
            user_id = %user_id,
            frames,
            width = config.width,
            height = config.height,
            "Stream added"
        );
        self.events.emit(IngestionEvent::StreamAdded {
            stream_id: stream_id.clone(),
            user_id,
            frames,
        });
        Ok(stream_id)
    }

    /// Register `stream_id` to `user_id` and buffer its frames under one
    /// write lock, detaching whatever stream the user had before.
    fn claim_stream(
        &self,
        stream_id: &str,
        user_id: &str,
        config: StreamConfig,
        frames: Vec<Frame>,
    ) -> Result<Claim, IngestError> {
        let mut sessions = self.sessions.write();

        let owner = sessions
            .streams
            .get(stream_id)
            .map(|existing| existing.user_id.clone());
        let ownership_error = match owner {
            Some(owner) if owner != user_id => Some("stream_id is registered to another user"),
            Some(_) => None,
            None if sessions.accepted.remove(stream_id) => None,
            None => Some("stream_id was not issued or has been torn down"),
        };
        if let Some(error) = ownership_error {
            warn!(
                target: "ingest.service",
                stream_id = %stream_id,
                user_id = %user_id,
                error,
                "Stream ID refused"
            );
            return Err(IngestError::Validation {
                errors: vec![error.to_string()],
            });
        }

        let superseded = sessions
            .user_streams
            .insert(user_id.to_string(), stream_id.to_string())
            .filter(|previous| previous != stream_id)
            .and_then(|previous| {
                let registered = sessions.streams.remove(&previous)?;
                Some((previous, registered))
            });

        // Buffered while the lock is held so a concurrent supersede cannot
        // leave frames behind for a detached stream
        let mut overflows = 0u32;
        for frame in frames {
            if self.buffer.push(stream_id, frame).evicted > 0 {
                overflows = overflows.saturating_add(1);
            }
        }

        let entry = sessions
            .streams
            .entry(stream_id.to_string())
            .or_insert_with(|| RegisteredStream {
                user_id: user_id.to_string(),
                config,
                registered_at: Utc::now(),
                pending_escalations: 0,
            });
        entry.config = config;
        entry.pending_escalations = entry.pending_escalations.saturating_add(overflows);

        Ok(Claim {
            superseded,
            active: sessions.streams.len(),
        })
    }

    /// Run admission rules, admit at [`DEFAULT_PRIORITY`] and enqueue.
    ///
    /// # Errors
    ///
    /// - `IngestError::StreamNotFound` if the stream is not registered
    /// - `IngestError::Admission` naming the failed rule
    /// - `IngestError::Internal` if the coordinator is gone
    pub async fn route_to_processor(&self, stream_id: &str) -> Result<EnqueueOutcome, IngestError> {
        let result = self.try_route(stream_id).await;
        if let Err(e) = &result {
            metrics::record_error("route_to_processor", e.kind());
        }
        result
    }

    async fn try_route(&self, stream_id: &str) -> Result<EnqueueOutcome, IngestError> {
        let registered = self
            .sessions
            .read()
            .streams
            .get(stream_id)
            .cloned()
            .ok_or_else(|| IngestError::StreamNotFound(stream_id.to_string()))?;

        let description = StreamDescription::new(
            stream_id,
            registered.user_id,
            registered.config,
            self.buffer.snapshot(stream_id),
        );
        self.router.evaluate(&description)?;

        let priority = self.router.admit(stream_id, DEFAULT_PRIORITY);
        let outcome = self.coordinator.enqueue(stream_id, priority).await?;

        let escalations = {
            let mut sessions = self.sessions.write();
            sessions
                .streams
                .get_mut(stream_id)
                .map(|entry| std::mem::take(&mut entry.pending_escalations))
        };
        let Some(escalations) = escalations else {
            // Torn down while routing
            self.router.withdraw(stream_id);
            self.coordinator.remove(stream_id).await?;
            return Err(IngestError::StreamNotFound(stream_id.to_string()));
        };
        for _ in 0..escalations {
            self.coordinator.escalate(stream_id).await?;
        }

        debug!(
            target: "ingest.service",
            stream_id = %stream_id,
            priority,
            outcome = ?outcome,
            "Stream routed to processor"
        );
        Ok(outcome)
    }

    /// Add and route a stream in one step.
    ///
    /// # Errors
    ///
    /// Any error from [`Self::add_stream`] or [`Self::route_to_processor`].
    /// A stream that fails admission stays registered.
    pub async fn register_stream(&self, description: StreamDescription) -> Result<String, IngestError> {
        let stream_id = self.add_stream(description).await?;
        self.route_to_processor(&stream_id).await?;
        Ok(stream_id)
    }

    /// Buffer a live frame for a registered stream.
    ///
    /// Overflow escalates the stream's priority; an admitted stream is
    /// re-enqueued so it keeps being serviced.
    ///
    /// # Errors
    ///
    /// `IngestError::StreamNotFound` if the stream is not registered.
    pub async fn push_frame(&self, stream_id: &str, frame: Frame) -> Result<PushOutcome, IngestError> {
        let outcome = {
            let sessions = self.sessions.read();
            if !sessions.streams.contains_key(stream_id) {
                metrics::record_error("push_frame", "not_found");
                return Err(IngestError::StreamNotFound(stream_id.to_string()));
            }
            self.buffer.push(stream_id, frame)
        };
        if outcome.evicted > 0 {
            self.coordinator.escalate(stream_id).await?;
        }
        if let Some(priority) = self.router.priority_of(stream_id) {
            self.coordinator.enqueue(stream_id, priority).await?;
        }
        Ok(outcome)
    }

    /// Remove a stream from sessions, buffer, router and coordinator.
    ///
    /// Idempotent and infallible: unknown streams are ignored.
    pub async fn handle_disconnection(&self, stream_id: &str) {
        let (registered, active) = {
            let mut sessions = self.sessions.write();
            sessions.accepted.remove(stream_id);
            let registered = sessions.streams.remove(stream_id);
            if let Some(entry) = &registered {
                if sessions.user_streams.get(&entry.user_id).map(String::as_str) == Some(stream_id)
                {
                    sessions.user_streams.remove(&entry.user_id);
                }
            }
            (registered, sessions.streams.len())
        };
        self.release(stream_id, registered, active).await;
    }

    /// Drop a detached stream's buffer, admission and coordinator state.
    async fn release(&self, stream_id: &str, registered: Option<RegisteredStream>, active: usize) {
        let discarded = self.buffer.remove(stream_id);
        let withdrawn = self.router.withdraw(stream_id);
        if let Err(e) = self.coordinator.remove(stream_id).await {
            warn!(
                target: "ingest.service",
                stream_id = %stream_id,
                error = %e,
                "Coordinator unavailable during disconnection"
            );
        }

        let Some(registered) = registered else {
            return;
        };
        metrics::set_streams_active(active);

        info!(
            target: "ingest.service",
            stream_id = %stream_id,
            user_id = %registered.user_id,
            discarded,
            withdrawn,
            lifetime_secs = (Utc::now() - registered.registered_at).num_seconds(),
            "Stream removed"
        );
        self.events.emit(IngestionEvent::StreamRemoved {
            stream_id: stream_id.to_string(),
        });
    }

    /// Apply one transport event.
    ///
    /// Returns the stream ID allocated for an `Established` connection.
    pub async fn handle_connection_event(&self, event: ConnectionEvent) -> Option<String> {
        match event {
            ConnectionEvent::Established { connection_id } => {
                Some(self.accept_stream(&connection_id))
            }
            ConnectionEvent::Closed {
                connection_id,
                stream_id,
                reason,
            } => {
                let known = self
                    .sessions
                    .write()
                    .connections
                    .remove(&connection_id)
                    .and_then(|conn| conn.stream_id);

                debug!(
                    target: "ingest.service",
                    connection_id = %connection_id,
                    state = reason.final_state().as_str(),
                    "Connection closed"
                );

                if let Some(stream_id) = stream_id.or(known) {
                    self.handle_disconnection(&stream_id).await;
                }
                None
            }
        }
    }

    /// Drive [`Self::handle_connection_event`] from a channel until it closes
    /// or `cancel_token` fires.
    pub async fn run_connection_events(
        &self,
        mut receiver: mpsc::Receiver<ConnectionEvent>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                event = receiver.recv() => match event {
                    Some(event) => {
                        self.handle_connection_event(event).await;
                    }
                    None => break,
                },
            }
        }
        debug!(target: "ingest.service", "Connection event loop stopped");
    }

    /// Stop the coordinator, waiting up to `deadline` for in-flight passes.
    ///
    /// # Errors
    ///
    /// `IngestError::Internal` if the coordinator already stopped.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), IngestError> {
        self.coordinator.shutdown(deadline).await
    }

    #[must_use]
    pub fn active_stream_count(&self) -> usize {
        self.sessions.read().streams.len()
    }

    #[must_use]
    pub fn buffer_status(&self, stream_id: &str) -> BufferStatus {
        BufferStatus {
            size: self.buffer.size(stream_id),
            capacity: self.buffer.capacity(),
            utilization_percent: self.buffer.utilization(stream_id),
        }
    }

    #[must_use]
    pub fn processing_status(&self) -> ProcessingStatus {
        self.coordinator.status()
    }

    #[must_use]
    pub fn stream_metrics(&self, stream_id: &str) -> Option<StreamMetrics> {
        self.coordinator.stream_metrics(stream_id)
    }

    #[must_use]
    pub fn connection(&self, connection_id: &str) -> Option<Connection> {
        self.sessions.read().connections.get(connection_id).cloned()
    }

    #[must_use]
    pub fn stream_for_user(&self, user_id: &str) -> Option<String> {
        self.sessions.read().user_streams.get(user_id).cloned()
    }

    #[must_use]
    pub fn is_registered(&self, stream_id: &str) -> bool {
        self.sessions.read().streams.contains_key(stream_id)
    }

    /// Router, for adding or removing admission rules.
    #[must_use]
    pub fn router(&self) -> &Arc<StreamRouter> {
        &self.router
    }

    #[must_use]
    pub fn coordinator(&self) -> &ProcessingCoordinatorHandle {
        &self.coordinator
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::enhancer::PassthroughEnhancer;
    use crate::events::PipelineEvent;
    use media_protocol::FrameFormat;

    fn test_config() -> Config {
        let vars = HashMap::from([("INGEST_ID".to_string(), "ingest-unit".to_string())]);
        Config::from_vars(&vars).unwrap()
    }

    fn service() -> IngestionService {
        IngestionService::new(
            &test_config(),
            Arc::new(PassthroughEnhancer),
            EventSink::disabled(),
        )
    }

    fn config(width: u32, height: u32) -> StreamConfig {
        StreamConfig {
            width,
            height,
            frame_rate: 30,
            bitrate: 2_500_000,
            audio_enabled: true,
        }
    }

    fn frames(count: u64) -> Vec<Frame> {
        (0..count)
            .map(|ts| Frame::new(vec![0u8; 8], ts * 33_333, 640, 480, FrameFormat::I420))
            .collect()
    }

    fn description(stream_id: &str, user_id: &str, count: u64) -> StreamDescription {
        StreamDescription::new(stream_id, user_id, config(640, 480), frames(count))
    }

    /// Description for a freshly accepted stream ID.
    fn accepted(svc: &IngestionService, user_id: &str, count: u64) -> StreamDescription {
        let stream_id = svc.accept_stream(&format!("conn-{}", uuid::Uuid::new_v4()));
        description(&stream_id, user_id, count)
    }

    #[tokio::test]
    async fn test_validate_accepts_well_formed_stream() {
        let svc = service();
        let report = svc.validate(&description("s1", "u1", 3));
        assert!(report.is_valid);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_validate_reports_missing_fields() {
        let svc = service();
        let report = svc.validate(&StreamDescription::default());

        assert!(!report.is_valid);
        assert_eq!(
            report.errors,
            vec![
                "stream_id is required",
                "user_id is required",
                "config is required"
            ]
        );
        assert_eq!(report.warnings, vec!["no frames supplied"]);
    }

    #[tokio::test]
    async fn test_validate_config_bounds() {
        let svc = service();
        let mut desc = description("s1", "u1", 1);
        desc.config = Some(StreamConfig {
            width: 0,
            height: 0,
            frame_rate: 121,
            bitrate: 0,
            audio_enabled: false,
        });

        let report = svc.validate(&desc);
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 4);

        desc.config = Some(StreamConfig {
            frame_rate: 120,
            ..config(640, 480)
        });
        assert!(svc.validate(&desc).is_valid);
    }

    #[tokio::test]
    async fn test_validate_warns_on_large_resolution() {
        let svc = service();
        let mut desc = description("s1", "u1", 1);
        desc.config = Some(config(3840, 2160));

        let report = svc.validate(&desc);
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("3840x2160"));
    }

    #[tokio::test]
    async fn test_accept_stream_tracks_connection() {
        let (sink, mut rx) = EventSink::channel();
        let svc = IngestionService::new(&test_config(), Arc::new(PassthroughEnhancer), sink);

        let stream_id = svc.accept_stream("conn-1");
        assert!(stream_id.starts_with("stream-"));
        assert_ne!(svc.accept_stream("conn-2"), stream_id);

        let conn = svc.connection("conn-1").unwrap();
        assert_eq!(conn.state, ConnectionState::Connected);
        assert_eq!(conn.stream_id.as_deref(), Some(stream_id.as_str()));

        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineEvent::Ingestion(IngestionEvent::StreamAccepted {
                stream_id,
                connection_id: "conn-1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_add_stream_rejects_invalid() {
        let svc = service();
        let mut desc = description("s1", "u1", 3);
        desc.user_id = None;

        let err = svc.add_stream(desc).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation { errors } if errors == vec!["user_id is required"]));
        assert_eq!(svc.active_stream_count(), 0);
        assert_eq!(svc.buffer_status("s1").size, 0);
    }

    #[tokio::test]
    async fn test_add_stream_buffers_frames() {
        let svc = service();
        let desc = accepted(&svc, "u1", 6);
        let issued = desc.stream_id.clone().unwrap();
        let stream_id = svc.add_stream(desc).await.unwrap();

        assert_eq!(stream_id, issued);
        assert_eq!(svc.active_stream_count(), 1);
        assert_eq!(svc.stream_for_user("u1").as_deref(), Some(issued.as_str()));

        let status = svc.buffer_status(&stream_id);
        assert_eq!(status.size, 6);
        assert_eq!(status.capacity, 30);
        assert!((status.utilization_percent - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_new_stream_supersedes_same_user() {
        let svc = service();
        let old = svc.add_stream(accepted(&svc, "u1", 4)).await.unwrap();
        let new = svc.add_stream(accepted(&svc, "u1", 2)).await.unwrap();

        assert_eq!(svc.active_stream_count(), 1);
        assert_eq!(svc.stream_for_user("u1"), Some(new));
        assert!(!svc.is_registered(&old));
        assert_eq!(svc.buffer_status(&old).size, 0);
    }

    #[tokio::test]
    async fn test_concurrent_adds_leave_one_stream_per_user() {
        let svc = service();
        svc.add_stream(accepted(&svc, "u1", 2)).await.unwrap();

        let first = accepted(&svc, "u1", 3);
        let second = accepted(&svc, "u1", 3);
        let (a, b) = tokio::join!(svc.add_stream(first), svc.add_stream(second));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(svc.active_stream_count(), 1);
        let live = svc.stream_for_user("u1").unwrap();
        assert!(live == a || live == b);
        assert!(svc.is_registered(&live));
        let displaced = if live == a { &b } else { &a };
        assert!(!svc.is_registered(displaced));
        assert_eq!(svc.buffer_status(displaced).size, 0);
    }

    #[tokio::test]
    async fn test_add_stream_rejects_unissued_id() {
        let svc = service();
        let err = svc.add_stream(description("s1", "u1", 3)).await.unwrap_err();

        assert!(matches!(
            err,
            IngestError::Validation { ref errors } if errors[0].contains("not issued")
        ));
        assert_eq!(svc.active_stream_count(), 0);
        assert_eq!(svc.buffer_status("s1").size, 0);
    }

    #[tokio::test]
    async fn test_add_stream_rejects_torn_down_id() {
        let svc = service();
        let stream_id = svc.add_stream(accepted(&svc, "u1", 2)).await.unwrap();
        svc.handle_disconnection(&stream_id).await;

        let err = svc
            .add_stream(description(&stream_id, "u1", 2))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation { .. }));
        assert!(!svc.is_registered(&stream_id));

        // Accepted but never added counts as torn down once disconnected
        let pending = svc.accept_stream("conn-late");
        svc.handle_disconnection(&pending).await;
        assert!(svc.add_stream(description(&pending, "u2", 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_add_stream_rejects_other_users_stream() {
        let svc = service();
        let stream_id = svc.add_stream(accepted(&svc, "u2", 2)).await.unwrap();

        let err = svc
            .add_stream(description(&stream_id, "u1", 3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::Validation { ref errors } if errors[0].contains("another user")
        ));
        assert_eq!(svc.stream_for_user("u2").as_deref(), Some(stream_id.as_str()));
        assert!(svc.stream_for_user("u1").is_none());
        assert_eq!(svc.buffer_status(&stream_id).size, 2);

        // u1's own stream must not tear down u2's
        svc.add_stream(accepted(&svc, "u1", 1)).await.unwrap();
        assert!(svc.is_registered(&stream_id));
    }

    #[tokio::test]
    async fn test_owner_can_add_frames_to_own_stream() {
        let svc = service();
        let stream_id = svc.add_stream(accepted(&svc, "u1", 2)).await.unwrap();
        svc.add_stream(description(&stream_id, "u1", 3)).await.unwrap();

        assert_eq!(svc.active_stream_count(), 1);
        assert_eq!(svc.buffer_status(&stream_id).size, 5);
    }

    #[tokio::test]
    async fn test_reaccept_on_connection_retires_unused_id() {
        let svc = service();
        let first = svc.accept_stream("conn-1");
        let second = svc.accept_stream("conn-1");

        assert!(svc.add_stream(description(&first, "u1", 1)).await.is_err());
        assert_eq!(svc.add_stream(description(&second, "u1", 1)).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_initial_overflow_escalates_on_route() {
        let svc = service();
        svc.coordinator().stop().await.unwrap();

        // 35 frames at capacity 30 overflow once
        let stream_id = svc.add_stream(accepted(&svc, "u1", 35)).await.unwrap();
        assert_eq!(svc.buffer_status(&stream_id).size, 26);

        svc.route_to_processor(&stream_id).await.unwrap();
        let jobs = svc.coordinator().queued_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].priority, DEFAULT_PRIORITY + 1);

        // Escalation is consumed, not repeated on re-route
        svc.route_to_processor(&stream_id).await.unwrap();
        let jobs = svc.coordinator().queued_jobs().await.unwrap();
        assert_eq!(jobs[0].priority, DEFAULT_PRIORITY + 1);
    }

    #[tokio::test]
    async fn test_route_unknown_stream() {
        let svc = service();
        let err = svc.route_to_processor("missing").await.unwrap_err();
        assert!(matches!(err, IngestError::StreamNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_route_rejects_out_of_range_resolution() {
        let svc = service();
        let mut desc = accepted(&svc, "u1", 2);
        desc.config = Some(config(160, 120));
        let tiny = svc.add_stream(desc).await.unwrap();

        let err = svc.route_to_processor(&tiny).await.unwrap_err();
        assert!(matches!(err, IngestError::Admission { rule } if rule == "resolution_range"));
        assert!(!svc.router().is_admitted(&tiny));
    }

    #[tokio::test]
    async fn test_route_admits_at_default_priority() {
        let svc = service();
        svc.coordinator().stop().await.unwrap();
        let s1 = svc.add_stream(accepted(&svc, "u1", 2)).await.unwrap();

        let outcome = svc.route_to_processor(&s1).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Queued);
        assert_eq!(svc.router().priority_of(&s1), Some(DEFAULT_PRIORITY));
        // Round-trip so the actor has published its status
        assert_eq!(svc.coordinator().queued_jobs().await.unwrap().len(), 1);
        assert_eq!(svc.processing_status().queue_depth, 1);
    }

    #[tokio::test]
    async fn test_push_frame_requires_registration() {
        let svc = service();
        let err = svc
            .push_frame("ghost", frames(1).remove(0))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn test_disconnection_is_idempotent() {
        let (sink, mut rx) = EventSink::channel();
        let svc = IngestionService::new(&test_config(), Arc::new(PassthroughEnhancer), sink);
        svc.coordinator().stop().await.unwrap();
        let s1 = svc.register_stream(accepted(&svc, "u1", 3)).await.unwrap();

        svc.handle_disconnection(&s1).await;
        svc.handle_disconnection(&s1).await;

        assert_eq!(svc.active_stream_count(), 0);
        assert!(svc.stream_for_user("u1").is_none());
        assert_eq!(svc.buffer_status(&s1).size, 0);
        assert!(!svc.router().is_admitted(&s1));
        assert!(svc.coordinator().queued_jobs().await.unwrap().is_empty());

        let mut removed = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PipelineEvent::Ingestion(IngestionEvent::StreamRemoved { .. })) {
                removed += 1;
            }
        }
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_connection_events_drive_lifecycle() {
        let svc = service();

        let stream_id = svc
            .handle_connection_event(ConnectionEvent::Established {
                connection_id: "conn-1".to_string(),
            })
            .await
            .unwrap();
        svc.add_stream(description(&stream_id, "u1", 2)).await.unwrap();

        // Stream ID omitted: resolved through the connection
        let result = svc
            .handle_connection_event(ConnectionEvent::Closed {
                connection_id: "conn-1".to_string(),
                stream_id: None,
                reason: crate::connection::CloseReason::Failed,
            })
            .await;

        assert!(result.is_none());
        assert!(svc.connection("conn-1").is_none());
        assert!(!svc.is_registered(&stream_id));
    }

    #[tokio::test]
    async fn test_run_connection_events_stops_on_cancel() {
        let svc = Arc::new(service());
        let (tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();

        let runner = {
            let svc = Arc::clone(&svc);
            let token = token.clone();
            tokio::spawn(async move { svc.run_connection_events(rx, token).await })
        };

        tx.send(ConnectionEvent::Established {
            connection_id: "conn-9".to_string(),
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while svc.connection("conn-9").is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        runner.await.unwrap();
    }
}
