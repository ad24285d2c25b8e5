//! `ProcessingCoordinatorActor` - schedules enhancement passes.
//!
//! The coordinator is a singleton actor that owns all scheduling state: the
//! job queue, the per-stream processing records and the active-pass set.
//! Every transition happens inside its message loop, so no stream can be
//! both queued and active, and no more than `max_concurrent_streams` passes
//! run at once.
//!
//! # Scheduling
//!
//! `schedule()` runs after every message and on a poll tick. While running
//! and below the concurrency ceiling, it dispatches the queued job with the
//! highest priority whose stream is admitted, not active and has frames.
//! Ties go to the job queued first.
//!
//! # Retry
//!
//! An enhancer failure re-queues the stream after `base * 2^retry_count`
//! (2s, 4s, 8s with the default 1s base). After `max_retries` the stream is
//! `Failed` and further enqueues are rejected until it is removed.
//!
//! # Graceful Shutdown
//!
//! Cancelling the root token stops dispatch, cancels every pass and retry
//! timer (they hold child tokens), and waits for passes to stop.

use super::messages::{
    CoordinatorEvent, CoordinatorMessage, EnqueueOutcome, PassOutcome, PassStats,
    ProcessingJobInfo, ProcessingStatus, StreamJobInfo, StreamMetrics, StreamProcessingState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::pass::{run_pass, PassContext};

use crate::buffer::FrameBuffer;
use crate::enhancer::Enhancer;
use crate::errors::IngestError;
use crate::events::{EventSink, ProcessingEvent};
use crate::observability::metrics as prom;
use crate::router::StreamRouter;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the coordinator mailbox.
const COORDINATOR_CHANNEL_BUFFER: usize = 1000;

/// How long graceful shutdown waits for each pass when no deadline was given.
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Escalation stops raising priority at this value.
pub const MAX_ESCALATED_PRIORITY: u32 = 10;

/// Scheduling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub max_concurrent_streams: usize,
    /// Frames drained per enhancer call.
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Fallback scheduling interval when no message arrives.
    pub poll_interval: Duration,
    /// Pause between batches within a pass (zero yields only).
    pub batch_yield: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 5,
            batch_size: 5,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            batch_yield: Duration::from_millis(1),
        }
    }
}

impl CoordinatorConfig {
    /// Backoff before retry number `retry_count` (1-based).
    #[must_use]
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(retry_count))
    }
}

/// State published by the actor for synchronous reads.
#[derive(Debug)]
struct CoordinatorShared {
    running: AtomicBool,
    queue_depth: AtomicUsize,
    active_count: AtomicUsize,
    max_concurrent_streams: usize,
    stream_metrics: RwLock<HashMap<String, StreamMetrics>>,
}

/// Handle to the `ProcessingCoordinatorActor`.
///
/// Cloneable; the actor stops once every handle is dropped or the root token
/// is cancelled.
#[derive(Clone)]
pub struct ProcessingCoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    cancel_token: CancellationToken,
    shared: Arc<CoordinatorShared>,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl std::fmt::Debug for ProcessingCoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingCoordinatorHandle")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ProcessingCoordinatorHandle {
    /// Spawn the coordinator and return a handle to it.
    ///
    /// The coordinator starts in the running state.
    #[must_use]
    pub fn new(
        ingest_id: String,
        config: CoordinatorConfig,
        buffer: Arc<FrameBuffer>,
        router: Arc<StreamRouter>,
        enhancer: Arc<dyn Enhancer>,
        events: EventSink,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(COORDINATOR_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let metrics = ActorMetrics::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Coordinator, &ingest_id));
        let shared = Arc::new(CoordinatorShared {
            running: AtomicBool::new(true),
            queue_depth: AtomicUsize::new(0),
            active_count: AtomicUsize::new(0),
            max_concurrent_streams: config.max_concurrent_streams,
            stream_metrics: RwLock::new(HashMap::new()),
        });

        let actor = ProcessingCoordinatorActor::new(
            ingest_id,
            config,
            receiver,
            cancel_token.clone(),
            Collaborators {
                buffer,
                router,
                enhancer,
                events,
            },
            Arc::clone(&shared),
            Arc::clone(&metrics),
            Arc::clone(&mailbox),
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            shared,
            metrics,
            mailbox,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CoordinatorMessage,
    ) -> Result<T, IngestError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| IngestError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| IngestError::Internal(format!("response receive failed: {e}")))
    }

    /// Queue a stream, or raise the priority of its queued job.
    pub async fn enqueue(
        &self,
        stream_id: &str,
        priority: u32,
    ) -> Result<EnqueueOutcome, IngestError> {
        self.request(|respond_to| CoordinatorMessage::Enqueue {
            stream_id: stream_id.to_string(),
            priority,
            respond_to,
        })
        .await
    }

    /// Raise a stream's priority by one, up to [`MAX_ESCALATED_PRIORITY`].
    pub async fn escalate(&self, stream_id: &str) -> Result<Option<u32>, IngestError> {
        self.request(|respond_to| CoordinatorMessage::Escalate {
            stream_id: stream_id.to_string(),
            respond_to,
        })
        .await
    }

    /// Forget a stream: its job, record, metrics, retry timer and any
    /// in-flight pass. Idempotent.
    pub async fn remove(&self, stream_id: &str) -> Result<bool, IngestError> {
        self.request(|respond_to| CoordinatorMessage::Remove {
            stream_id: stream_id.to_string(),
            respond_to,
        })
        .await
    }

    /// Resume dispatching passes.
    pub async fn start(&self) -> Result<(), IngestError> {
        self.request(|respond_to| CoordinatorMessage::Start { respond_to })
            .await
    }

    /// Stop dispatching new passes.
    pub async fn stop(&self) -> Result<(), IngestError> {
        self.request(|respond_to| CoordinatorMessage::Stop { respond_to })
            .await
    }

    /// Queued jobs in queue order.
    pub async fn queued_jobs(&self) -> Result<Vec<ProcessingJobInfo>, IngestError> {
        self.request(|respond_to| CoordinatorMessage::GetQueue { respond_to })
            .await
    }

    /// One stream's processing record, if the coordinator knows it.
    pub async fn stream_state(&self, stream_id: &str) -> Result<Option<StreamJobInfo>, IngestError> {
        self.request(|respond_to| CoordinatorMessage::GetStreamState {
            stream_id: stream_id.to_string(),
            respond_to,
        })
        .await
    }

    /// Initiate graceful shutdown, waiting up to `deadline` per pass.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), IngestError> {
        self.request(|respond_to| CoordinatorMessage::Shutdown {
            deadline,
            respond_to,
        })
        .await?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Deepest mailbox backlog the actor has seen.
    #[must_use]
    pub fn mailbox_peak_depth(&self) -> usize {
        self.mailbox.peak_depth()
    }

    /// Current status, as last published by the actor.
    #[must_use]
    pub fn status(&self) -> ProcessingStatus {
        ProcessingStatus {
            running: self.shared.running.load(Ordering::SeqCst),
            queue_depth: self.shared.queue_depth.load(Ordering::SeqCst),
            active_count: self.shared.active_count.load(Ordering::SeqCst),
            max_concurrent_streams: self.shared.max_concurrent_streams,
        }
    }

    /// Metrics from the stream's last completed pass.
    #[must_use]
    pub fn stream_metrics(&self, stream_id: &str) -> Option<StreamMetrics> {
        self.shared.stream_metrics.read().get(stream_id).cloned()
    }

    /// Lifetime pass counters.
    #[must_use]
    pub fn actor_metrics(&self) -> Arc<ActorMetrics> {
        Arc::clone(&self.metrics)
    }
}

/// Components the coordinator reads from and drives.
struct Collaborators {
    buffer: Arc<FrameBuffer>,
    router: Arc<StreamRouter>,
    enhancer: Arc<dyn Enhancer>,
    events: EventSink,
}

#[derive(Debug)]
struct ProcessingJob {
    stream_id: String,
    priority: u32,
    queued_at: Instant,
    retry_count: u32,
}

#[derive(Debug)]
struct StreamRecord {
    state: StreamProcessingState,
    priority: u32,
    retry_count: u32,
    /// An enqueue arrived while active or retrying.
    requeue: bool,
    retry_token: Option<CancellationToken>,
}

impl StreamRecord {
    fn new(priority: u32) -> Self {
        Self {
            state: StreamProcessingState::Queued,
            priority,
            retry_count: 0,
            requeue: false,
            retry_token: None,
        }
    }
}

struct ActivePass {
    pass_id: u64,
    cancel_token: CancellationToken,
    started_at: Instant,
    /// Taken once the task is observed to have finished.
    task: Option<JoinHandle<()>>,
    /// The stream was removed while the pass was running.
    removed: bool,
}

/// The `ProcessingCoordinatorActor` implementation.
pub struct ProcessingCoordinatorActor {
    ingest_id: String,
    config: CoordinatorConfig,
    receiver: mpsc::Receiver<CoordinatorMessage>,
    internal_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    internal_rx: mpsc::UnboundedReceiver<CoordinatorEvent>,
    cancel_token: CancellationToken,
    buffer: Arc<FrameBuffer>,
    router: Arc<StreamRouter>,
    enhancer: Arc<dyn Enhancer>,
    events: EventSink,
    /// Queued jobs in insertion order.
    jobs: Vec<ProcessingJob>,
    records: HashMap<String, StreamRecord>,
    active: HashMap<String, ActivePass>,
    running: bool,
    accepting: bool,
    next_pass_id: u64,
    shutdown_deadline: Duration,
    shared: Arc<CoordinatorShared>,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl ProcessingCoordinatorActor {
    #[expect(clippy::too_many_arguments)] // Shared state is split for lock-free reads
    fn new(
        ingest_id: String,
        config: CoordinatorConfig,
        receiver: mpsc::Receiver<CoordinatorMessage>,
        cancel_token: CancellationToken,
        collaborators: Collaborators,
        shared: Arc<CoordinatorShared>,
        metrics: Arc<ActorMetrics>,
        mailbox: Arc<MailboxMonitor>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        Self {
            ingest_id,
            config,
            receiver,
            internal_tx,
            internal_rx,
            cancel_token,
            buffer: collaborators.buffer,
            router: collaborators.router,
            enhancer: collaborators.enhancer,
            events: collaborators.events,
            jobs: Vec::new(),
            records: HashMap::new(),
            active: HashMap::new(),
            running: true,
            accepting: true,
            next_pass_id: 0,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            shared,
            metrics,
            mailbox,
        }
    }

    #[instrument(skip_all, name = "ingest.actor.coordinator", fields(ingest_id = %self.ingest_id))]
    async fn run(mut self) {
        info!(
            target: "ingest.actor.coordinator",
            ingest_id = %self.ingest_id,
            max_concurrent_streams = self.config.max_concurrent_streams,
            "ProcessingCoordinatorActor started"
        );

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.publish();

        loop {
            self.check_pass_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "ingest.actor.coordinator",
                        ingest_id = %self.ingest_id,
                        "ProcessingCoordinatorActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    if let Some(message) = msg {
                        self.mailbox.record_received(self.receiver.len() + 1);
                        self.handle_message(message);
                        self.mailbox.record_handled(self.receiver.len());
                        self.metrics.record_message_processed();
                    } else {
                        info!(
                            target: "ingest.actor.coordinator",
                            ingest_id = %self.ingest_id,
                            "ProcessingCoordinatorActor channel closed, exiting"
                        );
                        self.cancel_token.cancel();
                        self.graceful_shutdown().await;
                        break;
                    }
                }

                Some(event) = self.internal_rx.recv() => {
                    self.handle_event(event);
                }

                _ = poll.tick() => {}
            }

            self.schedule();
        }

        info!(
            target: "ingest.actor.coordinator",
            ingest_id = %self.ingest_id,
            jobs_remaining = self.jobs.len(),
            messages_processed = self.mailbox.messages_processed(),
            "ProcessingCoordinatorActor stopped"
        );
    }

    fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::Enqueue {
                stream_id,
                priority,
                respond_to,
            } => {
                let outcome = self.enqueue(&stream_id, priority);
                let _ = respond_to.send(outcome);
            }

            CoordinatorMessage::Escalate {
                stream_id,
                respond_to,
            } => {
                let priority = self.escalate(&stream_id);
                let _ = respond_to.send(priority);
            }

            CoordinatorMessage::Remove {
                stream_id,
                respond_to,
            } => {
                let removed = self.remove(&stream_id);
                let _ = respond_to.send(removed);
            }

            CoordinatorMessage::Start { respond_to } => {
                if self.accepting {
                    self.running = true;
                }
                self.publish();
                let _ = respond_to.send(());
            }

            CoordinatorMessage::Stop { respond_to } => {
                self.running = false;
                self.publish();
                let _ = respond_to.send(());
            }

            CoordinatorMessage::GetQueue { respond_to } => {
                let jobs = self
                    .jobs
                    .iter()
                    .map(|job| ProcessingJobInfo {
                        stream_id: job.stream_id.clone(),
                        priority: job.priority,
                        retry_count: job.retry_count,
                        waiting: job.queued_at.elapsed(),
                    })
                    .collect();
                let _ = respond_to.send(jobs);
            }

            CoordinatorMessage::GetStreamState {
                stream_id,
                respond_to,
            } => {
                let info = self.records.get(&stream_id).map(|record| StreamJobInfo {
                    state: record.state,
                    priority: record.priority,
                    retry_count: record.retry_count,
                });
                let _ = respond_to.send(info);
            }

            CoordinatorMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                info!(
                    target: "ingest.actor.coordinator",
                    ingest_id = %self.ingest_id,
                    active = self.active.len(),
                    queued = self.jobs.len(),
                    "Initiating graceful shutdown"
                );
                self.accepting = false;
                self.running = false;
                self.shutdown_deadline = deadline;
                self.cancel_token.cancel();
                self.publish();
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::PassFinished {
                stream_id,
                pass_id,
                outcome,
            } => self.finish_pass(&stream_id, pass_id, outcome),

            CoordinatorEvent::RetryDue {
                stream_id,
                retry_count,
            } => {
                let due = self.records.get(&stream_id).is_some_and(|record| {
                    record.state == StreamProcessingState::Retrying
                        && record.retry_count == retry_count
                });
                if due {
                    if let Some(record) = self.records.get_mut(&stream_id) {
                        record.retry_token = None;
                    }
                    self.push_job(&stream_id);
                }
            }
        }
    }

    fn enqueue(&mut self, stream_id: &str, priority: u32) -> EnqueueOutcome {
        if !self.accepting {
            return EnqueueOutcome::Rejected;
        }

        let Some(record) = self.records.get_mut(stream_id) else {
            self.records
                .insert(stream_id.to_string(), StreamRecord::new(priority));
            self.push_job(stream_id);
            return EnqueueOutcome::Queued;
        };

        match record.state {
            StreamProcessingState::Failed => EnqueueOutcome::Rejected,
            StreamProcessingState::Active | StreamProcessingState::Retrying => {
                record.priority = record.priority.max(priority);
                record.requeue = true;
                EnqueueOutcome::Deferred
            }
            StreamProcessingState::Queued => {
                record.priority = record.priority.max(priority);
                let effective = record.priority;
                if let Some(job) = self.jobs.iter_mut().find(|j| j.stream_id == stream_id) {
                    job.priority = effective;
                }
                EnqueueOutcome::PriorityUpdated
            }
            StreamProcessingState::Completed => {
                record.priority = record.priority.max(priority);
                self.push_job(stream_id);
                EnqueueOutcome::Queued
            }
        }
    }

    fn escalate(&mut self, stream_id: &str) -> Option<u32> {
        let record = self.records.get_mut(stream_id)?;
        if record.priority < MAX_ESCALATED_PRIORITY {
            record.priority += 1;
        }
        let priority = record.priority;

        if let Some(job) = self.jobs.iter_mut().find(|j| j.stream_id == stream_id) {
            job.priority = priority;
        }

        debug!(
            target: "ingest.actor.coordinator",
            stream_id = %stream_id,
            priority,
            "Priority escalated after overflow"
        );
        self.events.emit(ProcessingEvent::PriorityEscalated {
            stream_id: stream_id.to_string(),
            priority,
        });
        Some(priority)
    }

    fn remove(&mut self, stream_id: &str) -> bool {
        let queued_before = self.jobs.len();
        self.jobs.retain(|j| j.stream_id != stream_id);
        let mut removed = self.jobs.len() != queued_before;

        if let Some(record) = self.records.remove(stream_id) {
            if let Some(token) = record.retry_token {
                token.cancel();
            }
            removed = true;
        }

        if let Some(pass) = self.active.get_mut(stream_id) {
            // Slot is released when the pass reports back
            pass.removed = true;
            pass.cancel_token.cancel();
            removed = true;
        }

        self.shared.stream_metrics.write().remove(stream_id);

        if removed {
            debug!(
                target: "ingest.actor.coordinator",
                stream_id = %stream_id,
                "Stream removed from coordinator"
            );
            self.events.emit(ProcessingEvent::JobRemoved {
                stream_id: stream_id.to_string(),
            });
        }
        removed
    }

    /// Put a known stream back in the queue with its recorded priority.
    fn push_job(&mut self, stream_id: &str) {
        let Some(record) = self.records.get_mut(stream_id) else {
            return;
        };
        record.state = StreamProcessingState::Queued;
        record.requeue = false;
        let priority = record.priority;

        self.jobs.push(ProcessingJob {
            stream_id: stream_id.to_string(),
            priority,
            queued_at: Instant::now(),
            retry_count: record.retry_count,
        });

        debug!(
            target: "ingest.actor.coordinator",
            stream_id = %stream_id,
            priority,
            queue_depth = self.jobs.len(),
            "Job queued"
        );
        self.events.emit(ProcessingEvent::JobQueued {
            stream_id: stream_id.to_string(),
            priority,
        });
    }

    /// Dispatch passes until the ceiling is reached or nothing is eligible.
    fn schedule(&mut self) {
        while self.running && self.active.len() < self.config.max_concurrent_streams {
            let Some(index) = self.next_job_index() else {
                break;
            };
            let job = self.jobs.remove(index);
            self.start_pass(job);
        }
        self.publish();
    }

    /// Highest-priority eligible job; strict `>` keeps the earliest on ties.
    fn next_job_index(&self) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (index, job) in self.jobs.iter().enumerate() {
            if self.active.contains_key(&job.stream_id)
                || !self.router.is_admitted(&job.stream_id)
                || self.buffer.is_empty(&job.stream_id)
            {
                continue;
            }
            if best.map_or(true, |(_, priority)| job.priority > priority) {
                best = Some((index, job.priority));
            }
        }
        best.map(|(index, _)| index)
    }

    fn start_pass(&mut self, job: ProcessingJob) {
        let pass_id = self.next_pass_id;
        self.next_pass_id += 1;

        if let Some(record) = self.records.get_mut(&job.stream_id) {
            record.state = StreamProcessingState::Active;
            record.requeue = false;
        }

        let cancel_token = self.cancel_token.child_token();
        let task = tokio::spawn(run_pass(PassContext {
            stream_id: job.stream_id.clone(),
            pass_id,
            batch_size: self.config.batch_size,
            batch_yield: self.config.batch_yield,
            buffer: Arc::clone(&self.buffer),
            enhancer: Arc::clone(&self.enhancer),
            cancel_token: cancel_token.clone(),
            report_to: self.internal_tx.clone(),
        }));

        self.active.insert(
            job.stream_id.clone(),
            ActivePass {
                pass_id,
                cancel_token,
                started_at: Instant::now(),
                task: Some(task),
                removed: false,
            },
        );
        self.metrics.pass_started();

        debug!(
            target: "ingest.actor.coordinator",
            stream_id = %job.stream_id,
            pass_id,
            priority = job.priority,
            retry_count = job.retry_count,
            active = self.active.len(),
            "Pass started"
        );
        self.events.emit(ProcessingEvent::Started {
            stream_id: job.stream_id,
        });
    }

    fn finish_pass(&mut self, stream_id: &str, pass_id: u64, outcome: PassOutcome) {
        if !self
            .active
            .get(stream_id)
            .is_some_and(|pass| pass.pass_id == pass_id)
        {
            return;
        }
        let Some(pass) = self.active.remove(stream_id) else {
            return;
        };
        let duration = pass.started_at.elapsed();

        if pass.removed || !self.records.contains_key(stream_id) {
            prom::record_pass("abandoned", duration);
            return;
        }

        match outcome {
            PassOutcome::Completed(stats) => self.complete_pass(stream_id, &stats, duration),
            PassOutcome::Failed { error, .. } => self.fail_pass(stream_id, error, duration),
            PassOutcome::Abandoned => {
                prom::record_pass("abandoned", duration);
                self.push_job(stream_id);
            }
        }
    }

    fn complete_pass(&mut self, stream_id: &str, stats: &PassStats, duration: Duration) {
        let backlog_depth = self.buffer.size(stream_id);
        let metrics = {
            let previous = self.shared.stream_metrics.read();
            StreamMetrics::from_pass(stats, backlog_depth, previous.get(stream_id))
        };
        self.shared
            .stream_metrics
            .write()
            .insert(stream_id.to_string(), metrics.clone());

        self.metrics.pass_completed();
        prom::record_pass("completed", duration);

        let requeue = self.records.get_mut(stream_id).is_some_and(|record| {
            record.state = StreamProcessingState::Completed;
            record.retry_count = 0;
            std::mem::take(&mut record.requeue)
        });

        info!(
            target: "ingest.actor.coordinator",
            stream_id = %stream_id,
            frames_processed = stats.frames_processed,
            frames_rejected = stats.frames_rejected,
            backlog_depth,
            "Pass completed"
        );
        self.events.emit(ProcessingEvent::Completed {
            stream_id: stream_id.to_string(),
            frames_processed: stats.frames_processed,
        });
        self.events.emit(ProcessingEvent::MetricsSnapshot {
            stream_id: stream_id.to_string(),
            metrics,
        });

        if requeue || backlog_depth > 0 {
            self.push_job(stream_id);
        }
    }

    fn fail_pass(&mut self, stream_id: &str, error: String, duration: Duration) {
        self.metrics.pass_failed();
        let Some(record) = self.records.get_mut(stream_id) else {
            return;
        };
        record.requeue = false;

        if record.retry_count < self.config.max_retries {
            record.retry_count += 1;
            record.state = StreamProcessingState::Retrying;
            let retry_count = record.retry_count;
            let delay = self.config.retry_delay(retry_count);

            let token = self.cancel_token.child_token();
            record.retry_token = Some(token.clone());
            let report_to = self.internal_tx.clone();
            let due_stream = stream_id.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = tokio::time::sleep(delay) => {
                        let _ = report_to.send(CoordinatorEvent::RetryDue {
                            stream_id: due_stream,
                            retry_count,
                        });
                    }
                }
            });

            self.metrics.retry_scheduled();
            prom::record_pass("retrying", duration);
            warn!(
                target: "ingest.actor.coordinator",
                stream_id = %stream_id,
                retry_count,
                delay_ms = delay.as_millis(),
                error = %error,
                "Pass failed, retry scheduled"
            );
            self.events.emit(ProcessingEvent::Retrying {
                stream_id: stream_id.to_string(),
                retry_count,
                delay,
                error,
            });
        } else {
            record.state = StreamProcessingState::Failed;
            let retry_count = record.retry_count;

            prom::record_pass("failed", duration);
            error!(
                target: "ingest.actor.coordinator",
                stream_id = %stream_id,
                retry_count,
                error = %error,
                "Pass failed, retries exhausted"
            );
            self.events.emit(ProcessingEvent::Failed {
                stream_id: stream_id.to_string(),
                retry_count,
                error,
            });
        }
    }

    /// Detect pass tasks that ended without reporting.
    async fn check_pass_health(&mut self) {
        let finished: Vec<String> = self
            .active
            .iter()
            .filter(|(_, pass)| pass.task.as_ref().is_some_and(JoinHandle::is_finished))
            .map(|(stream_id, _)| stream_id.clone())
            .collect();

        for stream_id in finished {
            let Some(task) = self
                .active
                .get_mut(&stream_id)
                .and_then(|pass| pass.task.take())
            else {
                continue;
            };

            // A clean exit means the report is already queued internally
            let Err(join_error) = task.await else {
                continue;
            };

            let Some(pass) = self.active.remove(&stream_id) else {
                continue;
            };
            let duration = pass.started_at.elapsed();

            if !join_error.is_panic() {
                prom::record_pass("abandoned", duration);
                continue;
            }

            error!(
                target: "ingest.actor.coordinator",
                ingest_id = %self.ingest_id,
                stream_id = %stream_id,
                error = ?join_error,
                "Pass task panicked"
            );
            self.metrics.record_panic(ActorType::Pass);

            if !pass.removed && self.records.contains_key(&stream_id) {
                self.fail_pass(&stream_id, "pass task panicked".to_string(), duration);
            } else {
                prom::record_pass("abandoned", duration);
            }
        }
    }

    fn publish(&self) {
        self.shared.running.store(self.running, Ordering::SeqCst);
        self.shared
            .queue_depth
            .store(self.jobs.len(), Ordering::SeqCst);
        self.shared
            .active_count
            .store(self.active.len(), Ordering::SeqCst);
        prom::set_processing_queue_depth(self.jobs.len());
        prom::set_passes_active(self.active.len());
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "ingest.actor.coordinator",
            ingest_id = %self.ingest_id,
            active = self.active.len(),
            "Performing graceful shutdown"
        );

        self.accepting = false;
        self.running = false;
        self.publish();

        for record in self.records.values_mut() {
            if let Some(token) = record.retry_token.take() {
                token.cancel();
            }
        }

        for (stream_id, pass) in self.active.drain() {
            pass.cancel_token.cancel();
            let Some(task) = pass.task else {
                continue;
            };

            match tokio::time::timeout(self.shutdown_deadline, task).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "ingest.actor.coordinator",
                        stream_id = %stream_id,
                        "Pass stopped cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "ingest.actor.coordinator",
                        stream_id = %stream_id,
                        error = ?e,
                        "Pass task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "ingest.actor.coordinator",
                        stream_id = %stream_id,
                        "Pass shutdown timed out"
                    );
                }
            }
        }
        self.publish();

        info!(
            target: "ingest.actor.coordinator",
            ingest_id = %self.ingest_id,
            "Graceful shutdown complete"
        );
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::errors::EnhanceError;
    use crate::events::PipelineEvent;
    use async_trait::async_trait;
    use media_protocol::{Frame, FrameFormat};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Records which streams were enhanced and how many calls overlapped.
    #[derive(Default)]
    struct RecordingEnhancer {
        order: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        failures_left: AtomicU32,
        delay: Duration,
        panic: bool,
    }

    #[async_trait]
    impl Enhancer for RecordingEnhancer {
        async fn enhance(&self, stream_id: &str, _frames: &[Frame]) -> Result<(), EnhanceError> {
            assert!(!self.panic, "enhancer exploded");
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.order.lock().unwrap().push(stream_id.to_string());

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                Err(EnhanceError::Failed("model unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        handle: ProcessingCoordinatorHandle,
        buffer: Arc<FrameBuffer>,
        router: Arc<StreamRouter>,
        events: UnboundedReceiver<PipelineEvent>,
    }

    fn fixture(config: CoordinatorConfig, enhancer: Arc<RecordingEnhancer>) -> Fixture {
        let (sink, events) = EventSink::channel();
        let buffer = Arc::new(FrameBuffer::new(30, EventSink::disabled()));
        let router = Arc::new(StreamRouter::new(EventSink::disabled()));
        let handle = ProcessingCoordinatorHandle::new(
            "ingest-test".to_string(),
            config,
            Arc::clone(&buffer),
            Arc::clone(&router),
            enhancer,
            sink,
        );
        Fixture {
            handle,
            buffer,
            router,
            events,
        }
    }

    fn feed(fixture: &Fixture, stream_id: &str, frames: u64) {
        for ts in 0..frames {
            fixture.buffer.push(
                stream_id,
                Frame::new(vec![0u8; 4], ts, 640, 480, FrameFormat::I420),
            );
        }
        fixture.router.admit(stream_id, 1);
    }

    async fn next_processing_event(
        events: &mut UnboundedReceiver<PipelineEvent>,
        matches: impl Fn(&ProcessingEvent) -> bool,
    ) -> ProcessingEvent {
        tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                match events.recv().await {
                    Some(PipelineEvent::Processing(event)) if matches(&event) => return event,
                    Some(_) => {}
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for processing event")
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(2));
        assert_eq!(config.retry_delay(2), Duration::from_secs(4));
        assert_eq!(config.retry_delay(3), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readmission_keeps_single_job_at_max_priority() {
        let fx = fixture(CoordinatorConfig::default(), Arc::default());
        fx.handle.stop().await.unwrap();

        assert_eq!(
            fx.handle.enqueue("s2", 1).await.unwrap(),
            EnqueueOutcome::Queued
        );
        assert_eq!(
            fx.handle.enqueue("s2", 5).await.unwrap(),
            EnqueueOutcome::PriorityUpdated
        );
        assert_eq!(
            fx.handle.enqueue("s2", 3).await.unwrap(),
            EnqueueOutcome::PriorityUpdated
        );

        let jobs = fx.handle.queued_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].stream_id, "s2");
        assert_eq!(jobs[0].priority, 5);
        assert_eq!(fx.handle.status().queue_depth, 1);
        assert!(!fx.handle.status().running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mailbox_depth_samples_backlog() {
        let fx = fixture(CoordinatorConfig::default(), Arc::default());
        fx.handle.stop().await.unwrap();
        assert_eq!(fx.handle.mailbox_peak_depth(), 1);

        // All four land in the mailbox before the actor runs
        let (a, b, c, d) = tokio::join!(
            fx.handle.enqueue("s1", 1),
            fx.handle.enqueue("s2", 1),
            fx.handle.enqueue("s3", 1),
            fx.handle.enqueue("s4", 1),
        );
        for outcome in [a, b, c, d] {
            assert_eq!(outcome.unwrap(), EnqueueOutcome::Queued);
        }

        assert_eq!(fx.handle.mailbox_peak_depth(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_order_is_priority_then_fifo() {
        let enhancer = Arc::new(RecordingEnhancer::default());
        let config = CoordinatorConfig {
            max_concurrent_streams: 1,
            ..CoordinatorConfig::default()
        };
        let mut fx = fixture(config, Arc::clone(&enhancer));
        fx.handle.stop().await.unwrap();

        for id in ["a", "b", "c"] {
            feed(&fx, id, 2);
        }
        fx.handle.enqueue("a", 1).await.unwrap();
        fx.handle.enqueue("b", 5).await.unwrap();
        fx.handle.enqueue("c", 5).await.unwrap();
        fx.handle.start().await.unwrap();

        for _ in 0..3 {
            next_processing_event(&mut fx.events, |e| {
                matches!(e, ProcessingEvent::Completed { .. })
            })
            .await;
        }

        assert_eq!(*enhancer.order.lock().unwrap(), vec!["b", "c", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling() {
        let enhancer = Arc::new(RecordingEnhancer {
            delay: Duration::from_millis(50),
            ..RecordingEnhancer::default()
        });
        let mut fx = fixture(CoordinatorConfig::default(), Arc::clone(&enhancer));

        for i in 0..8 {
            let id = format!("stream-{i}");
            feed(&fx, &id, 10);
            fx.handle.enqueue(&id, 1).await.unwrap();
        }

        for _ in 0..8 {
            next_processing_event(&mut fx.events, |e| {
                matches!(e, ProcessingEvent::Completed { .. })
            })
            .await;
        }

        assert_eq!(enhancer.max_in_flight.load(Ordering::SeqCst), 5);
        assert!(fx.handle.status().active_count <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_dispatched_without_admission_or_frames() {
        let enhancer = Arc::new(RecordingEnhancer::default());
        let fx = fixture(CoordinatorConfig::default(), Arc::clone(&enhancer));

        // Frames but no admission
        fx.buffer.push(
            "unadmitted",
            Frame::new(vec![0u8; 4], 0, 640, 480, FrameFormat::I420),
        );
        fx.handle.enqueue("unadmitted", 1).await.unwrap();
        // Admission but no frames
        fx.router.admit("empty", 1);
        fx.handle.enqueue("empty", 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(enhancer.order.lock().unwrap().is_empty());
        assert_eq!(fx.handle.queued_jobs().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_records_metrics() {
        let mut fx = fixture(CoordinatorConfig::default(), Arc::default());
        feed(&fx, "s1", 12);
        fx.handle.enqueue("s1", 1).await.unwrap();

        let completed = next_processing_event(&mut fx.events, |e| {
            matches!(e, ProcessingEvent::Completed { .. })
        })
        .await;
        assert_eq!(
            completed,
            ProcessingEvent::Completed {
                stream_id: "s1".to_string(),
                frames_processed: 12
            }
        );

        let snapshot = next_processing_event(&mut fx.events, |e| {
            matches!(e, ProcessingEvent::MetricsSnapshot { .. })
        })
        .await;
        let ProcessingEvent::MetricsSnapshot { metrics, .. } = snapshot else {
            panic!("expected metrics snapshot");
        };
        assert_eq!(metrics.frames_processed, 12);
        assert_eq!(metrics.backlog_depth, 0);
        assert_eq!(metrics.passes_completed, 1);
        assert!(metrics.error_rate.abs() < f64::EPSILON);

        // Published for synchronous reads once the actor has moved on
        fx.handle.queued_jobs().await.unwrap();
        assert_eq!(fx.handle.stream_metrics("s1"), Some(metrics));
        assert!(fx.handle.stream_metrics("unknown").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion() {
        let enhancer = Arc::new(RecordingEnhancer {
            failures_left: AtomicU32::new(u32::MAX),
            ..RecordingEnhancer::default()
        });
        let mut fx = fixture(CoordinatorConfig::default(), Arc::clone(&enhancer));
        feed(&fx, "s1", 3);
        fx.handle.enqueue("s1", 1).await.unwrap();

        let mut delays = Vec::new();
        let terminal = loop {
            let event = next_processing_event(&mut fx.events, |e| {
                matches!(
                    e,
                    ProcessingEvent::Retrying { .. } | ProcessingEvent::Failed { .. }
                )
            })
            .await;
            match event {
                ProcessingEvent::Retrying {
                    retry_count, delay, ..
                } => delays.push((retry_count, delay)),
                other => break other,
            }
        };

        assert_eq!(
            delays,
            vec![
                (1, Duration::from_secs(2)),
                (2, Duration::from_secs(4)),
                (3, Duration::from_secs(8)),
            ]
        );
        assert!(matches!(
            terminal,
            ProcessingEvent::Failed { retry_count: 3, .. }
        ));

        // One initial attempt plus three retries, then nothing more
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(enhancer.order.lock().unwrap().len(), 4);

        assert_eq!(
            fx.handle.enqueue("s1", 1).await.unwrap(),
            EnqueueOutcome::Rejected
        );
        let state = fx.handle.stream_state("s1").await.unwrap().unwrap();
        assert_eq!(state.state, StreamProcessingState::Failed);
        assert_eq!(state.retry_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_for_backoff_then_succeeds() {
        let enhancer = Arc::new(RecordingEnhancer {
            failures_left: AtomicU32::new(1),
            ..RecordingEnhancer::default()
        });
        let mut fx = fixture(CoordinatorConfig::default(), Arc::clone(&enhancer));
        feed(&fx, "s1", 3);
        fx.handle.enqueue("s1", 1).await.unwrap();

        next_processing_event(&mut fx.events, |e| {
            matches!(e, ProcessingEvent::Retrying { .. })
        })
        .await;
        let failed_at = Instant::now();

        // Re-admission while retrying is deferred, not duplicated
        assert_eq!(
            fx.handle.enqueue("s1", 2).await.unwrap(),
            EnqueueOutcome::Deferred
        );
        assert!(fx.handle.queued_jobs().await.unwrap().is_empty());

        let completed = next_processing_event(&mut fx.events, |e| {
            matches!(e, ProcessingEvent::Completed { .. })
        })
        .await;
        assert!(failed_at.elapsed() >= Duration::from_secs(2));
        // The failed batch was restored and processed on retry
        assert_eq!(
            completed,
            ProcessingEvent::Completed {
                stream_id: "s1".to_string(),
                frames_processed: 3
            }
        );

        fx.handle.queued_jobs().await.unwrap();
        let state = fx.handle.stream_state("s1").await.unwrap().unwrap();
        assert_eq!(state.state, StreamProcessingState::Completed);
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.priority, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_cancels_active_pass() {
        let enhancer = Arc::new(RecordingEnhancer {
            delay: Duration::from_millis(100),
            ..RecordingEnhancer::default()
        });
        let mut fx = fixture(CoordinatorConfig::default(), Arc::clone(&enhancer));
        feed(&fx, "s1", 25);
        fx.handle.enqueue("s1", 1).await.unwrap();

        next_processing_event(&mut fx.events, |e| {
            matches!(e, ProcessingEvent::Started { .. })
        })
        .await;
        // Let the pass reach its first enhancer call
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(fx.handle.remove("s1").await.unwrap());
        assert!(!fx.handle.remove("s1").await.unwrap());

        tokio::time::sleep(Duration::from_secs(1)).await;
        fx.handle.queued_jobs().await.unwrap();

        // Abandoned after the in-flight batch; the rest stays undrained
        assert_eq!(enhancer.order.lock().unwrap().len(), 1);
        assert_eq!(fx.buffer.size("s1"), 20);
        assert_eq!(fx.handle.status().active_count, 0);
        assert!(fx.handle.stream_state("s1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalate_caps_priority() {
        let fx = fixture(CoordinatorConfig::default(), Arc::default());
        fx.handle.stop().await.unwrap();

        assert_eq!(fx.handle.escalate("unknown").await.unwrap(), None);

        fx.handle.enqueue("s1", 8).await.unwrap();
        assert_eq!(fx.handle.escalate("s1").await.unwrap(), Some(9));
        assert_eq!(fx.handle.escalate("s1").await.unwrap(), Some(10));
        assert_eq!(fx.handle.escalate("s1").await.unwrap(), Some(10));

        let jobs = fx.handle.queued_jobs().await.unwrap();
        assert_eq!(jobs[0].priority, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_panic_counts_as_failure() {
        let enhancer = Arc::new(RecordingEnhancer {
            panic: true,
            ..RecordingEnhancer::default()
        });
        let mut fx = fixture(CoordinatorConfig::default(), enhancer);
        feed(&fx, "s1", 3);
        fx.handle.enqueue("s1", 1).await.unwrap();

        let event = next_processing_event(&mut fx.events, |e| {
            matches!(e, ProcessingEvent::Retrying { .. })
        })
        .await;
        assert!(matches!(
            event,
            ProcessingEvent::Retrying { retry_count: 1, .. }
        ));
        fx.handle.queued_jobs().await.unwrap();
        assert_eq!(fx.handle.actor_metrics().panic_count(), 1);
        assert_eq!(fx.handle.status().active_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_actor() {
        let fx = fixture(CoordinatorConfig::default(), Arc::default());

        fx.handle.shutdown(Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(fx.handle.is_cancelled());
        assert!(!fx.handle.status().running);
    }
}
