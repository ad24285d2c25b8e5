//! Actor mailbox monitoring and shared coordinator counters.
//!
//! | Actor Type  | Normal | Warning | Critical |
//! |-------------|--------|---------|----------|
//! | Coordinator | < 256  | 256-800 | > 800    |
//!
//! Pass tasks have no mailbox; they are tracked through [`ActorMetrics`].

use crate::observability::metrics as prom;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Coordinator mailbox depth considered normal.
pub const COORDINATOR_MAILBOX_NORMAL: usize = 256;

/// Coordinator mailbox depth above which every enqueue warns.
pub const COORDINATOR_MAILBOX_WARNING: usize = 800;

/// Actor type for metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `ProcessingCoordinatorActor` (singleton).
    Coordinator,
    /// One enhancement pass over a stream's backlog.
    Pass,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Coordinator => "coordinator",
            ActorType::Pass => "pass",
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth for one actor mailbox.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record a message taken off the mailbox.
    ///
    /// `depth` is the backlog at receipt, counting the message itself.
    pub fn record_received(&self, depth: usize) {
        let previous = self.depth.swap(depth, Ordering::Relaxed);
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);

        match Self::level_for_depth(depth) {
            MailboxLevel::Critical => warn!(
                target: "ingest.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                threshold = COORDINATOR_MAILBOX_WARNING,
                "Mailbox depth critical"
            ),
            MailboxLevel::Warning if previous <= COORDINATOR_MAILBOX_NORMAL => debug!(
                target: "ingest.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                "Mailbox depth elevated"
            ),
            _ => {}
        }
    }

    /// Record a message handled, with `remaining` still queued.
    pub fn record_handled(&self, remaining: usize) {
        self.depth.store(remaining, Ordering::Relaxed);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), remaining);
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        Self::level_for_depth(self.current_depth())
    }

    fn level_for_depth(depth: usize) -> MailboxLevel {
        if depth > COORDINATOR_MAILBOX_WARNING {
            MailboxLevel::Critical
        } else if depth > COORDINATOR_MAILBOX_NORMAL {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Lifetime counters for the coordinator and its passes.
///
/// Shared via `Arc` so tests and diagnostics can read them without going
/// through the mailbox.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub passes_started: AtomicU64,
    pub passes_completed: AtomicU64,
    pub passes_failed: AtomicU64,
    pub retries_scheduled: AtomicU64,
    /// Pass tasks that ended without reporting (indicates a bug).
    pub actor_panics: AtomicU64,
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pass_started(&self) {
        self.passes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pass_completed(&self) {
        self.passes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pass_failed(&self) {
        self.passes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "ingest.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn completed_count(&self) -> u64 {
        self.passes_completed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed_count(&self) -> u64 {
        self.passes_failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.actor_panics.load(Ordering::Relaxed)
    }
}
