//! Processing actors.
//!
//! ```text
//! ProcessingCoordinatorActor (singleton per ingest instance)
//! ├── owns the job queue, per-stream records and the active-pass set
//! └── spawns N pass tasks (at most max_concurrent_streams)
//!     └── pass: drain batch -> enhance -> yield, until the backlog is empty
//! ```
//!
//! - [`coordinator`] - `ProcessingCoordinatorActor` and its handle
//! - [`messages`] - Mailbox messages and the status/metrics types they carry
//! - [`metrics`] - Mailbox monitoring and pass counters
//! - `pass` - The pass task (internal)

pub mod coordinator;
pub mod messages;
pub mod metrics;
mod pass;

pub use coordinator::{
    CoordinatorConfig, ProcessingCoordinatorActor, ProcessingCoordinatorHandle,
    MAX_ESCALATED_PRIORITY,
};
pub use messages::{
    EnqueueOutcome, ProcessingJobInfo, ProcessingStatus, StreamJobInfo, StreamMetrics,
    StreamProcessingState,
};
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
