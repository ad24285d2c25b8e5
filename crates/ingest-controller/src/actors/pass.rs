//! A single enhancement pass over one stream's backlog.
//!
//! The pass drains the stream in batches and hands each batch to the
//! [`Enhancer`]. It checks its cancellation token at every batch boundary, so
//! a removed stream is abandoned without waiting for the backlog to empty.
//!
//! The outcome is reported to the coordinator over the internal channel; a
//! pass that panics never reports, which the coordinator detects through the
//! task's `JoinHandle`.

use super::messages::{CoordinatorEvent, PassOutcome, PassStats};

use crate::buffer::FrameBuffer;
use crate::enhancer::Enhancer;
use crate::errors::EnhanceError;
use crate::observability::metrics;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Everything a pass needs, moved into its task.
pub(crate) struct PassContext {
    pub stream_id: String,
    pub pass_id: u64,
    pub batch_size: usize,
    pub batch_yield: Duration,
    pub buffer: Arc<FrameBuffer>,
    pub enhancer: Arc<dyn Enhancer>,
    pub cancel_token: CancellationToken,
    pub report_to: mpsc::UnboundedSender<CoordinatorEvent>,
}

/// Run the pass and report its outcome.
#[instrument(skip_all, name = "ingest.actor.pass", fields(stream_id = %ctx.stream_id, pass_id = ctx.pass_id))]
pub(crate) async fn run_pass(ctx: PassContext) {
    let outcome = drain_and_enhance(&ctx).await;

    let PassContext {
        stream_id,
        pass_id,
        report_to,
        ..
    } = ctx;

    // The coordinator may already be gone during shutdown
    let _ = report_to.send(CoordinatorEvent::PassFinished {
        stream_id,
        pass_id,
        outcome,
    });
}

async fn drain_and_enhance(ctx: &PassContext) -> PassOutcome {
    let started = Instant::now();
    let mut stats = PassStats::default();

    loop {
        if ctx.cancel_token.is_cancelled() {
            debug!(
                target: "ingest.actor.pass",
                stream_id = %ctx.stream_id,
                frames_processed = stats.frames_processed,
                "Pass abandoned at batch boundary"
            );
            return PassOutcome::Abandoned;
        }

        let batch = ctx.buffer.drain(&ctx.stream_id, ctx.batch_size);
        if batch.is_empty() {
            break;
        }

        let batch_len = batch.len();
        match ctx.enhancer.enhance(&ctx.stream_id, &batch).await {
            Ok(()) => {}
            Err(EnhanceError::FramesRejected { count }) => {
                stats.frames_rejected += count.min(batch_len);
            }
            Err(EnhanceError::Failed(error)) => {
                // Put the batch back so the retry sees the same frames
                let restored = ctx.buffer.restore(&ctx.stream_id, batch);
                stats.elapsed = started.elapsed();
                warn!(
                    target: "ingest.actor.pass",
                    stream_id = %ctx.stream_id,
                    error = %error,
                    restored,
                    "Enhancer failed"
                );
                return PassOutcome::Failed { error, stats };
            }
        }

        stats.frames_processed += batch_len;
        metrics::record_frames_enhanced(batch_len);

        if ctx.batch_yield.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(ctx.batch_yield).await;
        }
    }

    stats.elapsed = started.elapsed();
    debug!(
        target: "ingest.actor.pass",
        stream_id = %ctx.stream_id,
        frames_processed = stats.frames_processed,
        frames_rejected = stats.frames_rejected,
        elapsed_ms = stats.elapsed.as_millis(),
        "Pass drained backlog"
    );
    PassOutcome::Completed(stats)
}
