//! Job worker loop.
//!
//! Workers poll the durable queue and hand each job to the council
//! orchestrator. Jobs for *different* conversations run concurrently
//! across workers; jobs for the *same* conversation are serialized through
//! an in-flight guard so message ordering in the conversation is never
//! violated by out-of-order completion. A popped job whose conversation is
//! busy goes back to the end of the queue.

use super::{JobError, JobStore};
use crate::council::{CouncilError, CouncilOrchestrator};
use crate::store::ConversationStore;
use crate::types::{Job, JobStatus};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Queue poll interval when idle or when a conversation is busy.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Everything one worker needs; cheap to clone per worker task.
#[derive(Clone)]
pub struct WorkerContext {
    pub jobs: JobStore,
    pub store: ConversationStore,
    pub orchestrator: Arc<CouncilOrchestrator>,
    /// Conversations with a job currently executing, shared across workers
    pub in_flight: Arc<DashMap<String, ()>>,
}

/// Run one worker until shutdown is signalled.
pub async fn run_worker(worker_id: usize, ctx: WorkerContext, shutdown: CancellationToken) {
    info!(worker = worker_id, "Job worker started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let job_id = match ctx.jobs.dequeue() {
            Ok(Some(id)) => id,
            Ok(None) => {
                idle(&shutdown).await;
                continue;
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "Queue read failed");
                idle(&shutdown).await;
                continue;
            }
        };

        match ctx.jobs.get(&job_id) {
            Ok(job) => process_one(worker_id, &ctx, job).await,
            Err(e) => {
                warn!(worker = worker_id, job_id = %job_id, error = %e, "Dequeued unknown job, dropping");
            }
        }
    }

    info!(worker = worker_id, "Job worker stopped");
}

/// Execute a single dequeued job, holding the conversation guard for the
/// duration.
async fn process_one(worker_id: usize, ctx: &WorkerContext, job: Job) {
    if job.status != JobStatus::Pending {
        // At-least-once delivery can replay an entry for a job that
        // already reached a terminal state; skip it.
        warn!(
            worker = worker_id,
            job_id = %job.id,
            status = %job.status,
            "Skipping non-pending job from queue"
        );
        return;
    }

    // Serialize per conversation: if another worker is on this
    // conversation, push the job back and let the queue retry.
    match ctx.in_flight.entry(job.conversation_id.clone()) {
        dashmap::mapref::entry::Entry::Occupied(_) => {
            requeue(ctx, &job.id).await;
            return;
        }
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(());
        }
    }

    // FIFO within a conversation: an entry dequeued ahead of an older
    // sibling job goes back to the queue until the older one is terminal.
    match ctx.jobs.earliest_active_for(&job.conversation_id) {
        Ok(Some(earliest)) if earliest != job.id => {
            ctx.in_flight.remove(&job.conversation_id);
            requeue(ctx, &job.id).await;
            return;
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Could not determine job ordering");
            ctx.in_flight.remove(&job.conversation_id);
            requeue(ctx, &job.id).await;
            return;
        }
        _ => {}
    }

    execute(worker_id, ctx, &job).await;
    ctx.in_flight.remove(&job.conversation_id);
}

async fn requeue(ctx: &WorkerContext, job_id: &str) {
    if let Err(e) = ctx.jobs.enqueue(job_id) {
        error!(job_id = %job_id, error = %e, "Could not requeue job");
    }
    tokio::time::sleep(POLL_INTERVAL).await;
}

async fn execute(worker_id: usize, ctx: &WorkerContext, job: &Job) {
    // A job cancelled while still queued terminates without running.
    if matches!(ctx.jobs.is_cancel_requested(&job.id), Ok(true)) {
        finish(ctx, job, JobStatus::Cancelled, Some("Cancelled by user".to_string()));
        return;
    }

    if let Err(e) = ctx.jobs.update_status(&job.id, JobStatus::Processing, None) {
        error!(job_id = %job.id, error = %e, "Could not mark job processing");
        return;
    }
    info!(worker = worker_id, job_id = %job.id, conversation_id = %job.conversation_id, "Job processing");

    match ctx.orchestrator.run(job).await {
        Ok(()) => {
            finish(ctx, job, JobStatus::Completed, None);
            info!(worker = worker_id, job_id = %job.id, "Job completed");
        }
        Err(CouncilError::Cancelled) => {
            finish(ctx, job, JobStatus::Cancelled, Some("Cancelled by user".to_string()));
            info!(worker = worker_id, job_id = %job.id, "Job cancelled");
        }
        Err(e) => {
            finish(ctx, job, JobStatus::Failed, Some(e.to_string()));
            error!(worker = worker_id, job_id = %job.id, error = %e, "Job failed");
        }
    }
}

/// Record the terminal status on both the job and, for failures and
/// cancellations, the conversation's pending assistant turn.
fn finish(ctx: &WorkerContext, job: &Job, status: JobStatus, error: Option<String>) {
    if status != JobStatus::Completed {
        let reason = error.as_deref().unwrap_or("unknown error");
        if let Err(e) = ctx.store.fail_pending(&job.conversation_id, reason) {
            warn!(job_id = %job.id, error = %e, "Could not record failure on conversation");
        }
    }
    match ctx.jobs.update_status(&job.id, status, error) {
        Ok(_) => {}
        Err(JobError::InvalidTransition { from, to }) => {
            warn!(job_id = %job.id, %from, %to, "Dropped illegal terminal transition");
        }
        Err(e) => error!(job_id = %job.id, error = %e, "Could not record terminal job status"),
    }
}

async fn idle(shutdown: &CancellationToken) {
    tokio::select! {
        () = shutdown.cancelled() => {}
        () = tokio::time::sleep(POLL_INTERVAL) => {}
    }
}
