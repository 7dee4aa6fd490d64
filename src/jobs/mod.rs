//! Job Lifecycle Manager - durable job records and the work queue.
//!
//! Two sled trees back the manager: `jobs` (job id -> record) and
//! `job_queue` (monotonic sequence -> job id), giving a durable FIFO queue
//! with atomic pop. Both survive restarts; a queue entry is consumed by
//! `dequeue` and the job record carries the authoritative status, so a
//! crash mid-processing is recovered by [`JobStore::recover_stale`]
//! (processing -> pending, re-enqueued, reprocessed from scratch).
//!
//! The narrow `enqueue`/`dequeue`/`update_status` surface keeps the
//! backing store swappable.

pub mod worker;

use crate::types::{Job, JobStatus};
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

const JOBS_TREE: &str = "jobs";
const QUEUE_TREE: &str = "job_queue";

/// Job store and queue errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable job table plus FIFO work queue.
#[derive(Clone)]
pub struct JobStore {
    db: sled::Db,
    jobs: sled::Tree,
    queue: sled::Tree,
}

impl JobStore {
    /// Open the job trees inside an existing database.
    pub fn open(db: &sled::Db) -> Result<Self, JobError> {
        let jobs = db.open_tree(JOBS_TREE)?;
        let queue = db.open_tree(QUEUE_TREE)?;
        Ok(Self {
            db: db.clone(),
            jobs,
            queue,
        })
    }

    /// Create a pending job and enqueue it. The returned record is already
    /// durable when this returns.
    pub fn create(&self, conversation_id: &str, input: &str) -> Result<Job, JobError> {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            input: input.to_string(),
            status: JobStatus::Pending,
            error: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.put(&job)?;
        self.enqueue(&job.id)?;
        debug!(job_id = %job.id, conversation_id = %conversation_id, "Job created and enqueued");
        Ok(job)
    }

    /// Load a job record. Lock-free read; never blocks on pipeline progress.
    pub fn get(&self, job_id: &str) -> Result<Job, JobError> {
        let bytes = self
            .jobs
            .get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Transition a job to `next`, validating against the state machine.
    /// Terminal states are sinks; an illegal transition is an error, not a
    /// silent overwrite.
    pub fn update_status(
        &self,
        job_id: &str,
        next: JobStatus,
        error: Option<String>,
    ) -> Result<Job, JobError> {
        let mut job = self.get(job_id)?;
        if !job.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: job.status,
                to: next,
            });
        }

        job.status = next;
        job.error = error;
        match next {
            JobStatus::Processing => {
                if job.started_at.is_none() {
                    job.started_at = Some(Utc::now());
                }
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                job.finished_at = Some(Utc::now());
            }
            JobStatus::Pending => {}
        }
        self.put(&job)?;
        Ok(job)
    }

    /// Set the cancellation-requested flag. Returns `false` (no-op) when
    /// the job is already terminal; idempotent otherwise.
    pub fn request_cancel(&self, job_id: &str) -> Result<bool, JobError> {
        let mut job = self.get(job_id)?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        if !job.cancel_requested {
            job.cancel_requested = true;
            self.put(&job)?;
            info!(job_id = %job_id, "Cancellation requested");
        }
        Ok(true)
    }

    /// Read the cancellation flag (polled by the pipeline at stage
    /// boundaries).
    pub fn is_cancel_requested(&self, job_id: &str) -> Result<bool, JobError> {
        Ok(self.get(job_id)?.cancel_requested)
    }

    /// Append a job id to the back of the queue.
    pub fn enqueue(&self, job_id: &str) -> Result<(), JobError> {
        let seq = self.db.generate_id()?;
        self.queue.insert(seq.to_be_bytes(), job_id.as_bytes())?;
        self.queue.flush()?;
        Ok(())
    }

    /// Atomically pop the oldest queue entry, if any.
    pub fn dequeue(&self) -> Result<Option<String>, JobError> {
        match self.queue.pop_min()? {
            Some((_seq, bytes)) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    /// Number of queued (not yet dequeued) jobs.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// The oldest non-terminal job for a conversation, by creation time.
    ///
    /// Workers run a job only when it is the earliest active one for its
    /// conversation, so two queued jobs can never complete out of order
    /// even when a later entry is dequeued first.
    pub fn earliest_active_for(
        &self,
        conversation_id: &str,
    ) -> Result<Option<String>, JobError> {
        let mut earliest: Option<(chrono::DateTime<Utc>, String)> = None;
        for item in self.jobs.iter() {
            let (_key, bytes) = item?;
            let Ok(job) = serde_json::from_slice::<Job>(&bytes) else {
                continue;
            };
            if job.conversation_id != conversation_id || job.status.is_terminal() {
                continue;
            }
            let candidate = (job.created_at, job.id);
            if earliest.as_ref().map_or(true, |e| candidate < *e) {
                earliest = Some(candidate);
            }
        }
        Ok(earliest.map(|(_, id)| id))
    }

    /// Recover jobs orphaned by a crash: anything still `processing` at
    /// startup has no owning worker and is reset to pending and
    /// re-enqueued for reprocessing from scratch. Stage calls are not
    /// checkpointed, and conversation cost is only added by the single
    /// completion write, so reprocessing cannot double-bill.
    pub fn recover_stale(&self) -> Result<usize, JobError> {
        let mut recovered = 0;
        for item in self.jobs.iter() {
            let (_key, bytes) = item?;
            let mut job: Job = match serde_json::from_slice(&bytes) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(error = %e, "Corrupted job record skipped during recovery");
                    continue;
                }
            };
            if job.status == JobStatus::Processing {
                info!(job_id = %job.id, "Recovering orphaned job (processing -> pending)");
                job.status = JobStatus::Pending;
                self.put(&job)?;
                self.enqueue(&job.id)?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered = recovered, "Stale job recovery complete");
        }
        Ok(recovered)
    }

    fn put(&self, job: &Job) -> Result<(), JobError> {
        let bytes = serde_json::to_vec(job)?;
        self.jobs.insert(job.id.as_bytes(), bytes)?;
        self.jobs.flush()?;
        Ok(())
    }
}
