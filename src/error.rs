//! Error taxonomy shared by the poller and the lifecycle controller.

use thiserror::Error;

use crate::job_store::JobKind;
use crate::remote::RemoteError;

/// Errors that can occur while driving a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// Another job is already active on the surface, locally or on the remote side.
    #[error("A {kind} job is already active ({})", .job_id.as_deref().unwrap_or("reported by remote"))]
    Conflict {
        kind: JobKind,
        job_id: Option<String>,
    },

    /// Status polling keeps failing; the poller is still retrying.
    #[error("Status polling for job {job_id} failed {consecutive_failures} times in a row")]
    TransientNetwork {
        job_id: String,
        consecutive_failures: u32,
    },

    /// The remote service reported the job as failed.
    #[error("Job {job_id} failed: {message}")]
    RemoteJob { job_id: String, message: String },

    #[error("Job {job_id} does not belong to owner {owner_id}")]
    OwnershipViolation { job_id: String, owner_id: String },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid job state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Job {0} is not paused")]
    NotPaused(String),

    #[error("Job {0} is already paused")]
    AlreadyPaused(String),

    #[error("Polling loop for job {0} is already active")]
    AlreadyActive(String),

    #[error("Cannot clear {0} history while a job is running")]
    HistoryBusy(JobKind),

    #[error("Remote service rejected {operation} for job {job_id}")]
    RemoteRejected {
        operation: &'static str,
        job_id: String,
    },

    #[error("No active owner, reconcile an owner first")]
    NoActiveOwner,

    #[error("Remote request failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("Store error: {0}")]
    Store(anyhow::Error),
}

/// Store methods return `anyhow` errors; a `JobError` raised inside them
/// (ownership checks, transition checks in `update_job`) is recovered as-is.
impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<JobError>() {
            Ok(job_error) => job_error,
            Err(err) => JobError::Store(err),
        }
    }
}

impl JobError {
    /// Returns true if the job this error refers to has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobError::RemoteJob { .. })
    }
}
