use serde::Serialize;
use tracing::{info, warn};

use crate::error::JobError;
use crate::heuristic::Decision;
use crate::job_store::Job;

/// What a listener sees after each delivered poll result.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    /// The job as persisted after the tick.
    pub job: Job,
    /// Latest completion-heuristic decision, if a check has run yet.
    pub decision: Option<Decision>,
    /// True when the job was completed by the heuristic, not by the remote service.
    pub inferred_completion: bool,
}

/// Receives status updates from polling loops.
///
/// Callbacks run on the loop's task and must not block. Calling back into
/// the poller for the same job is allowed.
pub trait JobListener: Send + Sync {
    /// Called on every successful poll, including the one that ends the job.
    fn on_update(&self, snapshot: &JobSnapshot);

    /// Called once when a job reaches `completed` or `cancelled`.
    fn on_complete(&self, snapshot: &JobSnapshot);

    /// Called when a job fails, and when polling keeps failing (non-terminal,
    /// see [`JobError::is_terminal`]).
    fn on_error(&self, job_id: &str, error: &JobError);
}

#[derive(Serialize)]
struct ProgressLine<'a> {
    job_id: &'a str,
    kind: &'a str,
    status: &'a str,
    completed: u32,
    total: u32,
    message: Option<&'a str>,
}

/// Listener that writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl JobListener for LoggingListener {
    fn on_update(&self, snapshot: &JobSnapshot) {
        let job = &snapshot.job;
        let line = ProgressLine {
            job_id: &job.job_id,
            kind: job.kind.as_str(),
            status: job.status.as_str(),
            completed: job.progress.completed,
            total: job.progress.total,
            message: job.message.as_deref(),
        };
        match serde_json::to_string(&line) {
            Ok(json) => info!("update {}", json),
            Err(e) => warn!("Failed to encode update for {}: {}", job.job_id, e),
        }
    }

    fn on_complete(&self, snapshot: &JobSnapshot) {
        info!(
            "Job {} finished as {}{}",
            snapshot.job.job_id,
            snapshot.job.status,
            if snapshot.inferred_completion {
                " (inferred)"
            } else {
                ""
            }
        );
    }

    fn on_error(&self, job_id: &str, error: &JobError) {
        if error.is_terminal() {
            warn!("Job {} failed: {}", job_id, error);
        } else {
            warn!("Job {} polling trouble: {}", job_id, error);
        }
    }
}
