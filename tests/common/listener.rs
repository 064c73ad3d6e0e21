use std::sync::Mutex;

use tokio::time::Instant;

use formjobs::{JobError, JobListener, JobSnapshot};

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub job_id: String,
    pub message: String,
    pub terminal: bool,
    pub transient: bool,
    pub at: Instant,
}

/// Listener that keeps every callback, stamped with the (test) clock.
#[derive(Default)]
pub struct RecordingListener {
    updates: Mutex<Vec<JobSnapshot>>,
    completions: Mutex<Vec<(JobSnapshot, Instant)>>,
    errors: Mutex<Vec<ErrorEvent>>,
}

#[allow(dead_code)]
impl RecordingListener {
    pub fn updates(&self) -> Vec<JobSnapshot> {
        self.updates.lock().unwrap().clone()
    }

    pub fn updates_for(&self, job_id: &str) -> Vec<JobSnapshot> {
        self.updates()
            .into_iter()
            .filter(|snapshot| snapshot.job.job_id == job_id)
            .collect()
    }

    pub fn completions(&self) -> Vec<(JobSnapshot, Instant)> {
        self.completions.lock().unwrap().clone()
    }

    pub fn completion_of(&self, job_id: &str) -> Option<(JobSnapshot, Instant)> {
        self.completions()
            .into_iter()
            .find(|(snapshot, _)| snapshot.job.job_id == job_id)
    }

    pub fn errors(&self) -> Vec<ErrorEvent> {
        self.errors.lock().unwrap().clone()
    }

    /// Total number of callbacks received so far.
    pub fn event_count(&self) -> usize {
        self.updates.lock().unwrap().len()
            + self.completions.lock().unwrap().len()
            + self.errors.lock().unwrap().len()
    }
}

impl JobListener for RecordingListener {
    fn on_update(&self, snapshot: &JobSnapshot) {
        self.updates.lock().unwrap().push(snapshot.clone());
    }

    fn on_complete(&self, snapshot: &JobSnapshot) {
        self.completions
            .lock()
            .unwrap()
            .push((snapshot.clone(), Instant::now()));
    }

    fn on_error(&self, job_id: &str, error: &JobError) {
        self.errors.lock().unwrap().push(ErrorEvent {
            job_id: job_id.to_string(),
            message: error.to_string(),
            terminal: error.is_terminal(),
            transient: matches!(error, JobError::TransientNetwork { .. }),
            at: Instant::now(),
        });
    }
}
