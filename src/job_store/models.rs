//! Data models for tracked automation jobs.
//!
//! Defines jobs, their kind (surface), lifecycle status, progress and the
//! context needed to resume a job that stopped before finishing.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::JobError;

/// Current time in unix seconds, the unit of every persisted timestamp.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Surface a job belongs to. Each surface has its own active pointer per owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Single,
    Batch,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Single => "single",
            JobKind::Batch => "batch",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "single" => Some(JobKind::Single),
            "batch" => Some(JobKind::Batch),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed, // terminal
    Error,     // terminal
    Cancelled, // terminal
}

impl JobStatus {
    /// Returns true if the job can never run again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    /// The only edges are `running -> {completed, error, cancelled}`.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (
                JobStatus::Running,
                JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
            )
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "error" => Some(JobStatus::Error),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completed/total counter for a nested level of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubProgress {
    pub completed: u32,
    pub total: u32,
}

/// Progress of a job as last reported by the remote service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Items (sites) completed.
    pub completed: u32,
    /// Items (sites) in the job.
    pub total: u32,
    /// Dispensers within the current item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispensers: Option<SubProgress>,
    /// Fuel grades within the current dispenser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel_grades: Option<SubProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
}

impl JobProgress {
    pub fn with_total(total: u32) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }
}

/// Everything needed to retry or continue a job instead of restarting it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item_ids: Vec<String>,
    /// Items already done when the job stopped; used as the next start offset.
    #[serde(default)]
    pub last_completed: u32,
    /// Job this one was resumed from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    /// Opaque options the job was started with.
    #[serde(default)]
    pub options: serde_json::Value,
}

/// One tracked automation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub owner_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Only meaningful while `status` is running.
    pub paused: bool,
    pub created_at: i64,
    pub last_updated_at: i64,
    pub ended_at: Option<i64>,
    pub progress: JobProgress,
    pub message: Option<String>,
    pub pause_reason: Option<String>,
    pub resume_context: Option<ResumeContext>,
}

impl Job {
    /// Create a new running job.
    ///
    /// # Arguments
    /// * `job_id` - Identifier assigned by the remote service
    /// * `owner_id` - Operator who owns the job
    /// * `kind` - Surface the job runs on
    /// * `total_items` - Number of items the remote service reported at start
    /// * `now` - Creation time in unix seconds
    pub fn new_running(
        job_id: impl Into<String>,
        owner_id: impl Into<String>,
        kind: JobKind,
        total_items: u32,
        now: i64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            owner_id: owner_id.into(),
            kind,
            status: JobStatus::Running,
            paused: false,
            created_at: now,
            last_updated_at: now,
            ended_at: None,
            progress: JobProgress::with_total(total_items),
            message: None,
            pause_reason: None,
            resume_context: None,
        }
    }

    pub fn with_resume_context(mut self, context: ResumeContext) -> Self {
        self.resume_context = Some(context);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move the job to `to`. Re-applying the current status is a no-op.
    pub fn transition_to(&mut self, to: JobStatus, now: i64) -> Result<(), JobError> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.status = to;
        self.last_updated_at = now;
        if to.is_terminal() {
            self.ended_at = Some(now);
            self.paused = false;
            self.pause_reason = None;
            if let Some(context) = self.resume_context.as_mut() {
                context.last_completed = self.progress.completed;
            }
        }
        Ok(())
    }

    /// Toggle the paused flag. Only a running job can be paused or resumed.
    pub fn set_paused(
        &mut self,
        paused: bool,
        reason: Option<String>,
        now: i64,
    ) -> Result<(), JobError> {
        if self.status != JobStatus::Running {
            return Err(JobError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: if paused { "paused" } else { "running" }.to_string(),
            });
        }
        match (self.paused, paused) {
            (true, true) => return Err(JobError::AlreadyPaused(self.job_id.clone())),
            (false, false) => return Err(JobError::NotPaused(self.job_id.clone())),
            _ => {}
        }
        self.paused = paused;
        self.pause_reason = if paused { reason } else { None };
        self.last_updated_at = now;
        if paused {
            if let Some(context) = self.resume_context.as_mut() {
                context.last_completed = self.progress.completed;
            }
        }
        Ok(())
    }

    /// True for terminal jobs that ended more than `max_age_secs` before `now`
    /// (creation time stands in when no end time was recorded). Running and
    /// paused jobs are never stale.
    pub fn is_stale(&self, now: i64, max_age_secs: i64) -> bool {
        let age = now.saturating_sub(self.ended_at.unwrap_or(self.created_at));
        self.is_terminal() && !self.paused && age > max_age_secs
    }
}
