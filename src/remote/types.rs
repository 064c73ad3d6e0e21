//! Wire types for the remote job-control API.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job_store::{JobKind, JobProgress, JobStatus};

// =============================================================================
// Requests
// =============================================================================

/// Body of `POST /jobs/start`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartJobRequest {
    pub kind: JobKind,
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_ids: Option<Vec<String>>,
    pub options: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_from_job_id: Option<String>,
    /// Number of items to skip when continuing a previous job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_index: Option<u32>,
}

/// Body of the pause/resume endpoints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControlRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartJobResponse {
    pub job_id: String,
    #[serde(default)]
    pub total_items: u32,
}

/// Status reported by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Running,
    Completed,
    Error,
    Cancelled,
}

impl From<RemoteStatus> for JobStatus {
    fn from(status: RemoteStatus) -> Self {
        match status {
            RemoteStatus::Running => JobStatus::Running,
            RemoteStatus::Completed => JobStatus::Completed,
            RemoteStatus::Error => JobStatus::Error,
            RemoteStatus::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Body of `GET /jobs/{id}/status`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusResponse {
    pub status: RemoteStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub progress: Option<JobProgress>,
}

impl StatusResponse {
    pub fn running(message: impl Into<String>) -> Self {
        Self {
            status: RemoteStatus::Running,
            message: Some(message.into()),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: JobProgress) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
}

// =============================================================================
// Errors
// =============================================================================

/// Failures talking to the remote service.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("Remote service already has a running job")]
    AlreadyRunning,

    #[error("Remote service does not know job {0}")]
    NotFound(String),

    /// Connect errors, timeouts and 5xx responses.
    #[error("Transient remote failure: {0}")]
    Transient(String),

    #[error("Remote service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Returns true if retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Decode(_))
    }
}
