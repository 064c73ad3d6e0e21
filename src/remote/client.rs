//! Client for the external job-control service.
//!
//! The poller and controller only see the [`RemoteJobClient`] trait; the
//! production implementation speaks HTTP/JSON with `reqwest`.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::types::*;
use crate::job_store::JobKind;

/// Operations the lifecycle subsystem needs from the remote service.
#[async_trait]
pub trait RemoteJobClient: Send + Sync {
    /// Start a job. Fails with [`RemoteError::AlreadyRunning`] on a conflicting job.
    async fn start_job(&self, request: &StartJobRequest) -> Result<StartJobResponse, RemoteError>;

    /// Query job status. Idempotent and side-effect free.
    async fn get_status(&self, job_id: &str) -> Result<StatusResponse, RemoteError>;

    async fn pause_job(
        &self,
        job_id: &str,
        reason: Option<&str>,
    ) -> Result<ControlResponse, RemoteError>;

    async fn resume_job(&self, job_id: &str) -> Result<ControlResponse, RemoteError>;

    async fn cancel_job(&self, job_id: &str) -> Result<(), RemoteError>;

    /// Drop the remote side's history for one surface of an owner.
    async fn clear_history(&self, owner_id: &str, kind: JobKind) -> Result<(), RemoteError>;
}

/// HTTP implementation of [`RemoteJobClient`].
#[derive(Clone)]
pub struct HttpRemoteJobClient {
    client: Client,
    base_url: String,
}

impl HttpRemoteJobClient {
    /// Create a new HttpRemoteJobClient.
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the automation service (e.g., "http://localhost:8000")
    /// * `timeout_secs` - Request timeout in seconds
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the base URL of the automation service.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn job_url(&self, job_id: &str, action: &str) -> String {
        format!("{}/jobs/{}/{}", self.base_url, job_id, action)
    }

    async fn send(
        &self,
        request: RequestBuilder,
        job_id: Option<&str>,
    ) -> Result<Response, RemoteError> {
        let response = request.send().await.map_err(classify_send_error)?;
        check_status(response, job_id).await
    }
}

fn classify_send_error(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Decode(err.to_string())
    } else {
        RemoteError::Transient(err.to_string())
    }
}

async fn check_status(response: Response, job_id: Option<&str>) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match (status, job_id) {
        (StatusCode::CONFLICT, _) => Err(RemoteError::AlreadyRunning),
        (StatusCode::NOT_FOUND, Some(job_id)) => Err(RemoteError::NotFound(job_id.to_string())),
        (status, _) if status.is_server_error() => Err(RemoteError::Transient(format!(
            "remote service returned {}",
            status
        ))),
        (status, _) => {
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    response
        .json()
        .await
        .map_err(|e| RemoteError::Decode(e.to_string()))
}

#[async_trait]
impl RemoteJobClient for HttpRemoteJobClient {
    // =========================================================================
    // Job Start
    // =========================================================================

    async fn start_job(&self, request: &StartJobRequest) -> Result<StartJobResponse, RemoteError> {
        let url = format!("{}/jobs/start", self.base_url);
        debug!("Starting {} job for {} via {}", request.kind, request.owner, url);
        let response = self.send(self.client.post(&url).json(request), None).await?;
        decode(response).await
    }

    // =========================================================================
    // Status
    // =========================================================================

    async fn get_status(&self, job_id: &str) -> Result<StatusResponse, RemoteError> {
        let url = self.job_url(job_id, "status");
        let response = self.send(self.client.get(&url), Some(job_id)).await?;
        decode(response).await
    }

    // =========================================================================
    // Control
    // =========================================================================

    async fn pause_job(
        &self,
        job_id: &str,
        reason: Option<&str>,
    ) -> Result<ControlResponse, RemoteError> {
        let body = ControlRequest {
            reason: reason.map(str::to_string),
        };
        let url = self.job_url(job_id, "pause");
        let response = self
            .send(self.client.post(&url).json(&body), Some(job_id))
            .await?;
        decode(response).await
    }

    async fn resume_job(&self, job_id: &str) -> Result<ControlResponse, RemoteError> {
        let url = self.job_url(job_id, "resume");
        let response = self
            .send(
                self.client.post(&url).json(&ControlRequest::default()),
                Some(job_id),
            )
            .await?;
        decode(response).await
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), RemoteError> {
        let url = self.job_url(job_id, "cancel");
        self.send(self.client.post(&url), Some(job_id)).await?;
        Ok(())
    }

    async fn clear_history(&self, owner_id: &str, kind: JobKind) -> Result<(), RemoteError> {
        let url = format!("{}/jobs/history", self.base_url);
        self.send(
            self.client
                .delete(&url)
                .query(&[("owner", owner_id), ("surface", kind.as_str())]),
            None,
        )
        .await?;
        Ok(())
    }
}
