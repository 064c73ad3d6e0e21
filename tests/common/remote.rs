//! Scripted stand-in for the automation service.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use formjobs::remote::{
    ControlResponse, RemoteError, RemoteJobClient, StartJobRequest, StartJobResponse,
    StatusResponse,
};
use formjobs::JobKind;

type StatusScript = Arc<dyn Fn(usize) -> Result<StatusResponse, RemoteError> + Send + Sync>;

/// Remote client whose answers are set up by the test.
///
/// Started jobs get ids `job-1`, `job-2`, ... unless a start result was
/// queued. Status calls for a job follow its script, called with the index of
/// the call; jobs without a script report `running` with a fixed message.
/// Status answers for a job can be held back with [`ScriptedRemote::delay_status`].
#[derive(Default)]
pub struct ScriptedRemote {
    started: AtomicUsize,
    start_results: Mutex<VecDeque<Result<StartJobResponse, RemoteError>>>,
    start_requests: Mutex<Vec<StartJobRequest>>,
    scripts: Mutex<HashMap<String, StatusScript>>,
    status_calls: Mutex<HashMap<String, usize>>,
    status_delays: Mutex<HashMap<String, Duration>>,
    reject_control: AtomicBool,
    fail_cancel: AtomicBool,
    pause_calls: Mutex<Vec<(String, Option<String>)>>,
    resume_calls: Mutex<Vec<String>>,
    cancel_calls: Mutex<Vec<String>>,
    clear_calls: Mutex<Vec<(String, JobKind)>>,
}

#[allow(dead_code)]
impl ScriptedRemote {
    pub const DEFAULT_MESSAGE: &'static str = "Working";

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the result of the next `start_job` call.
    pub fn queue_start(&self, result: Result<StartJobResponse, RemoteError>) {
        self.start_results.lock().unwrap().push_back(result);
    }

    /// Script status answers with a function of the call index.
    pub fn script<F>(&self, job_id: &str, script: F)
    where
        F: Fn(usize) -> Result<StatusResponse, RemoteError> + Send + Sync + 'static,
    {
        self.scripts
            .lock()
            .unwrap()
            .insert(job_id.to_string(), Arc::new(script));
    }

    /// Script status answers as a sequence whose last entry repeats forever.
    pub fn script_sequence(&self, job_id: &str, answers: Vec<Result<StatusResponse, RemoteError>>) {
        assert!(!answers.is_empty(), "a status sequence needs at least one answer");
        self.script(job_id, move |call| {
            answers[call.min(answers.len() - 1)].clone()
        });
    }

    /// Hold every status answer for `job_id` back by `delay`.
    pub fn delay_status(&self, job_id: &str, delay: Duration) {
        self.status_delays
            .lock()
            .unwrap()
            .insert(job_id.to_string(), delay);
    }

    pub fn reject_control(&self, reject: bool) {
        self.reject_control.store(reject, Ordering::SeqCst);
    }

    pub fn fail_cancel(&self, fail: bool) {
        self.fail_cancel.store(fail, Ordering::SeqCst);
    }

    pub fn status_calls(&self, job_id: &str) -> usize {
        self.status_calls
            .lock()
            .unwrap()
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn start_requests(&self) -> Vec<StartJobRequest> {
        self.start_requests.lock().unwrap().clone()
    }

    pub fn pause_calls(&self) -> Vec<(String, Option<String>)> {
        self.pause_calls.lock().unwrap().clone()
    }

    pub fn resume_calls(&self) -> Vec<String> {
        self.resume_calls.lock().unwrap().clone()
    }

    pub fn cancel_calls(&self) -> Vec<String> {
        self.cancel_calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) -> Vec<(String, JobKind)> {
        self.clear_calls.lock().unwrap().clone()
    }

    fn control_response(&self) -> ControlResponse {
        ControlResponse {
            success: !self.reject_control.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl RemoteJobClient for ScriptedRemote {
    async fn start_job(&self, request: &StartJobRequest) -> Result<StartJobResponse, RemoteError> {
        self.start_requests.lock().unwrap().push(request.clone());
        if let Some(result) = self.start_results.lock().unwrap().pop_front() {
            return result;
        }
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let total_items = request
            .item_ids
            .as_ref()
            .map_or(1, |items| items.len() as u32);
        Ok(StartJobResponse {
            job_id: format!("job-{}", n),
            total_items,
        })
    }

    async fn get_status(&self, job_id: &str) -> Result<StatusResponse, RemoteError> {
        let call = {
            let mut calls = self.status_calls.lock().unwrap();
            let count = calls.entry(job_id.to_string()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let delay = self.status_delays.lock().unwrap().get(job_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let script = self.scripts.lock().unwrap().get(job_id).cloned();
        match script {
            Some(script) => script(call),
            None => Ok(StatusResponse::running(Self::DEFAULT_MESSAGE)),
        }
    }

    async fn pause_job(
        &self,
        job_id: &str,
        reason: Option<&str>,
    ) -> Result<ControlResponse, RemoteError> {
        self.pause_calls
            .lock()
            .unwrap()
            .push((job_id.to_string(), reason.map(str::to_string)));
        Ok(self.control_response())
    }

    async fn resume_job(&self, job_id: &str) -> Result<ControlResponse, RemoteError> {
        self.resume_calls.lock().unwrap().push(job_id.to_string());
        Ok(self.control_response())
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), RemoteError> {
        self.cancel_calls.lock().unwrap().push(job_id.to_string());
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(RemoteError::Transient("connection refused".to_string()));
        }
        Ok(())
    }

    async fn clear_history(&self, owner_id: &str, kind: JobKind) -> Result<(), RemoteError> {
        self.clear_calls
            .lock()
            .unwrap()
            .push((owner_id.to_string(), kind));
        Ok(())
    }
}
