//! Job lifecycle controller.
//!
//! Public operations for starting, pausing, resuming, cancelling and
//! clearing jobs. Every operation is scoped to the active owner, which is set
//! by [`JobController::reconcile_on_startup`].

use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::job_store::{unix_now, Job, JobKind, JobStatus, JobStore, ResumeContext};
use crate::poller::{JobListener, JobSnapshot, Poller};
use crate::remote::{RemoteError, RemoteJobClient, StartJobRequest};

/// Drives jobs through their lifecycle against the store, the remote service
/// and the poller.
pub struct JobController {
    store: Arc<dyn JobStore>,
    remote: Arc<dyn RemoteJobClient>,
    poller: Arc<Poller>,
    listener: Arc<dyn JobListener>,
    active_owner: RwLock<Option<String>>,
}

impl JobController {
    /// Create a new JobController.
    ///
    /// # Arguments
    /// * `store` - Persisted job store
    /// * `remote` - Client for the automation service
    /// * `poller` - Poller that runs the status loops
    /// * `listener` - Receives every status update and control result
    pub fn new(
        store: Arc<dyn JobStore>,
        remote: Arc<dyn RemoteJobClient>,
        poller: Arc<Poller>,
        listener: Arc<dyn JobListener>,
    ) -> Self {
        Self {
            store,
            remote,
            poller,
            listener,
            active_owner: RwLock::new(None),
        }
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub fn active_owner(&self) -> Option<String> {
        self.active_owner.read().unwrap().clone()
    }

    // =========================================================================
    // Startup / teardown
    // =========================================================================

    /// Make `owner_id` the active owner and pick up its persisted jobs.
    ///
    /// Stops every loop of the previously active owner, loads the owner's jobs
    /// (stale ones are pruned), clears pointers to jobs that no longer exist
    /// and starts a poller for every running job (paused ones stay paused).
    pub fn reconcile_on_startup(&self, owner_id: &str) -> Result<Vec<Job>, JobError> {
        self.poller.stop_all();
        let previous = self
            .active_owner
            .write()
            .unwrap()
            .replace(owner_id.to_string());
        match previous {
            Some(previous) if previous != owner_id => {
                info!("Switching active owner from {} to {}", previous, owner_id)
            }
            _ => info!("Reconciling jobs of owner {}", owner_id),
        }

        let jobs = self.store.load(owner_id)?;

        for kind in [JobKind::Single, JobKind::Batch] {
            if let Some(pointer) = self.store.load_pointer(owner_id, kind)? {
                if !jobs.iter().any(|job| job.job_id == pointer) {
                    debug!("Clearing dangling {} pointer to job {}", kind, pointer);
                    self.store.save_pointer(owner_id, kind, None)?;
                }
            }
        }

        let mut resumed = 0;
        for job in jobs.iter().filter(|job| job.status == JobStatus::Running) {
            let registered = if job.paused {
                self.poller
                    .start_paused(owner_id, &job.job_id, Arc::clone(&self.listener))
            } else {
                self.poller
                    .start(owner_id, &job.job_id, Arc::clone(&self.listener))
            };
            match registered {
                Ok(()) => resumed += 1,
                Err(e) => warn!("Failed to resume polling for job {}: {}", job.job_id, e),
            }
        }

        info!(
            "Loaded {} jobs for owner {} ({} still running)",
            jobs.len(),
            owner_id,
            resumed
        );
        Ok(jobs)
    }

    /// Stop every polling loop.
    pub fn shutdown(&self) {
        self.poller.stop_all();
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Start a single-item job against `url`.
    pub async fn start_single(
        &self,
        url: &str,
        options: serde_json::Value,
    ) -> Result<Job, JobError> {
        let owner = self.owner()?;
        self.ensure_surface_free(&owner, JobKind::Single, None)?;

        let request = StartJobRequest {
            kind: JobKind::Single,
            owner: owner.clone(),
            url: Some(url.to_string()),
            item_ids: None,
            options: options.clone(),
            resume_from_job_id: None,
            start_index: None,
        };
        let context = ResumeContext {
            target_url: Some(url.to_string()),
            options,
            ..Default::default()
        };
        self.launch(&owner, request, context, None).await
    }

    /// Start a batch job over `item_ids`.
    ///
    /// With `resume_from_job_id` the new job continues where that job stopped:
    /// the previous job must be terminal or paused, its completed count becomes
    /// the start offset, and its items are reused when `item_ids` is empty.
    /// A paused previous job is cancelled once the service has accepted the
    /// new one; if the start fails it is left paused.
    pub async fn start_batch(
        &self,
        item_ids: Vec<String>,
        options: serde_json::Value,
        resume_from_job_id: Option<&str>,
    ) -> Result<Job, JobError> {
        let owner = self.owner()?;

        let mut item_ids = item_ids;
        let mut start_index = None;
        let mut supersedes = None;
        if let Some(previous_id) = resume_from_job_id {
            let previous = self.owned_job(&owner, previous_id)?;
            if !previous.is_terminal() && !previous.paused {
                return Err(JobError::InvalidTransition {
                    from: previous.status.as_str().to_string(),
                    to: "resumed".to_string(),
                });
            }
            let context = previous.resume_context.clone().unwrap_or_default();
            let offset = if previous.resume_context.is_some() {
                context.last_completed
            } else {
                previous.progress.completed
            };
            if item_ids.is_empty() {
                item_ids = context.item_ids;
            }
            start_index = Some(offset);
            if previous.paused {
                supersedes = Some(previous_id);
            }
        }

        self.ensure_surface_free(&owner, JobKind::Batch, supersedes)?;

        let request = StartJobRequest {
            kind: JobKind::Batch,
            owner: owner.clone(),
            url: None,
            item_ids: Some(item_ids.clone()),
            options: options.clone(),
            resume_from_job_id: resume_from_job_id.map(str::to_string),
            start_index,
        };
        let context = ResumeContext {
            target_url: None,
            item_ids,
            last_completed: start_index.unwrap_or(0),
            resumed_from: resume_from_job_id.map(str::to_string),
            options,
        };
        self.launch(&owner, request, context, supersedes).await
    }

    /// Start `request` on the service and track the accepted job. `supersedes`
    /// names a paused job the new one replaces; it is closed out only after
    /// the service accepted the start.
    async fn launch(
        &self,
        owner: &str,
        request: StartJobRequest,
        context: ResumeContext,
        supersedes: Option<&str>,
    ) -> Result<Job, JobError> {
        let kind = request.kind;
        let response = match self.remote.start_job(&request).await {
            Ok(response) => response,
            Err(RemoteError::AlreadyRunning) => {
                info!("Remote service refused {} job for {}: already running", kind, owner);
                return Err(JobError::Conflict { kind, job_id: None });
            }
            Err(e) => return Err(e.into()),
        };

        let job = Job::new_running(
            response.job_id,
            owner,
            kind,
            response.total_items,
            unix_now(),
        )
        .with_resume_context(context);
        self.store.upsert_job(owner, &job)?;
        if let Some(previous_id) = supersedes {
            info!(
                "Cancelling paused job {} now that job {} continues it",
                previous_id, job.job_id
            );
            if let Err(e) = self.close_out(owner, previous_id).await {
                warn!("Failed to cancel superseded job {}: {}", previous_id, e);
            }
        }
        self.store.save_pointer(owner, kind, Some(&job.job_id))?;
        info!(
            "Started {} job {} for owner {} ({} items)",
            kind, job.job_id, owner, job.progress.total
        );

        // The controller's snapshot goes out before the loop can report
        self.notify_update(&job);
        if self.is_active_owner(owner) {
            self.poller
                .start(owner, &job.job_id, Arc::clone(&self.listener))?;
        } else {
            warn!(
                "Owner {} is no longer active, job {} will be polled on its next reconcile",
                owner, job.job_id
            );
        }
        Ok(job)
    }

    // =========================================================================
    // Pause / resume / cancel
    // =========================================================================

    /// Pause a running job on the remote side, then locally.
    pub async fn pause(&self, job_id: &str, reason: Option<String>) -> Result<Job, JobError> {
        let owner = self.owner()?;
        let job = self.owned_job(&owner, job_id)?;
        if job.is_terminal() {
            return Err(JobError::InvalidTransition {
                from: job.status.as_str().to_string(),
                to: "paused".to_string(),
            });
        }
        if job.paused {
            return Err(JobError::AlreadyPaused(job_id.to_string()));
        }

        let response = self.remote.pause_job(job_id, reason.as_deref()).await?;
        if !response.success {
            return Err(JobError::RemoteRejected {
                operation: "pause",
                job_id: job_id.to_string(),
            });
        }

        match self.poller.pause(job_id) {
            Ok(()) | Err(JobError::AlreadyPaused(_)) => {}
            Err(JobError::NotFound(_)) => debug!("Job {} had no polling loop to pause", job_id),
            Err(e) => return Err(e),
        }
        let job = self.update_owned(&owner, job_id, &mut |job| {
            job.set_paused(true, reason.clone(), unix_now())?;
            Ok(())
        })?;
        info!("Paused job {}", job_id);
        self.notify_update(&job);
        Ok(job)
    }

    /// Resume a paused job on the remote side, then locally.
    pub async fn resume(&self, job_id: &str) -> Result<Job, JobError> {
        let owner = self.owner()?;
        let job = self.owned_job(&owner, job_id)?;
        if job.is_terminal() {
            return Err(JobError::InvalidTransition {
                from: job.status.as_str().to_string(),
                to: "running".to_string(),
            });
        }
        if !job.paused {
            return Err(JobError::NotPaused(job_id.to_string()));
        }

        let response = self.remote.resume_job(job_id).await?;
        if !response.success {
            return Err(JobError::RemoteRejected {
                operation: "resume",
                job_id: job_id.to_string(),
            });
        }

        let job = self.update_owned(&owner, job_id, &mut |job| {
            job.set_paused(false, None, unix_now())?;
            Ok(())
        })?;
        self.notify_update(&job);
        match self.poller.resume(job_id) {
            Ok(()) | Err(JobError::NotPaused(_)) => {}
            Err(JobError::NotFound(_)) => {
                self.poller
                    .start(&owner, job_id, Arc::clone(&self.listener))?;
            }
            Err(e) => return Err(e),
        }
        info!("Resumed job {}", job_id);
        Ok(job)
    }

    /// Cancel a job. The remote cancel is best-effort; the job is cancelled
    /// locally even if the remote call fails.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, JobError> {
        let owner = self.owner()?;
        let job = self.owned_job(&owner, job_id)?;
        if job.is_terminal() {
            return Err(JobError::InvalidTransition {
                from: job.status.as_str().to_string(),
                to: JobStatus::Cancelled.as_str().to_string(),
            });
        }
        self.close_out(&owner, job_id).await
    }

    /// Cancel remotely (best-effort), stop the loop, mark the job cancelled,
    /// release its surface and report it as complete.
    async fn close_out(&self, owner: &str, job_id: &str) -> Result<Job, JobError> {
        if let Err(e) = self.remote.cancel_job(job_id).await {
            warn!(
                "Remote cancel of job {} failed, cancelling locally anyway: {}",
                job_id, e
            );
        }

        self.poller.stop(job_id);
        let job = self.update_owned(owner, job_id, &mut |job| {
            job.transition_to(JobStatus::Cancelled, unix_now())?;
            Ok(())
        })?;
        if self.store.load_pointer(owner, job.kind)?.as_deref() == Some(job_id) {
            self.store.save_pointer(owner, job.kind, None)?;
        }
        info!("Cancelled job {}", job_id);

        let snapshot = Self::snapshot(&job);
        self.listener.on_update(&snapshot);
        self.listener.on_complete(&snapshot);
        Ok(job)
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Delete every job of one surface, remotely (best-effort) and locally.
    ///
    /// Refused while any job of that surface is still running.
    pub async fn clear_history(&self, owner_id: &str, kind: JobKind) -> Result<usize, JobError> {
        let owner = self.owner()?;
        if owner_id != owner {
            return Err(JobError::OwnershipViolation {
                job_id: format!("{} history", kind),
                owner_id: owner_id.to_string(),
            });
        }

        let jobs = self.store.load(owner_id)?;
        if jobs
            .iter()
            .any(|job| job.kind == kind && job.status == JobStatus::Running)
        {
            return Err(JobError::HistoryBusy(kind));
        }

        if let Err(e) = self.remote.clear_history(owner_id, kind).await {
            warn!("Failed to clear remote {} history for {}: {}", kind, owner_id, e);
        }
        let deleted = self.store.delete_jobs(owner_id, kind)?;
        info!("Cleared {} {} jobs of owner {}", deleted, kind, owner_id);
        Ok(deleted)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Jobs of the active owner, optionally of one surface, oldest first.
    pub fn jobs(&self, kind: Option<JobKind>) -> Result<Vec<Job>, JobError> {
        let owner = self.owner()?;
        Ok(self
            .store
            .load(&owner)?
            .into_iter()
            .filter(|job| kind.map_or(true, |kind| job.kind == kind))
            .collect())
    }

    pub fn job(&self, job_id: &str) -> Result<Job, JobError> {
        let owner = self.owner()?;
        self.owned_job(&owner, job_id)
    }

    /// The job the surface's active pointer names, if any.
    pub fn active_job(&self, kind: JobKind) -> Result<Option<Job>, JobError> {
        let owner = self.owner()?;
        match self.store.load_pointer(&owner, kind)? {
            Some(job_id) => Ok(self.store.get_job(&owner, &job_id)?),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn owner(&self) -> Result<String, JobError> {
        self.active_owner().ok_or(JobError::NoActiveOwner)
    }

    fn is_active_owner(&self, owner_id: &str) -> bool {
        self.active_owner.read().unwrap().as_deref() == Some(owner_id)
    }

    fn owned_job(&self, owner_id: &str, job_id: &str) -> Result<Job, JobError> {
        self.store
            .get_job(owner_id, job_id)?
            .ok_or_else(|| JobError::OwnershipViolation {
                job_id: job_id.to_string(),
                owner_id: owner_id.to_string(),
            })
    }

    fn update_owned(
        &self,
        owner_id: &str,
        job_id: &str,
        mutate: &mut dyn FnMut(&mut Job) -> anyhow::Result<()>,
    ) -> Result<Job, JobError> {
        self.store
            .update_job(owner_id, job_id, mutate)?
            .ok_or_else(|| JobError::OwnershipViolation {
                job_id: job_id.to_string(),
                owner_id: owner_id.to_string(),
            })
    }

    /// A surface is free unless its pointer names a job that has not ended.
    /// `replacing` is a job the caller is about to supersede and does not count.
    fn ensure_surface_free(
        &self,
        owner_id: &str,
        kind: JobKind,
        replacing: Option<&str>,
    ) -> Result<(), JobError> {
        let Some(pointer) = self.store.load_pointer(owner_id, kind)? else {
            return Ok(());
        };
        if replacing == Some(pointer.as_str()) {
            return Ok(());
        }
        match self.store.get_job(owner_id, &pointer)? {
            Some(job) if !job.is_terminal() => Err(JobError::Conflict {
                kind,
                job_id: Some(pointer),
            }),
            _ => Ok(()),
        }
    }

    fn snapshot(job: &Job) -> JobSnapshot {
        JobSnapshot {
            job: job.clone(),
            decision: None,
            inferred_completion: false,
        }
    }

    fn notify_update(&self, job: &Job) {
        self.listener.on_update(&Self::snapshot(job));
    }
}
