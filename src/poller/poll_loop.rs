//! Body of one polling task.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::listener::{JobListener, JobSnapshot};
use super::registry::{LoopState, Registry};
use super::timing::PollTiming;
use crate::error::JobError;
use crate::heuristic::{CompletionHeuristic, Decision};
use crate::job_store::{unix_now, Job, JobStatus, JobStore};
use crate::remote::{RemoteError, RemoteJobClient, StatusResponse};

const NOT_FOUND_MESSAGE: &str = "Job is no longer known to the automation service";

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct PollLoop {
    pub job_id: String,
    pub owner_id: String,
    pub generation: u64,
    pub store: Arc<dyn JobStore>,
    pub remote: Arc<dyn RemoteJobClient>,
    pub heuristic: Arc<CompletionHeuristic>,
    pub listener: Arc<dyn JobListener>,
    pub timing: Arc<Mutex<PollTiming>>,
    pub gate: Arc<Mutex<()>>,
    pub cancel: CancellationToken,
    pub registry: Registry,
    pub tick_interval: Duration,
    pub max_consecutive_failures: u32,
}

impl PollLoop {
    /// Tick, check and deliver until the job ends or the loop is cancelled.
    pub async fn run(self) {
        debug!(
            "Polling loop for job {} started (generation {})",
            self.job_id, self.generation
        );
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let check_at = self.lock_timing().next_check_at;
            let flow = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Flow::Stop,
                _ = ticker.tick() => self.poll_once().await,
                _ = sleep_until(check_at) => self.check_completion(),
            };
            if let Flow::Stop = flow {
                break;
            }
        }

        debug!(
            "Polling loop for job {} exited (generation {})",
            self.job_id, self.generation
        );
    }

    fn lock_timing(&self) -> MutexGuard<'_, PollTiming> {
        self.timing.lock().unwrap()
    }

    async fn poll_once(&self) -> Flow {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Flow::Stop,
            result = self.remote.get_status(&self.job_id) => result,
        };

        match result {
            Ok(response) => self.handle_status(response),
            Err(RemoteError::NotFound(_)) => {
                warn!("Remote service no longer knows job {}", self.job_id);
                self.deliver(
                    &mut |job| {
                        job.message = Some(NOT_FOUND_MESSAGE.to_string());
                        job.transition_to(JobStatus::Error, unix_now())?;
                        Ok(())
                    },
                    false,
                )
            }
            Err(e) => self.handle_failure(e),
        }
    }

    fn handle_status(&self, response: StatusResponse) -> Flow {
        let changed = self.lock_timing().observe(
            response.status,
            response.message.as_deref(),
            Instant::now(),
        );
        if changed {
            debug!(
                "Job {} reports {:?}: {}",
                self.job_id,
                response.status,
                response.message.as_deref().unwrap_or("")
            );
        }

        let new_status = JobStatus::from(response.status);
        self.deliver(
            &mut |job| {
                let now = unix_now();
                if let Some(message) = &response.message {
                    job.message = Some(message.clone());
                }
                if let Some(progress) = &response.progress {
                    job.progress = progress.clone();
                }
                job.last_updated_at = now;
                job.transition_to(new_status, now)?;
                Ok(())
            },
            false,
        )
    }

    fn handle_failure(&self, err: RemoteError) -> Flow {
        let failures = {
            let mut timing = self.lock_timing();
            timing.consecutive_failures = timing.consecutive_failures.saturating_add(1);
            timing.consecutive_failures
        };
        debug!(
            "Status poll for job {} failed ({} in a row): {}",
            self.job_id, failures, err
        );

        if failures == self.max_consecutive_failures.saturating_add(1) {
            warn!(
                "Status polling for job {} has failed {} times in a row, still retrying: {}",
                self.job_id, failures, err
            );
            let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
            if self.cancel.is_cancelled() {
                return Flow::Stop;
            }
            self.listener.on_error(
                &self.job_id,
                &JobError::TransientNetwork {
                    job_id: self.job_id.clone(),
                    consecutive_failures: failures,
                },
            );
        }
        Flow::Continue
    }

    fn check_completion(&self) -> Flow {
        let now = Instant::now();
        let decision = {
            let mut timing = self.lock_timing();
            let Some(since_change) = timing.since_change(now) else {
                // nothing heard yet, so there is no silence to measure
                timing.next_check_at = now + self.heuristic.check_interval;
                return Flow::Continue;
            };
            let decision = self.heuristic.classify(
                timing.last_message.as_deref(),
                timing.since_start(now),
                since_change,
            );
            timing.next_check_at = match decision {
                Decision::Warmup => timing.started_at + self.heuristic.grace,
                _ => now + self.heuristic.next_check_in(since_change),
            };
            timing.last_decision = Some(decision.clone());
            decision
        };
        debug!("Completion check for job {}: {:?}", self.job_id, decision);

        if decision != Decision::ForceComplete {
            return Flow::Continue;
        }
        info!(
            "Job {} has been silent for {:?}, treating it as completed",
            self.job_id, self.heuristic.silence
        );
        self.deliver(
            &mut |job| {
                job.transition_to(JobStatus::Completed, unix_now())?;
                Ok(())
            },
            true,
        )
    }

    /// Persist a poll result and notify the listener, unless the loop was halted.
    fn deliver(
        &self,
        apply: &mut dyn FnMut(&mut Job) -> anyhow::Result<()>,
        inferred_completion: bool,
    ) -> Flow {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() {
            return Flow::Stop;
        }

        let mut ended_elsewhere = false;
        let updated = self
            .store
            .update_job(&self.owner_id, &self.job_id, &mut |job| {
                if job.is_terminal() {
                    ended_elsewhere = true;
                    return Ok(());
                }
                apply(job)
            });

        let job = match updated {
            Ok(Some(job)) if !ended_elsewhere => job,
            Ok(Some(job)) => {
                info!(
                    "Job {} is already {}, stopping its polling loop",
                    self.job_id, job.status
                );
                self.deregister();
                return Flow::Stop;
            }
            Ok(None) => {
                warn!(
                    "Job {} is no longer stored for owner {}, stopping its polling loop",
                    self.job_id, self.owner_id
                );
                self.deregister();
                return Flow::Stop;
            }
            Err(e) => {
                error!("Failed to persist poll result for job {}: {}", self.job_id, e);
                return Flow::Continue;
            }
        };

        let snapshot = JobSnapshot {
            decision: self.lock_timing().last_decision.clone(),
            inferred_completion,
            job,
        };
        self.listener.on_update(&snapshot);
        if !snapshot.job.is_terminal() {
            return Flow::Continue;
        }

        self.deregister();
        info!(
            "Job {} ended as {}{}",
            self.job_id,
            snapshot.job.status,
            if inferred_completion { " (inferred)" } else { "" }
        );
        if snapshot.job.status == JobStatus::Error {
            let error = JobError::RemoteJob {
                job_id: self.job_id.clone(),
                message: snapshot
                    .job
                    .message
                    .clone()
                    .unwrap_or_else(|| "remote job failed".to_string()),
            };
            self.listener.on_error(&self.job_id, &error);
        } else {
            self.listener.on_complete(&snapshot);
        }
        Flow::Stop
    }

    /// Remove this loop's registry entry, if it still belongs to this generation.
    fn deregister(&self) {
        let mut registry = self.registry.lock().unwrap();
        let current = matches!(
            registry.get(&self.job_id).map(|entry| &entry.state),
            Some(LoopState::Active(active)) if active.generation == self.generation
        );
        if current {
            registry.remove(&self.job_id);
        }
    }
}
