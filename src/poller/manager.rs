use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::listener::JobListener;
use super::poll_loop::PollLoop;
use super::registry::{ActiveLoop, LoopEntry, LoopState, Registry};
use super::timing::PollTiming;
use crate::config::PollerSettings;
use crate::error::JobError;
use crate::heuristic::CompletionHeuristic;
use crate::job_store::JobStore;
use crate::remote::RemoteJobClient;

/// Owns every polling loop, keyed by job id.
///
/// Each registered job is either active (a spawned task is polling it) or
/// paused (timing is kept, nothing runs). All methods are synchronous and
/// must be called from within a tokio runtime.
pub struct Poller {
    store: Arc<dyn JobStore>,
    remote: Arc<dyn RemoteJobClient>,
    heuristic: Arc<CompletionHeuristic>,
    settings: PollerSettings,
    registry: Registry,
    next_generation: AtomicU64,
}

impl Poller {
    pub fn new(
        store: Arc<dyn JobStore>,
        remote: Arc<dyn RemoteJobClient>,
        heuristic: CompletionHeuristic,
        settings: PollerSettings,
    ) -> Self {
        Self {
            store,
            remote,
            heuristic: Arc::new(heuristic),
            settings,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start polling a job.
    ///
    /// Fails with `OwnershipViolation` if the owner has no such job and with
    /// `AlreadyActive` if a loop is already running for it. A paused entry is
    /// resumed in place.
    pub fn start(
        &self,
        owner_id: &str,
        job_id: &str,
        listener: Arc<dyn JobListener>,
    ) -> Result<(), JobError> {
        self.check_pollable(owner_id, job_id)?;

        let mut registry = self.registry.lock().unwrap();
        match registry.get_mut(job_id) {
            Some(entry) if entry.owner_id != owner_id => Err(JobError::OwnershipViolation {
                job_id: job_id.to_string(),
                owner_id: owner_id.to_string(),
            }),
            Some(entry) if entry.is_active() => Err(JobError::AlreadyActive(job_id.to_string())),
            Some(entry) => {
                entry.listener = listener;
                entry.timing.lock().unwrap().resume(Instant::now());
                entry.state = LoopState::Active(self.spawn_loop(job_id, entry));
                info!("Resumed polling for job {}", job_id);
                Ok(())
            }
            None => {
                let mut entry = LoopEntry::new(owner_id, listener, self.fresh_timing());
                entry.state = LoopState::Active(self.spawn_loop(job_id, &entry));
                registry.insert(job_id.to_string(), entry);
                info!("Started polling for job {} (owner {})", job_id, owner_id);
                Ok(())
            }
        }
    }

    /// Register a job in the paused state without polling it.
    ///
    /// Used for jobs that were persisted as paused. A later `start` or
    /// `resume` begins polling.
    pub fn start_paused(
        &self,
        owner_id: &str,
        job_id: &str,
        listener: Arc<dyn JobListener>,
    ) -> Result<(), JobError> {
        self.check_pollable(owner_id, job_id)?;

        let mut registry = self.registry.lock().unwrap();
        match registry.get_mut(job_id) {
            Some(entry) if entry.owner_id != owner_id => Err(JobError::OwnershipViolation {
                job_id: job_id.to_string(),
                owner_id: owner_id.to_string(),
            }),
            Some(entry) if entry.is_active() => Err(JobError::AlreadyActive(job_id.to_string())),
            Some(entry) => {
                entry.listener = listener;
                Ok(())
            }
            None => {
                let mut timing = self.fresh_timing();
                timing.pause(Instant::now());
                registry.insert(
                    job_id.to_string(),
                    LoopEntry::new(owner_id, listener, timing),
                );
                info!("Registered paused job {} (owner {})", job_id, owner_id);
                Ok(())
            }
        }
    }

    /// Stop ticking a job but keep its timing so `resume` continues where it left off.
    pub fn pause(&self, job_id: &str) -> Result<(), JobError> {
        let (active, gate) = {
            let mut registry = self.registry.lock().unwrap();
            let entry = registry
                .get_mut(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            match std::mem::replace(&mut entry.state, LoopState::Paused) {
                LoopState::Paused => return Err(JobError::AlreadyPaused(job_id.to_string())),
                LoopState::Active(active) => {
                    entry.timing.lock().unwrap().pause(Instant::now());
                    (active, Arc::clone(&entry.gate))
                }
            }
        };
        active.halt(&gate);
        info!("Paused polling for job {}", job_id);
        Ok(())
    }

    /// Restart the loop of a paused job.
    pub fn resume(&self, job_id: &str) -> Result<(), JobError> {
        let mut registry = self.registry.lock().unwrap();
        let entry = registry
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if entry.is_active() {
            return Err(JobError::NotPaused(job_id.to_string()));
        }
        entry.timing.lock().unwrap().resume(Instant::now());
        entry.state = LoopState::Active(self.spawn_loop(job_id, entry));
        info!("Resumed polling for job {}", job_id);
        Ok(())
    }

    /// Cancel a job's loop and forget it. Unknown ids are ignored.
    ///
    /// No store write or callback from that loop happens after this returns.
    pub fn stop(&self, job_id: &str) {
        let removed = self.registry.lock().unwrap().remove(job_id);
        if let Some(entry) = removed {
            if let LoopState::Active(active) = entry.state {
                active.halt(&entry.gate);
            }
            info!("Stopped polling for job {}", job_id);
        }
    }

    /// Stop every loop. Leaves the registry empty.
    pub fn stop_all(&self) {
        let entries: Vec<(String, LoopEntry)> =
            self.registry.lock().unwrap().drain().collect();
        if entries.is_empty() {
            return;
        }
        let count = entries.len();
        for (job_id, entry) in entries {
            if let LoopState::Active(active) = entry.state {
                active.halt(&entry.gate);
            }
            debug!("Stopped polling for job {}", job_id);
        }
        info!("Stopped {} polling loops", count);
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.registry
            .lock()
            .unwrap()
            .get(job_id)
            .is_some_and(LoopEntry::is_active)
    }

    pub fn is_paused(&self, job_id: &str) -> bool {
        self.registry
            .lock()
            .unwrap()
            .get(job_id)
            .is_some_and(|entry| !entry.is_active())
    }

    /// Number of live (non-paused) loops.
    pub fn active_loops(&self) -> usize {
        self.registry
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.is_active())
            .count()
    }

    /// Ids of every registered job, active or paused, sorted.
    pub fn tracked_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn check_pollable(&self, owner_id: &str, job_id: &str) -> Result<(), JobError> {
        let job = self
            .store
            .get_job(owner_id, job_id)?
            .ok_or_else(|| JobError::OwnershipViolation {
                job_id: job_id.to_string(),
                owner_id: owner_id.to_string(),
            })?;
        if job.is_terminal() {
            return Err(JobError::InvalidTransition {
                from: job.status.as_str().to_string(),
                to: "polling".to_string(),
            });
        }
        Ok(())
    }

    fn fresh_timing(&self) -> PollTiming {
        PollTiming::new(Instant::now(), self.heuristic.grace)
    }

    fn spawn_loop(&self, job_id: &str, entry: &LoopEntry) -> ActiveLoop {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let poll_loop = PollLoop {
            job_id: job_id.to_string(),
            owner_id: entry.owner_id.clone(),
            generation,
            store: Arc::clone(&self.store),
            remote: Arc::clone(&self.remote),
            heuristic: Arc::clone(&self.heuristic),
            listener: Arc::clone(&entry.listener),
            timing: Arc::clone(&entry.timing),
            gate: Arc::clone(&entry.gate),
            cancel: cancel.clone(),
            registry: Arc::clone(&self.registry),
            tick_interval: self.settings.tick_interval(),
            max_consecutive_failures: self.settings.max_consecutive_failures,
        };
        let handle = tokio::spawn(poll_loop.run());
        ActiveLoop {
            generation,
            cancel,
            handle,
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop_all();
    }
}
