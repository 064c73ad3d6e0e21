use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use formjobs::config::{HeuristicSettings, PollerSettings, StoreSettings};
use formjobs::job_store::unix_now;
use formjobs::{
    CompletionHeuristic, Job, JobController, JobKind, JobStatus, JobStore, Poller, SqliteJobStore,
};

use super::listener::RecordingListener;
use super::remote::ScriptedRemote;

pub const OWNER_A: &str = "operator-a";
pub const OWNER_B: &str = "operator-b";
pub const FORM_URL: &str = "https://forms.example.com/site/42";

pub const HOUR_SECS: i64 = 3600;

/// A controller wired to an in-memory store, a scripted remote and a
/// recording listener, all reachable from the test.
pub struct Harness {
    pub store: Arc<SqliteJobStore>,
    pub remote: Arc<ScriptedRemote>,
    pub listener: Arc<RecordingListener>,
    pub controller: JobController,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        let store = SqliteJobStore::in_memory(&StoreSettings::default()).unwrap();
        Self::with_store(Arc::new(store))
    }

    /// A harness whose controller has already reconciled `owner_id`.
    pub fn for_owner(owner_id: &str) -> Self {
        let harness = Self::new();
        harness.controller.reconcile_on_startup(owner_id).unwrap();
        harness
    }

    pub fn with_store(store: Arc<SqliteJobStore>) -> Self {
        let remote = ScriptedRemote::new();
        let listener = Arc::new(RecordingListener::default());
        let heuristic = CompletionHeuristic::new(&HeuristicSettings::default()).unwrap();
        let poller = Arc::new(Poller::new(
            store.clone(),
            remote.clone(),
            heuristic,
            PollerSettings::default(),
        ));
        let controller =
            JobController::new(store.clone(), remote.clone(), poller, listener.clone());
        Self {
            store,
            remote,
            listener,
            controller,
        }
    }

    pub fn stored(&self, owner_id: &str, job_id: &str) -> Option<Job> {
        self.store.get_job(owner_id, job_id).unwrap()
    }

    pub fn active_loops(&self) -> usize {
        self.controller.poller().active_loops()
    }
}

/// Persist a job directly, created `age_secs` ago and moved to `status`.
#[allow(dead_code)]
pub fn seed_job(
    store: &SqliteJobStore,
    owner_id: &str,
    job_id: &str,
    kind: JobKind,
    status: JobStatus,
    age_secs: i64,
) -> Job {
    let created_at = unix_now() - age_secs;
    let mut job = Job::new_running(job_id, owner_id, kind, 3, created_at);
    job.transition_to(status, created_at + 60).unwrap();
    store.upsert_job(owner_id, &job).unwrap();
    job
}

/// Poll `condition` on the (paused) test clock until it holds or `limit` passes.
#[allow(dead_code)]
pub async fn wait_until<F: FnMut() -> bool>(limit: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
