//! End-to-end tests for startup reconciliation, owner switching and pruning.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{seed_job, wait_until, Harness, FORM_URL, HOUR_SECS, OWNER_A, OWNER_B};
use formjobs::config::StoreSettings;
use formjobs::job_store::unix_now;
use formjobs::{Job, JobError, JobKind, JobStatus, JobStore, SqliteJobStore};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_switching_owner_stops_previous_loops() {
    let harness = Harness::for_owner(OWNER_A);
    let job = harness
        .controller
        .start_single(FORM_URL, json!({}))
        .await
        .unwrap();
    assert_eq!(harness.active_loops(), 1);

    let jobs = harness.controller.reconcile_on_startup(OWNER_B).unwrap();
    assert!(jobs.is_empty());
    assert_eq!(harness.controller.active_owner().as_deref(), Some(OWNER_B));
    assert_eq!(harness.active_loops(), 0);

    let calls = harness.remote.status_calls(&job.job_id);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.remote.status_calls(&job.job_id), calls);
}

#[tokio::test(start_paused = true)]
async fn test_other_owners_jobs_are_out_of_reach() {
    let harness = Harness::for_owner(OWNER_A);
    let job = harness
        .controller
        .start_single(FORM_URL, json!({}))
        .await
        .unwrap();
    harness.controller.reconcile_on_startup(OWNER_B).unwrap();

    assert!(matches!(
        harness.controller.job(&job.job_id),
        Err(JobError::OwnershipViolation { .. })
    ));
    assert!(matches!(
        harness.controller.pause(&job.job_id, None).await,
        Err(JobError::OwnershipViolation { .. })
    ));
    assert!(matches!(
        harness.controller.cancel(&job.job_id).await,
        Err(JobError::OwnershipViolation { .. })
    ));
    assert!(harness.remote.pause_calls().is_empty());
    assert!(harness.remote.cancel_calls().is_empty());
    assert!(harness.controller.jobs(None).unwrap().is_empty());

    // the poller refuses it as well
    let result = harness
        .controller
        .poller()
        .start(OWNER_B, &job.job_id, harness.listener.clone());
    assert!(matches!(result, Err(JobError::OwnershipViolation { .. })));

    // owner B can use the single surface while A's job is still running
    let own = harness
        .controller
        .start_single(FORM_URL, json!({}))
        .await
        .unwrap();
    assert_eq!(own.owner_id, OWNER_B);
}

#[tokio::test(start_paused = true)]
async fn test_switching_back_resumes_polling() {
    let harness = Harness::for_owner(OWNER_A);
    let job = harness
        .controller
        .start_single(FORM_URL, json!({}))
        .await
        .unwrap();
    harness.controller.reconcile_on_startup(OWNER_B).unwrap();

    let jobs = harness.controller.reconcile_on_startup(OWNER_A).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_id, job.job_id);
    assert!(harness.controller.poller().is_active(&job.job_id));
    assert_eq!(harness.active_loops(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconciling_twice_does_not_duplicate_loops() {
    let harness = Harness::for_owner(OWNER_A);
    harness
        .controller
        .start_single(FORM_URL, json!({}))
        .await
        .unwrap();
    harness
        .controller
        .start_batch(vec!["site-1".to_string()], json!({}), None)
        .await
        .unwrap();

    harness.controller.reconcile_on_startup(OWNER_A).unwrap();
    harness.controller.reconcile_on_startup(OWNER_A).unwrap();
    assert_eq!(harness.active_loops(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_prunes_stale_jobs() {
    let store = Arc::new(SqliteJobStore::in_memory(&StoreSettings::default()).unwrap());
    seed_job(
        &store,
        OWNER_A,
        "done-25h",
        JobKind::Single,
        JobStatus::Completed,
        25 * HOUR_SECS,
    );
    seed_job(
        &store,
        OWNER_A,
        "done-23h",
        JobKind::Batch,
        JobStatus::Cancelled,
        23 * HOUR_SECS,
    );
    seed_job(
        &store,
        OWNER_A,
        "running-48h",
        JobKind::Batch,
        JobStatus::Running,
        48 * HOUR_SECS,
    );
    let mut paused = seed_job(
        &store,
        OWNER_A,
        "paused-48h",
        JobKind::Single,
        JobStatus::Running,
        48 * HOUR_SECS,
    );
    paused
        .set_paused(true, Some("overnight".to_string()), unix_now())
        .unwrap();
    store.upsert_job(OWNER_A, &paused).unwrap();
    store
        .save_pointer(OWNER_A, JobKind::Single, Some("done-25h"))
        .unwrap();

    let harness = Harness::with_store(store);
    let jobs = harness.controller.reconcile_on_startup(OWNER_A).unwrap();

    let ids: HashSet<&str> = jobs.iter().map(|job| job.job_id.as_str()).collect();
    assert_eq!(ids, HashSet::from(["done-23h", "running-48h", "paused-48h"]));
    assert!(harness.stored(OWNER_A, "done-25h").is_none());
    assert!(harness
        .controller
        .active_job(JobKind::Single)
        .unwrap()
        .is_none());

    let poller = harness.controller.poller();
    assert!(poller.is_active("running-48h"));
    assert!(poller.is_paused("paused-48h"));
    assert!(!poller.is_active("done-23h"));
    assert_eq!(harness.active_loops(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_clears_dangling_pointers() {
    let store = Arc::new(SqliteJobStore::in_memory(&StoreSettings::default()).unwrap());
    store
        .save_pointer(OWNER_A, JobKind::Batch, Some("vanished"))
        .unwrap();

    let harness = Harness::with_store(store);
    harness.controller.reconcile_on_startup(OWNER_A).unwrap();

    assert!(harness
        .store
        .load_pointer(OWNER_A, JobKind::Batch)
        .unwrap()
        .is_none());
    harness
        .controller
        .start_batch(vec!["site-1".to_string()], json!({}), None)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_persisted_paused_job_can_be_resumed() {
    let store = Arc::new(SqliteJobStore::in_memory(&StoreSettings::default()).unwrap());
    let mut job = Job::new_running("batch-7", OWNER_A, JobKind::Batch, 5, unix_now());
    job.set_paused(true, None, unix_now()).unwrap();
    store.upsert_job(OWNER_A, &job).unwrap();
    store
        .save_pointer(OWNER_A, JobKind::Batch, Some("batch-7"))
        .unwrap();

    let harness = Harness::with_store(store);
    harness.controller.reconcile_on_startup(OWNER_A).unwrap();
    assert!(harness.controller.poller().is_paused("batch-7"));

    sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.remote.status_calls("batch-7"), 0);

    // a paused job still holds its surface
    let result = harness
        .controller
        .start_batch(vec!["site-1".to_string()], json!({}), None)
        .await;
    assert!(matches!(
        result,
        Err(JobError::Conflict {
            kind: JobKind::Batch,
            ..
        })
    ));

    harness.controller.resume("batch-7").await.unwrap();
    assert_eq!(harness.remote.resume_calls(), vec!["batch-7".to_string()]);
    assert!(harness.controller.poller().is_active("batch-7"));
    assert!(
        wait_until(Duration::from_secs(5), || harness
            .remote
            .status_calls("batch-7")
            > 0)
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn test_jobs_survive_a_restart() {
    let dir = TempDir::new().unwrap();
    let settings = StoreSettings::default();

    let job_id = {
        let store = Arc::new(SqliteJobStore::open_in_dir(dir.path(), &settings).unwrap());
        let harness = Harness::with_store(store);
        harness.controller.reconcile_on_startup(OWNER_A).unwrap();
        let job = harness
            .controller
            .start_single(FORM_URL, json!({"retries": 2}))
            .await
            .unwrap();
        harness.controller.shutdown();
        job.job_id
    };

    let store = Arc::new(SqliteJobStore::open_in_dir(dir.path(), &settings).unwrap());
    let harness = Harness::with_store(store);
    let jobs = harness.controller.reconcile_on_startup(OWNER_A).unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_id, job_id);
    assert_eq!(
        jobs[0]
            .resume_context
            .as_ref()
            .map(|context| context.options.clone()),
        Some(json!({"retries": 2}))
    );
    assert!(harness.controller.poller().is_active(&job_id));
    assert_eq!(
        harness
            .controller
            .active_job(JobKind::Single)
            .unwrap()
            .map(|job| job.job_id),
        Some(job_id)
    );
}
