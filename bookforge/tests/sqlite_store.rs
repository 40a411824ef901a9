//! SQLite-backed job store, and the runner writing through it.

use std::sync::Arc;
use std::time::Duration;

use bookforge::config::RunnerConfig;
use bookforge::runner::{
    Collaborators, ItemStatus, Job, JobCoordinator, JobEvent, JobItem, JobParams, JobStatus,
    JobType, StageKind,
};
use bookforge::simulate::{SimulatedCatalog, SimulatedLibrary, SimulatedMedia};
use bookforge::store::{JobStore, RESTART_FAILURE_LOG, SqliteJobStore};
use bookforge::Error;
use tempfile::TempDir;

async fn open_store() -> (TempDir, SqliteJobStore) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("jobs.db").display());
    let store = SqliteJobStore::connect(&url).await.unwrap();
    (dir, store)
}

fn download_job(asins: &[&str]) -> (Job, Vec<JobItem>) {
    let mut params = JobParams::new();
    params.insert("source".into(), "test".into());
    let job = Job::new(JobType::Download, params);
    let items = asins.iter().map(|a| JobItem::new(&job.job_id, *a)).collect();
    (job, items)
}

#[tokio::test]
async fn jobs_and_items_round_trip() {
    let (_dir, store) = open_store().await;
    let (mut job, items) = download_job(&["B3", "B1", "B2"]);
    store.create_job(&job, &items).await.unwrap();

    let mut item = items[1].clone();
    item.status = ItemStatus::Failed;
    item.log = Some("encoder crashed".to_string());
    store.persist_item(&item).await.unwrap();

    job.finish(JobStatus::Failed);
    store.persist_job(&job).await.unwrap();

    let loaded = store.get_job(&job.job_id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Failed);
    assert_eq!(loaded.job_type, JobType::Download);
    assert_eq!(loaded.param_str("source"), Some("test"));
    assert!(loaded.end_time.is_some());

    let listed = store.list_items(&job.job_id).await.unwrap();
    let asins: Vec<_> = listed.iter().map(|i| i.asin.as_str()).collect();
    assert_eq!(asins, ["B3", "B1", "B2"]);
    assert_eq!(listed[1].status, ItemStatus::Failed);
    assert_eq!(listed[1].log.as_deref(), Some("encoder crashed"));

    assert!(store.get_job("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn updates_to_unknown_rows_are_not_found() {
    let (_dir, store) = open_store().await;
    let (job, items) = download_job(&["B1"]);

    assert!(matches!(
        store.persist_job(&job).await,
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        store.persist_item(&items[0]).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn stale_jobs_fail_on_startup() {
    let (_dir, store) = open_store().await;

    let (mut running, mut items) = download_job(&["B1", "B2"]);
    running.status = JobStatus::Running;
    items[0].status = ItemStatus::Completed;
    items[1].status = ItemStatus::Processing;
    store.create_job(&running, &items).await.unwrap();

    let (mut done, done_items) = download_job(&["B9"]);
    done.finish(JobStatus::Completed);
    store.create_job(&done, &done_items).await.unwrap();

    assert_eq!(store.fail_stale_jobs().await.unwrap(), 1);
    assert_eq!(store.fail_stale_jobs().await.unwrap(), 0);

    let job = store.get_job(&running.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.end_time.is_some());
    let items = store.list_items(&running.job_id).await.unwrap();
    assert_eq!(items[0].status, ItemStatus::Completed);
    assert_eq!(items[1].status, ItemStatus::Failed);
    assert_eq!(items[1].log.as_deref(), Some(RESTART_FAILURE_LOG));

    let done = store.get_job(&done.job_id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
}

#[tokio::test]
async fn runner_persists_final_state() {
    let (_dir, store) = open_store().await;
    let store = Arc::new(store);
    let coordinator = JobCoordinator::new(
        &RunnerConfig::default(),
        Collaborators {
            catalog: Arc::new(SimulatedCatalog::new()),
            media: Arc::new(SimulatedMedia::new().fail_at("B2", StageKind::Encode)),
            library: Arc::new(SimulatedLibrary::new()),
            store: store.clone(),
        },
    );
    coordinator.start();
    let mut rx = coordinator.subscribe_to_events();

    let job_id = coordinator
        .enqueue_job(
            JobType::Download,
            vec!["B1".to_string(), "B2".to_string()],
            JobParams::new(),
        )
        .await
        .unwrap();
    let finished = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let JobEvent::JobFinished(finished) = rx.recv().await.unwrap() {
                return finished;
            }
        }
    })
    .await
    .unwrap();

    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, finished.status);
    assert_eq!(job.status, JobStatus::Failed);
    let items = store.list_items(&job_id).await.unwrap();
    assert_eq!(items[0].status, ItemStatus::Completed);
    assert_eq!(items[1].status, ItemStatus::Failed);
    assert!(
        items[1]
            .log
            .as_deref()
            .unwrap()
            .contains("simulated ENCODE failure for B2")
    );

    // A retry covers only the failed book.
    let retry_id = coordinator.retry_failed(&job_id).await.unwrap();
    let retried = store.list_items(&retry_id).await.unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].asin, "B2");
    coordinator.shutdown().await;
}
