//! Process-local job store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{JobStore, RESTART_FAILURE_LOG};
use crate::runner::{ItemStatus, Job, JobItem, JobStatus};
use crate::{Error, Result};

#[derive(Default)]
struct Entry {
    job: Option<Job>,
    items: Vec<JobItem>,
}

/// [`JobStore`] kept in memory. Used by tests and by runs without a database.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, Entry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: &Job, items: &[JobItem]) -> Result<()> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.job_id) {
            return Err(Error::invalid_input(format!(
                "job {} already exists",
                job.job_id
            )));
        }
        jobs.insert(
            job.job_id.clone(),
            Entry {
                job: Some(job.clone()),
                items: items.to_vec(),
            },
        );
        Ok(())
    }

    async fn persist_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let entry = jobs.entry(job.job_id.clone()).or_default();
        entry.job = Some(job.clone());
        Ok(())
    }

    async fn persist_item(&self, item: &JobItem) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let entry = jobs
            .get_mut(&item.job_id)
            .ok_or_else(|| Error::not_found("job", &item.job_id))?;
        match entry.items.iter_mut().find(|i| i.asin == item.asin) {
            Some(existing) => *existing = item.clone(),
            None => entry.items.push(item.clone()),
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .lock()
            .get(job_id)
            .and_then(|entry| entry.job.clone()))
    }

    async fn list_items(&self, job_id: &str) -> Result<Vec<JobItem>> {
        Ok(self
            .jobs
            .lock()
            .get(job_id)
            .map(|entry| entry.items.clone())
            .unwrap_or_default())
    }

    async fn fail_stale_jobs(&self) -> Result<u64> {
        let mut jobs = self.jobs.lock();
        let mut failed = 0;
        for entry in jobs.values_mut() {
            let Some(job) = entry.job.as_mut() else {
                continue;
            };
            if job.status.is_terminal() {
                continue;
            }
            job.status = JobStatus::Failed;
            job.end_time = Some(Utc::now());
            for item in entry.items.iter_mut() {
                if matches!(item.status, ItemStatus::Queued | ItemStatus::Processing) {
                    item.status = ItemStatus::Failed;
                    item.log = Some(RESTART_FAILURE_LOG.to_string());
                }
            }
            failed += 1;
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{JobParams, JobType};

    fn job_with_items() -> (Job, Vec<JobItem>) {
        let job = Job::new(JobType::Download, JobParams::new());
        let items = vec![JobItem::new(&job.job_id, "B1"), JobItem::new(&job.job_id, "B2")];
        (job, items)
    }

    #[tokio::test]
    async fn test_create_and_update() {
        let store = InMemoryJobStore::new();
        let (mut job, items) = job_with_items();
        store.create_job(&job, &items).await.unwrap();
        assert!(store.create_job(&job, &items).await.is_err());

        let mut item = items[1].clone();
        item.status = ItemStatus::Completed;
        store.persist_item(&item).await.unwrap();
        job.finish(JobStatus::Failed);
        store.persist_job(&job).await.unwrap();

        let stored = store.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let listed = store.list_items(&job.job_id).await.unwrap();
        assert_eq!(listed[0].asin, "B1");
        assert_eq!(listed[1].status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn test_persist_item_for_unknown_job() {
        let store = InMemoryJobStore::new();
        let item = JobItem::new("missing", "B1");
        assert!(matches!(
            store.persist_item(&item).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_fail_stale_jobs() {
        let store = InMemoryJobStore::new();
        let (mut running, mut items) = job_with_items();
        running.status = JobStatus::Running;
        items[0].status = ItemStatus::Completed;
        store.create_job(&running, &items).await.unwrap();

        let (mut done, done_items) = job_with_items();
        done.finish(JobStatus::Completed);
        store.create_job(&done, &done_items).await.unwrap();

        assert_eq!(store.fail_stale_jobs().await.unwrap(), 1);
        let job = store.get_job(&running.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.end_time.is_some());

        let items = store.list_items(&running.job_id).await.unwrap();
        assert_eq!(items[0].status, ItemStatus::Completed);
        assert_eq!(items[1].status, ItemStatus::Failed);
        assert_eq!(items[1].log.as_deref(), Some(RESTART_FAILURE_LOG));

        let untouched = store.get_job(&done.job_id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Completed);
    }
}
