//! Durable mirror of jobs and job items.
//!
//! The runner writes through a [`JobStore`] on every transition but never
//! reads its own in-flight state back from it.

mod memory;
mod sqlite;

pub use memory::InMemoryJobStore;
pub use sqlite::{SqliteJobStore, init_pool, run_migrations};

use async_trait::async_trait;

use crate::Result;
use crate::runner::{Job, JobItem};

/// Log attached to items of jobs interrupted by a restart.
pub const RESTART_FAILURE_LOG: &str = "Job failed due to application restart.";

/// Persistence of jobs and their items.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job and all of its items atomically.
    async fn create_job(&self, job: &Job, items: &[JobItem]) -> Result<()>;

    async fn persist_job(&self, job: &Job) -> Result<()>;

    async fn persist_item(&self, item: &JobItem) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// Items of a job in submission order.
    async fn list_items(&self, job_id: &str) -> Result<Vec<JobItem>>;

    /// Mark every QUEUED/RUNNING job FAILED, and its unfinished items FAILED
    /// with [`RESTART_FAILURE_LOG`]. Returns the number of jobs failed.
    async fn fail_stale_jobs(&self) -> Result<u64>;
}
