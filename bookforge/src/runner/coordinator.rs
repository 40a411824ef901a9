//! Job coordination.
//!
//! The [`JobCoordinator`] accepts jobs, splits DOWNLOAD jobs into per-book
//! [`StagePipeline`]s and owns one driver task per job. A driver is the single
//! writer of its job's state: task reports come back to it over a channel, so
//! pipelines need no locking. Only the worker pool and the download gate are
//! shared between jobs.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context as _;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::collaborators::{
    CatalogClient, EncodedChapter, LibrarySync, MediaBackend, PreparedBook, SyncContext, SyncMode,
    SyncReporter,
};
use super::dispatcher::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};
use super::eta::EtaEstimator;
use super::gate::{DownloadGate, DownloadPermit};
use super::model::{
    ItemStatus, Job, JobItem, JobParams, JobStatus, JobType, aggregate_status, truncate_log,
};
use super::pipeline::{BookState, StagePipeline, Step};
use super::progress::{ItemOutcome, JobEvent, JobSnapshot, ProgressBroadcaster};
use super::task::{StageKind, StageOutput, Task, TaskReport};
use crate::config::{RunnerConfig, SettingsEvent, SettingsStore};
use crate::store::JobStore;
use crate::{Error, Result};

/// Finished jobs kept in memory for [`JobCoordinator::retry_failed`].
const HISTORY_LIMIT: usize = 64;

/// External services a coordinator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogClient>,
    pub media: Arc<dyn MediaBackend>,
    pub library: Arc<dyn LibrarySync>,
    pub store: Arc<dyn JobStore>,
}

/// A job that reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedJob {
    pub job: Job,
    pub items: Vec<JobItem>,
}

/// Download gate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadStats {
    pub limit: usize,
    pub in_flight: usize,
    pub peak: usize,
}

/// Point-in-time view of the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub pool: WorkerPoolStats,
    pub downloads: DownloadStats,
    pub active_jobs: usize,
}

#[derive(Debug, Clone)]
struct JobPolicy {
    allow_concurrent_jobs: bool,
    item_log_max_chars: usize,
    process_new_on_sync: bool,
}

impl From<&RunnerConfig> for JobPolicy {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            allow_concurrent_jobs: config.allow_concurrent_jobs,
            item_log_max_chars: config.item_log_max_chars,
            process_new_on_sync: config.process_new_on_sync,
        }
    }
}

struct ActiveJob {
    job_id: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    /// Jobs accepted and not yet finished, in start order.
    active: Vec<ActiveJob>,
    history: VecDeque<FinishedJob>,
}

/// DOWNLOAD job requested by a finished SYNC job.
struct ChainRequest {
    triggered_by: String,
    asins: Vec<String>,
}

struct Inner {
    pool: WorkerPool,
    gate: Arc<DownloadGate>,
    broadcaster: Arc<ProgressBroadcaster>,
    eta: EtaEstimator,
    collaborators: Collaborators,
    policy: Mutex<JobPolicy>,
    registry: Mutex<Registry>,
    drivers: Mutex<Option<JoinSet<()>>>,
    chain_tx: mpsc::UnboundedSender<ChainRequest>,
    chain_rx: Mutex<Option<mpsc::UnboundedReceiver<ChainRequest>>>,
    shutdown: CancellationToken,
}

/// Entry point of the task runner. Cheap to clone.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
}

impl JobCoordinator {
    pub fn new(config: &RunnerConfig, collaborators: Collaborators) -> Self {
        let (chain_tx, chain_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                pool: WorkerPool::with_config(WorkerPoolConfig {
                    max_workers: config.total_processing_cores,
                }),
                gate: Arc::new(DownloadGate::new(config.max_parallel_downloads)),
                broadcaster: Arc::new(ProgressBroadcaster::new(config.event_channel_capacity)),
                eta: EtaEstimator::new(),
                collaborators,
                policy: Mutex::new(JobPolicy::from(config)),
                registry: Mutex::new(Registry::default()),
                drivers: Mutex::new(Some(JoinSet::new())),
                chain_tx,
                chain_rx: Mutex::new(Some(chain_rx)),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start the worker pool. Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.inner.pool.start();
        if let Some(rx) = self.inner.chain_rx.lock().take() {
            tokio::spawn(chain_loop(self.clone(), rx));
        }
    }

    /// Cancel every active job, stop the pool and wait for the drivers.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down job coordinator");
        self.inner.shutdown.cancel();
        self.inner.pool.sweep_cancelled();
        self.inner.pool.stop().await;

        let drivers = self.inner.drivers.lock().take();
        if let Some(mut drivers) = drivers {
            while let Some(joined) = drivers.join_next().await {
                if let Err(e) = joined {
                    error!("Job driver terminated abnormally: {}", e);
                }
            }
        }
        info!("Job coordinator stopped");
    }

    /// Accept a new job and return its id.
    ///
    /// Fails with `InvalidInput` for a DOWNLOAD job without books, an invalid
    /// `sync_mode`, or when another job is active and concurrent jobs are not
    /// allowed. Fails with `Infrastructure` when the runner is not running or
    /// the job could not be recorded; no event is emitted in either case.
    pub async fn enqueue_job(
        &self,
        job_type: JobType,
        asins: Vec<String>,
        params: JobParams,
    ) -> Result<String> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() || !inner.pool.is_running() {
            return Err(Error::infrastructure("the job runner is not running"));
        }

        let asins = dedupe(asins);
        let sync_mode = match job_type {
            JobType::Download => {
                if asins.is_empty() {
                    return Err(Error::invalid_input(
                        "A DOWNLOAD job needs at least one ASIN.",
                    ));
                }
                None
            }
            JobType::Sync => {
                if !asins.is_empty() {
                    warn!(count = asins.len(), "Ignoring ASINs passed to a SYNC job");
                }
                Some(sync_mode_param(&params)?)
            }
        };

        let job = Job::new(job_type, params);
        let items: Vec<JobItem> = match job_type {
            JobType::Download => asins
                .iter()
                .map(|asin| JobItem::new(&job.job_id, asin))
                .collect(),
            JobType::Sync => Vec::new(),
        };
        let cancel = inner.shutdown.child_token();

        {
            let mut registry = inner.registry.lock();
            if !inner.policy.lock().allow_concurrent_jobs {
                if let Some(active) = registry.active.first() {
                    return Err(Error::invalid_input(format!(
                        "A job (ID: {}) is already in progress.",
                        active.job_id
                    )));
                }
            }
            registry.active.push(ActiveJob {
                job_id: job.job_id.clone(),
                cancel: cancel.clone(),
            });
        }

        if let Err(e) = inner.collaborators.store.create_job(&job, &items).await {
            inner
                .registry
                .lock()
                .active
                .retain(|active| active.job_id != job.job_id);
            error!(job_id = %job.job_id, "Failed to create job in the store: {}", e);
            return Err(Error::infrastructure(format!(
                "failed to create job in the store: {}",
                e
            )));
        }

        inner.broadcaster.job_started(&job, &items);
        info!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            items = items.len(),
            "Starting new job"
        );

        let job_id = job.job_id.clone();
        match sync_mode {
            Some(mode) => self.spawn_driver(run_sync(self.clone(), job, mode, cancel)),
            None => {
                let driver = DownloadDriver::new(self.clone(), job, items, cancel);
                self.spawn_driver(driver.run());
            }
        }
        Ok(job_id)
    }

    /// Request cancellation. Returns false, with no effect, when the job is
    /// unknown, already finished or already cancelled.
    pub fn cancel(&self, job_id: &str) -> bool {
        let token = self
            .inner
            .registry
            .lock()
            .active
            .iter()
            .find(|active| active.job_id == job_id)
            .map(|active| active.cancel.clone());

        match token {
            Some(token) if !token.is_cancelled() => {
                info!(%job_id, "Received cancel request");
                token.cancel();
                self.inner.pool.sweep_cancelled();
                true
            }
            _ => {
                debug!(%job_id, "Cancel ignored: job is not active or already cancelled");
                false
            }
        }
    }

    /// Cancel the oldest active job.
    pub fn cancel_active(&self) -> bool {
        let job_id = self
            .inner
            .registry
            .lock()
            .active
            .first()
            .map(|active| active.job_id.clone());
        match job_id {
            Some(job_id) => self.cancel(&job_id),
            None => false,
        }
    }

    /// Change both concurrency caps. Applied to the next dispatch and
    /// admission decisions; nothing running is interrupted.
    pub fn reconfigure(
        &self,
        total_processing_cores: usize,
        max_parallel_downloads: usize,
    ) -> Result<()> {
        if total_processing_cores == 0 {
            return Err(Error::invalid_input(
                "total_processing_cores must be at least 1",
            ));
        }
        if max_parallel_downloads == 0 {
            return Err(Error::invalid_input(
                "max_parallel_downloads must be at least 1",
            ));
        }
        self.inner.pool.set_capacity(total_processing_cores)?;
        self.inner.gate.set_limit(max_parallel_downloads)?;
        Ok(())
    }

    /// Apply a full runtime configuration. The event channel capacity is
    /// fixed at construction and ignored here.
    pub fn apply_config(&self, config: &RunnerConfig) -> Result<()> {
        self.reconfigure(config.total_processing_cores, config.max_parallel_downloads)?;
        *self.inner.policy.lock() = JobPolicy::from(config);
        Ok(())
    }

    /// Snapshot of the oldest running job, for reconnecting clients.
    pub fn get_active_job(&self) -> Option<JobSnapshot> {
        self.inner.broadcaster.active_job()
    }

    pub fn job_snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.inner.broadcaster.snapshot(job_id)
    }

    pub fn subscribe_to_events(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.broadcaster.subscribe()
    }

    pub fn active_job_ids(&self) -> Vec<String> {
        self.inner
            .registry
            .lock()
            .active
            .iter()
            .map(|active| active.job_id.clone())
            .collect()
    }

    /// A recently finished job with its final items.
    pub fn finished_job(&self, job_id: &str) -> Option<FinishedJob> {
        self.inner
            .registry
            .lock()
            .history
            .iter()
            .find(|finished| finished.job.job_id == job_id)
            .cloned()
    }

    /// Enqueue a new DOWNLOAD job for the FAILED items of a finished job.
    pub async fn retry_failed(&self, job_id: &str) -> Result<String> {
        if self.active_job_ids().iter().any(|id| id == job_id) {
            return Err(Error::invalid_input(format!(
                "Job {} is still in progress.",
                job_id
            )));
        }

        let items = match self.finished_job(job_id) {
            Some(finished) => finished.items,
            None => {
                let store = &self.inner.collaborators.store;
                if store.get_job(job_id).await?.is_none() {
                    return Err(Error::not_found("job", job_id));
                }
                store.list_items(job_id).await?
            }
        };

        let failed: Vec<String> = items
            .into_iter()
            .filter(|item| item.status == ItemStatus::Failed)
            .map(|item| item.asin)
            .collect();
        if failed.is_empty() {
            return Err(Error::invalid_input(format!(
                "Job {} has no failed items to retry.",
                job_id
            )));
        }

        info!(%job_id, count = failed.len(), "Retrying failed items in a new job");
        let mut params = JobParams::new();
        params.insert("retry_of".to_string(), serde_json::Value::from(job_id));
        self.enqueue_job(JobType::Download, failed, params).await
    }

    /// Estimated conversion time for a book of the given runtime.
    pub fn estimate_conversion_secs(&self, runtime_min: u32) -> u64 {
        self.inner.eta.estimate_secs(runtime_min)
    }

    /// Apply settings changes as they are saved.
    pub fn follow_settings(&self, settings: SettingsStore) -> JoinHandle<()> {
        let coordinator = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let mut rx = settings.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(SettingsEvent::DownloadLimitsChanged {
                        total_processing_cores,
                        max_parallel_downloads,
                    }) => {
                        if let Err(e) =
                            coordinator.reconfigure(total_processing_cores, max_parallel_downloads)
                        {
                            warn!("Ignoring invalid download limits: {}", e);
                        }
                    }
                    Ok(SettingsEvent::Updated(updated)) => {
                        *coordinator.inner.policy.lock() =
                            JobPolicy::from(&updated.runner_config());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Settings events lagged; reapplying current settings");
                        if let Err(e) = coordinator.apply_config(&settings.current().runner_config())
                        {
                            warn!("Failed to reapply settings: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Stopped following settings");
        })
    }

    pub fn stats(&self) -> RunnerStats {
        let gate = &self.inner.gate;
        RunnerStats {
            pool: self.inner.pool.stats(),
            downloads: DownloadStats {
                limit: gate.limit(),
                in_flight: gate.in_flight(),
                peak: gate.peak(),
            },
            active_jobs: self.inner.registry.lock().active.len(),
        }
    }

    fn spawn_driver<F>(&self, driver: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut drivers = self.inner.drivers.lock();
        match drivers.as_mut() {
            Some(set) => {
                while set.try_join_next().is_some() {}
                set.spawn(driver);
            }
            None => {
                tokio::spawn(driver);
            }
        }
    }

    /// Emit `job_finished` and retire the job in one step, so a client that
    /// sees the event can start the next job immediately.
    fn retire(&self, job: &Job, items: &[JobItem]) {
        let outcomes = items
            .iter()
            .map(|item| ItemOutcome {
                asin: item.asin.clone(),
                status: item.status,
            })
            .collect();

        let mut registry = self.inner.registry.lock();
        self.inner.broadcaster.job_finished(job, outcomes);
        registry.active.retain(|active| active.job_id != job.job_id);
        if registry.history.len() == HISTORY_LIMIT {
            registry.history.pop_front();
        }
        registry.history.push_back(FinishedJob {
            job: job.clone(),
            items: items.to_vec(),
        });
    }

    fn item_log_max_chars(&self) -> usize {
        self.inner.policy.lock().item_log_max_chars
    }

    async fn persist_job(&self, job: &Job) {
        if let Err(e) = self.inner.collaborators.store.persist_job(job).await {
            warn!(job_id = %job.job_id, "Failed to persist job: {}", e);
        }
    }

    async fn persist_item(&self, item: &JobItem) {
        if let Err(e) = self.inner.collaborators.store.persist_item(item).await {
            warn!(job_id = %item.job_id, asin = %item.asin, "Failed to persist job item: {}", e);
        }
    }
}

/// Order-preserving de-duplication.
fn dedupe(asins: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    asins
        .into_iter()
        .map(|asin| asin.trim().to_string())
        .filter(|asin| !asin.is_empty() && seen.insert(asin.clone()))
        .collect()
}

fn sync_mode_param(params: &JobParams) -> Result<SyncMode> {
    match params.get("sync_mode") {
        None | Some(serde_json::Value::Null) => Ok(SyncMode::default()),
        Some(serde_json::Value::String(mode)) => mode
            .parse()
            .map_err(|_| Error::invalid_input(format!("Invalid sync_mode: {}", mode))),
        Some(other) => Err(Error::invalid_input(format!(
            "Invalid sync_mode: {}",
            other
        ))),
    }
}

async fn chain_loop(coordinator: JobCoordinator, mut rx: mpsc::UnboundedReceiver<ChainRequest>) {
    let shutdown = coordinator.inner.shutdown.clone();
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let mut params = JobParams::new();
        params.insert(
            "triggered_by".to_string(),
            serde_json::Value::from(request.triggered_by.clone()),
        );
        match coordinator
            .enqueue_job(JobType::Download, request.asins, params)
            .await
        {
            Ok(job_id) => info!(
                triggered_by = %request.triggered_by,
                %job_id,
                "Started chained download job after sync"
            ),
            Err(e) => warn!(
                triggered_by = %request.triggered_by,
                "Could not start chained download job: {}", e
            ),
        }
    }
}

async fn run_sync(
    coordinator: JobCoordinator,
    mut job: Job,
    mode: SyncMode,
    cancel: CancellationToken,
) {
    let inner = &coordinator.inner;
    job.status = JobStatus::Running;
    coordinator.persist_job(&job).await;
    inner.broadcaster.job_changed(&job);

    let reporter = SyncReporter::new(&job.job_id, Arc::clone(&inner.broadcaster));
    reporter.progress("Initializing...", 2);
    let ctx = SyncContext {
        job_id: job.job_id.clone(),
        mode,
        reporter: reporter.clone(),
        cancellation: cancel.clone(),
    };

    info!(job_id = %job.job_id, %mode, "Running library sync");
    let library = Arc::clone(&inner.collaborators.library);
    let result = AssertUnwindSafe(library.run(ctx)).catch_unwind().await;

    let mut new_asins = Vec::new();
    let status = match result {
        _ if cancel.is_cancelled() => {
            reporter.progress("Cancelled", 100);
            JobStatus::Cancelled
        }
        Ok(Ok(outcome)) => {
            reporter.progress("Finished", 100);
            new_asins = outcome.new_asins;
            JobStatus::Completed
        }
        Ok(Err(e)) => {
            warn!(job_id = %job.job_id, "Library sync failed: {:#}", e);
            reporter.progress(format!("Error: {:#}", e), 100);
            JobStatus::Failed
        }
        Err(_) => {
            error!(job_id = %job.job_id, "Library sync panicked");
            reporter.progress("Error: sync panicked", 100);
            JobStatus::Failed
        }
    };

    job.finish(status);
    coordinator.persist_job(&job).await;
    coordinator.retire(&job, &[]);
    info!(job_id = %job.job_id, %status, "Marked SYNC job as finished");

    let chain = inner.policy.lock().process_new_on_sync;
    if status == JobStatus::Completed && chain && !new_asins.is_empty() {
        let request = ChainRequest {
            triggered_by: job.job_id.clone(),
            asins: new_asins,
        };
        if inner.chain_tx.send(request).is_err() {
            warn!(job_id = %job.job_id, "Chained download requested after shutdown");
        }
    }
}

struct Book {
    pipeline: StagePipeline,
    permit: Option<DownloadPermit>,
}

/// Drives one DOWNLOAD job to completion.
struct DownloadDriver {
    coordinator: JobCoordinator,
    job: Job,
    items: Vec<JobItem>,
    books: Vec<Book>,
    index: HashMap<String, usize>,
    /// Books held back until the first book's PREPARE has reported.
    withheld: Vec<usize>,
    /// Books released for PREPARE, waiting for a download slot.
    admission: VecDeque<usize>,
    cancel: CancellationToken,
    cancel_applied: bool,
    reports_tx: mpsc::UnboundedSender<TaskReport>,
    reports_rx: mpsc::UnboundedReceiver<TaskReport>,
    gate_rx: watch::Receiver<u64>,
}

impl DownloadDriver {
    fn new(
        coordinator: JobCoordinator,
        job: Job,
        items: Vec<JobItem>,
        cancel: CancellationToken,
    ) -> Self {
        let books = items
            .iter()
            .map(|item| Book {
                pipeline: StagePipeline::new(&item.asin, cancel.child_token()),
                permit: None,
            })
            .collect();
        let index = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.asin.clone(), i))
            .collect();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let gate_rx = coordinator.inner.gate.watch();

        Self {
            coordinator,
            job,
            withheld: (1..items.len()).collect(),
            admission: VecDeque::from([0]),
            items,
            books,
            index,
            cancel,
            cancel_applied: false,
            reports_tx,
            reports_rx,
            gate_rx,
        }
    }

    async fn run(mut self) {
        self.job.status = JobStatus::Running;
        self.coordinator.persist_job(&self.job).await;
        self.coordinator.inner.broadcaster.job_changed(&self.job);

        self.queued_for_preparation(0);
        self.admit().await;

        while !self.is_done() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !self.cancel_applied => {
                    self.apply_cancel().await;
                }
                Some(report) = self.reports_rx.recv() => {
                    self.on_report(report).await;
                }
                changed = self.gate_rx.changed(), if !self.admission.is_empty() => {
                    if changed.is_err() {
                        error!(job_id = %self.job.job_id, "Download gate closed");
                        break;
                    }
                }
            }
            self.admit().await;
        }

        self.finish().await;
    }

    fn is_done(&self) -> bool {
        self.books
            .iter()
            .all(|book| book.pipeline.is_terminal() && book.pipeline.outstanding() == 0)
    }

    fn head_start_released(&self) -> bool {
        !matches!(
            self.books[0].pipeline.state(),
            BookState::NotStarted | BookState::Preparing
        )
    }

    /// Submit PREPARE tasks for released books while download slots are free.
    async fn admit(&mut self) {
        if self.cancel_observed().await {
            return;
        }

        if !self.withheld.is_empty() && self.head_start_released() {
            let released = std::mem::take(&mut self.withheld);
            debug!(
                job_id = %self.job.job_id,
                count = released.len(),
                "Head-start barrier released"
            );
            for index in released {
                self.queued_for_preparation(index);
                self.admission.push_back(index);
            }
        }

        while let Some(&index) = self.admission.front() {
            // Admitting a book awaits the store, so a cancel can land mid-loop.
            if self.cancel_observed().await {
                return;
            }
            if self.books[index].pipeline.is_terminal() {
                self.admission.pop_front();
                continue;
            }
            let Some(permit) = self.coordinator.inner.gate.try_acquire() else {
                break;
            };
            self.admission.pop_front();
            self.start_prepare(index, permit).await;
        }
    }

    fn queued_for_preparation(&self, index: usize) {
        let item = &self.items[index];
        self.coordinator.inner.broadcaster.item_update(
            &self.job.job_id,
            &item.asin,
            item.status,
            "Queued for Preparation...",
            2,
            None,
        );
    }

    async fn start_prepare(&mut self, index: usize, permit: DownloadPermit) {
        if self.cancel_observed().await {
            return;
        }
        let inner = Arc::clone(&self.coordinator.inner);
        let book = &mut self.books[index];
        book.pipeline.start_prepare();
        book.permit = Some(permit);

        let asin = book.pipeline.asin().to_string();
        let catalog = Arc::clone(&inner.collaborators.catalog);
        let media = Arc::clone(&inner.collaborators.media);
        let work_asin = asin.clone();
        let task = Task::new(StageKind::Prepare, &self.job.job_id, &asin, move || async move {
            let metadata = catalog
                .fetch_metadata(&work_asin)
                .await
                .context("failed to fetch book metadata")?;
            let prepared = media.prepare(&metadata).await?;
            Ok(StageOutput::Prepared(prepared))
        })
        .with_cancellation(book.pipeline.cancellation())
        .reply_to(self.reports_tx.clone());

        debug!(job_id = %self.job.job_id, %asin, "Admitting book for preparation");
        match inner.pool.submit(task) {
            Ok(()) => {
                self.set_item(index, ItemStatus::Processing, "Downloading...", 5, None)
                    .await;
            }
            Err(e) => {
                self.books[index].pipeline.submission_failed(1);
                self.book_failed(index, StageKind::Prepare, e.to_string()).await;
            }
        }
    }

    async fn on_report(&mut self, report: TaskReport) {
        self.cancel_observed().await;

        let Some(&index) = self.index.get(&report.asin) else {
            warn!(job_id = %self.job.job_id, asin = %report.asin, "Report for unknown book");
            return;
        };
        if report.stage == StageKind::Prepare {
            self.books[index].permit = None;
        }

        let stage = report.stage;
        let step = self.books[index].pipeline.on_report(stage, report.outcome);
        match step {
            Step::Wait { encoded, total } => {
                let percent = self.books[index].pipeline.progress_percent();
                self.set_item(
                    index,
                    ItemStatus::Processing,
                    format!("Processing chunk {}/{}", encoded, total),
                    percent,
                    None,
                )
                .await;
            }
            Step::SubmitEncodes(book) => {
                self.set_item(
                    index,
                    ItemStatus::Processing,
                    format!("Encoding {} chapters...", book.chapters.len()),
                    30,
                    None,
                )
                .await;
                self.submit_encodes(index, book).await;
            }
            Step::SubmitMerge(book, chapters) => {
                self.set_item(index, ItemStatus::Processing, "Merging final file...", 90, None)
                    .await;
                self.submit_merge(index, book, chapters).await;
            }
            Step::Done(path) => {
                let pipeline = &self.books[index].pipeline;
                if let (Some(book), Some(elapsed)) = (pipeline.book(), pipeline.elapsed()) {
                    if let Some(runtime_min) = book.metadata.runtime_min {
                        self.coordinator.inner.eta.record(runtime_min, elapsed);
                    }
                }
                info!(
                    job_id = %self.job.job_id,
                    asin = %report.asin,
                    path = %path.display(),
                    "Book completed"
                );
                self.set_item(index, ItemStatus::Completed, "Complete!", 100, None)
                    .await;
            }
            Step::Failed(message) => {
                self.book_failed(index, stage, message).await;
            }
            Step::Discarded => {
                debug!(
                    job_id = %self.job.job_id,
                    asin = %report.asin,
                    %stage,
                    "Discarding result for finished book"
                );
            }
        }
    }

    async fn submit_encodes(&mut self, index: usize, book: Arc<PreparedBook>) {
        let inner = Arc::clone(&self.coordinator.inner);
        let total = book.chapters.len();
        if self.cancel_observed().await {
            self.books[index].pipeline.submission_failed(total);
            return;
        }
        let token = self.books[index].pipeline.cancellation();

        for (submitted, chapter) in book.chapters.iter().enumerate() {
            let media = Arc::clone(&inner.collaborators.media);
            let prepared = Arc::clone(&book);
            let chapter = chapter.clone();
            let chapter_index = chapter.index;
            let task = Task::new(
                StageKind::Encode,
                &self.job.job_id,
                &book.metadata.asin,
                move || async move {
                    let encoded = media.encode_chapter(&prepared, &chapter).await?;
                    Ok(StageOutput::Encoded(encoded))
                },
            )
            .with_chapter(chapter_index)
            .with_cancellation(token.clone())
            .reply_to(self.reports_tx.clone());

            if let Err(e) = inner.pool.submit(task) {
                self.books[index].pipeline.submission_failed(total - submitted);
                self.book_failed(index, StageKind::Encode, e.to_string()).await;
                return;
            }
        }
        debug!(
            job_id = %self.job.job_id,
            asin = %book.metadata.asin,
            chapters = total,
            "Submitted encoding tasks"
        );
    }

    async fn submit_merge(
        &mut self,
        index: usize,
        book: Arc<PreparedBook>,
        chapters: Vec<EncodedChapter>,
    ) {
        if self.cancel_observed().await {
            self.books[index].pipeline.submission_failed(1);
            return;
        }
        let inner = Arc::clone(&self.coordinator.inner);
        let media = Arc::clone(&inner.collaborators.media);
        let prepared = Arc::clone(&book);
        let task = Task::new(
            StageKind::Merge,
            &self.job.job_id,
            &book.metadata.asin,
            move || async move {
                let path = media.merge(&prepared, &chapters).await?;
                Ok(StageOutput::Merged(path))
            },
        )
        .with_cancellation(self.books[index].pipeline.cancellation())
        .reply_to(self.reports_tx.clone());

        if let Err(e) = inner.pool.submit(task) {
            self.books[index].pipeline.submission_failed(1);
            self.book_failed(index, StageKind::Merge, e.to_string()).await;
        }
    }

    async fn book_failed(&mut self, index: usize, stage: StageKind, message: String) {
        let book = &mut self.books[index];
        book.pipeline.fail(message.clone());
        if book.pipeline.outstanding() == 0 {
            book.permit = None;
        }

        let failure = Error::task_failure(stage, book.pipeline.asin(), &message);
        warn!(job_id = %self.job.job_id, "{}", failure);

        let log = truncate_log(&message, self.coordinator.item_log_max_chars());
        self.set_item(index, ItemStatus::Failed, "Failed!", 100, Some(log))
            .await;
        // Queued siblings of this book are skipped without waiting for a slot.
        self.coordinator.inner.pool.sweep_cancelled();
    }

    /// Apply a cancellation that fired while the driver was awaiting.
    /// Returns true once the job is cancelled.
    async fn cancel_observed(&mut self) -> bool {
        if !self.cancel.is_cancelled() {
            return false;
        }
        if !self.cancel_applied {
            self.apply_cancel().await;
        }
        true
    }

    async fn apply_cancel(&mut self) {
        self.cancel_applied = true;
        info!(job_id = %self.job.job_id, "Cancelling job");

        self.withheld.clear();
        self.admission.clear();
        for index in 0..self.books.len() {
            if self.books[index].pipeline.cancel() {
                self.set_item(index, ItemStatus::Cancelled, "Cancelled", 100, None)
                    .await;
            }
        }
        self.coordinator.inner.pool.sweep_cancelled();
    }

    async fn set_item(
        &mut self,
        index: usize,
        status: ItemStatus,
        status_text: impl Into<String>,
        progress_percent: u8,
        log: Option<String>,
    ) {
        let item = &mut self.items[index];
        let changed = item.status != status || log.is_some();
        item.status = status;
        if log.is_some() {
            item.log = log;
        }

        self.coordinator.inner.broadcaster.item_update(
            &self.job.job_id,
            &item.asin,
            status,
            status_text,
            progress_percent,
            item.log.as_deref(),
        );
        if changed {
            let item = item.clone();
            self.coordinator.persist_item(&item).await;
        }
    }

    async fn finish(mut self) {
        let status = aggregate_status(self.items.iter().map(|item| item.status), self.cancel_applied);
        self.job.finish(status);
        self.coordinator.persist_job(&self.job).await;
        self.coordinator.retire(&self.job, &self.items);

        let completed = self
            .items
            .iter()
            .filter(|item| item.status == ItemStatus::Completed)
            .count();
        info!(
            job_id = %self.job.job_id,
            %status,
            completed,
            total = self.items.len(),
            "Marked DOWNLOAD job as finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::progress::JobFinished;
    use crate::simulate::{SimulatedCatalog, SimulatedLibrary, SimulatedMedia};
    use crate::store::InMemoryJobStore;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn coordinator_with(media: SimulatedMedia, config: RunnerConfig) -> (JobCoordinator, Arc<InMemoryJobStore>) {
        let store = Arc::new(InMemoryJobStore::new());
        let coordinator = JobCoordinator::new(
            &config,
            Collaborators {
                catalog: Arc::new(SimulatedCatalog::new()),
                media: Arc::new(media),
                library: Arc::new(SimulatedLibrary::new()),
                store: store.clone(),
            },
        );
        coordinator.start();
        (coordinator, store)
    }

    async fn wait_finished(
        rx: &mut broadcast::Receiver<JobEvent>,
        job_id: &str,
    ) -> JobFinished {
        tokio::time::timeout(WAIT, async {
            loop {
                match rx.recv().await {
                    Ok(JobEvent::JobFinished(finished)) if finished.job_id == job_id => {
                        return finished;
                    }
                    Ok(_) => continue,
                    Err(e) => panic!("event stream failed: {e}"),
                }
            }
        })
        .await
        .expect("job did not finish")
    }

    fn asins(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_download_job_completes() {
        let (coordinator, store) =
            coordinator_with(SimulatedMedia::new().with_chapters(3), RunnerConfig::default());
        let mut rx = coordinator.subscribe_to_events();

        let job_id = coordinator
            .enqueue_job(JobType::Download, asins(&["B1", "B2"]), JobParams::new())
            .await
            .unwrap();
        let finished = wait_finished(&mut rx, &job_id).await;

        assert_eq!(finished.status, JobStatus::Completed);
        assert!(finished.items.iter().all(|i| i.status == ItemStatus::Completed));
        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.end_time.is_some());
        assert!(coordinator.get_active_job().is_none());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_download_is_invalid() {
        let (coordinator, _) = coordinator_with(SimulatedMedia::new(), RunnerConfig::default());
        let mut rx = coordinator.subscribe_to_events();
        let err = coordinator
            .enqueue_job(JobType::Download, Vec::new(), JobParams::new())
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
        assert!(rx.try_recv().is_err());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_job_rejected_while_active() {
        let media = SimulatedMedia::new().with_encode_delay(Duration::from_millis(200));
        let (coordinator, _) = coordinator_with(media, RunnerConfig::default());

        let first = coordinator
            .enqueue_job(JobType::Download, asins(&["B1"]), JobParams::new())
            .await
            .unwrap();
        let err = coordinator
            .enqueue_job(JobType::Download, asins(&["B2"]), JobParams::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Invalid input: A job (ID: {}) is already in progress.", first)
        );
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_before_start_is_infrastructure_failure() {
        let config = RunnerConfig::default();
        let coordinator = JobCoordinator::new(
            &config,
            Collaborators {
                catalog: Arc::new(SimulatedCatalog::new()),
                media: Arc::new(SimulatedMedia::new()),
                library: Arc::new(SimulatedLibrary::new()),
                store: Arc::new(InMemoryJobStore::new()),
            },
        );
        let err = coordinator
            .enqueue_job(JobType::Download, asins(&["B1"]), JobParams::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Infrastructure(_)));
        assert!(coordinator.active_job_ids().is_empty());
    }

    #[tokio::test]
    async fn test_failed_book_does_not_affect_siblings() {
        let media = SimulatedMedia::new()
            .with_chapters(2)
            .fail_at("B2", StageKind::Encode);
        let (coordinator, store) = coordinator_with(media, RunnerConfig::default());
        let mut rx = coordinator.subscribe_to_events();

        let job_id = coordinator
            .enqueue_job(JobType::Download, asins(&["B1", "B2", "B3"]), JobParams::new())
            .await
            .unwrap();
        let finished = wait_finished(&mut rx, &job_id).await;

        assert_eq!(finished.status, JobStatus::Failed);
        let statuses: Vec<_> = finished.items.iter().map(|i| i.status).collect();
        assert_eq!(
            statuses,
            vec![ItemStatus::Completed, ItemStatus::Failed, ItemStatus::Completed]
        );
        let items = store.list_items(&job_id).await.unwrap();
        let failed = items.iter().find(|i| i.asin == "B2").unwrap();
        assert!(failed.log.as_deref().unwrap().contains("simulated ENCODE failure"));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let media = SimulatedMedia::new()
            .with_chapters(4)
            .with_encode_delay(Duration::from_millis(50));
        let (coordinator, _) = coordinator_with(media, RunnerConfig::default());
        let mut rx = coordinator.subscribe_to_events();

        let job_id = coordinator
            .enqueue_job(JobType::Download, asins(&["B1", "B2", "B3"]), JobParams::new())
            .await
            .unwrap();
        assert!(coordinator.cancel(&job_id));
        assert!(!coordinator.cancel(&job_id));

        let finished = wait_finished(&mut rx, &job_id).await;
        assert_eq!(finished.status, JobStatus::Cancelled);
        assert!(!coordinator.cancel(&job_id));
        assert!(!coordinator.cancel_active());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_failed_enqueues_new_job() {
        let media = SimulatedMedia::new().fail_at("B2", StageKind::Merge);
        let (coordinator, _) = coordinator_with(media, RunnerConfig::default());
        let mut rx = coordinator.subscribe_to_events();

        let job_id = coordinator
            .enqueue_job(JobType::Download, asins(&["B1", "B2"]), JobParams::new())
            .await
            .unwrap();
        wait_finished(&mut rx, &job_id).await;

        let retry_id = coordinator.retry_failed(&job_id).await.unwrap();
        assert_ne!(retry_id, job_id);
        let snapshot = coordinator.job_snapshot(&retry_id);
        if let Some(snapshot) = snapshot {
            assert_eq!(snapshot.items.len(), 1);
            assert_eq!(snapshot.items[0].asin, "B2");
            assert_eq!(snapshot.job.params["retry_of"], job_id.as_str());
        }
        let finished = wait_finished(&mut rx, &retry_id).await;
        assert_eq!(finished.items.len(), 1);

        // The original job is untouched.
        let original = coordinator.finished_job(&job_id).unwrap();
        assert_eq!(original.job.status, JobStatus::Failed);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconfigure_validates() {
        let (coordinator, _) = coordinator_with(SimulatedMedia::new(), RunnerConfig::default());
        assert!(coordinator.reconfigure(0, 1).unwrap_err().is_invalid_input());
        assert!(coordinator.reconfigure(1, 0).unwrap_err().is_invalid_input());
        coordinator.reconfigure(6, 3).unwrap();
        let stats = coordinator.stats();
        assert_eq!(stats.pool.capacity, 6);
        assert_eq!(stats.downloads.limit, 3);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_job_reports_phases() {
        let (coordinator, store) = coordinator_with(SimulatedMedia::new(), RunnerConfig::default());
        let mut rx = coordinator.subscribe_to_events();

        let mut params = JobParams::new();
        params.insert("sync_mode".into(), "fast".into());
        let job_id = coordinator
            .enqueue_job(JobType::Sync, Vec::new(), params)
            .await
            .unwrap();
        let finished = wait_finished(&mut rx, &job_id).await;

        assert_eq!(finished.status, JobStatus::Completed);
        assert!(finished.items.is_empty());
        assert_eq!(
            store.get_job(&job_id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_sync_mode() {
        let (coordinator, _) = coordinator_with(SimulatedMedia::new(), RunnerConfig::default());
        let mut params = JobParams::new();
        params.insert("sync_mode".into(), "SHALLOW".into());
        let err = coordinator
            .enqueue_job(JobType::Sync, Vec::new(), params)
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
        coordinator.shutdown().await;
    }

    #[test]
    fn test_dedupe_preserves_first_occurrence() {
        assert_eq!(
            dedupe(asins(&["B2", "B1", " B2 ", "", "B3", "B1"])),
            asins(&["B2", "B1", "B3"])
        );
    }
}
