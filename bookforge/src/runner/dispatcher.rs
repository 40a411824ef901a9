//! Worker pool that executes tasks from the priority queue.
//!
//! The pool owns the only piece of state shared between submitters, the
//! dispatch loop and reconfiguration: the queue plus the live capacity and
//! running count, all kept behind one lock.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::PriorityWorkQueue;
use super::task::{Task, TaskOutcome};
use crate::{Error, Result};

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum concurrently executing tasks (total processing cores).
    pub max_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { max_workers: 2 }
    }
}

/// Point-in-time counters of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerPoolStats {
    pub capacity: usize,
    pub running: usize,
    pub queued: usize,
    /// Highest running count observed since the pool was created.
    pub peak_running: usize,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

struct DispatchState {
    queue: PriorityWorkQueue,
    capacity: usize,
    running: usize,
    sweep_requested: bool,
    stats: WorkerPoolStats,
}

struct PoolShared {
    state: Mutex<DispatchState>,
    notify: Notify,
    cancellation_token: CancellationToken,
}

enum Next {
    Run(Task),
    Skip(Task),
}

/// A resizable pool of execution slots fed by a [`PriorityWorkQueue`].
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    started: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new() -> Self {
        Self::with_config(WorkerPoolConfig::default())
    }

    /// Create a new worker pool with custom configuration.
    pub fn with_config(config: WorkerPoolConfig) -> Self {
        let capacity = config.max_workers.max(1);
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(DispatchState {
                    queue: PriorityWorkQueue::new(),
                    capacity,
                    running: 0,
                    sweep_requested: false,
                    stats: WorkerPoolStats {
                        capacity,
                        ..Default::default()
                    },
                }),
                notify: Notify::new(),
                cancellation_token: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Start the dispatch loop. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Worker pool start called but the pool is already running");
            return;
        }

        let shared = Arc::clone(&self.shared);
        info!(
            capacity = shared.state.lock().capacity,
            "Starting worker pool"
        );
        *self.handle.lock() = Some(tokio::spawn(dispatch_loop(shared)));
    }

    /// Stop the pool: queued tasks are reported as skipped, running tasks
    /// are awaited.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        info!("Stopping worker pool");
        self.shared.cancellation_token.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Dispatch loop terminated abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }

    /// Check if the pool accepts work.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shared.cancellation_token.is_cancelled()
    }

    /// Queue a task. Fails when the pool is not running.
    pub fn submit(&self, task: Task) -> Result<()> {
        if !self.is_running() {
            return Err(Error::infrastructure(
                "worker pool is not running; task not accepted",
            ));
        }

        debug!(
            job_id = %task.job_id(),
            asin = %task.asin(),
            stage = %task.stage(),
            chapter = ?task.chapter(),
            "Submitting task"
        );
        {
            let mut state = self.shared.state.lock();
            state.queue.submit(task);
            state.stats.queued = state.queue.len();
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Change the number of slots. Takes effect on the next dispatch decision;
    /// running tasks are never aborted.
    pub fn set_capacity(&self, max_workers: usize) -> Result<()> {
        if max_workers == 0 {
            return Err(Error::invalid_input(
                "total_processing_cores must be at least 1",
            ));
        }
        let previous = {
            let mut state = self.shared.state.lock();
            let previous = state.capacity;
            state.capacity = max_workers;
            state.stats.capacity = max_workers;
            previous
        };
        if previous != max_workers {
            info!(from = previous, to = max_workers, "Worker pool capacity changed");
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Ask the dispatch loop to drop queued tasks whose cancellation token
    /// has fired, without waiting for a free slot.
    pub fn sweep_cancelled(&self) {
        self.shared.state.lock().sweep_requested = true;
        self.shared.notify.notify_one();
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.lock().capacity
    }

    /// Get the number of executing tasks.
    pub fn active_count(&self) -> usize {
        self.shared.state.lock().running
    }

    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let state = self.shared.state.lock();
        WorkerPoolStats {
            running: state.running,
            queued: state.queue.len(),
            ..state.stats
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch_loop(shared: Arc<PoolShared>) {
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shared.cancellation_token.cancelled() => break,
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    error!("Task runner panicked outside its work function: {}", e);
                }
            }
            _ = shared.notify.notified() => {}
        }

        shared.sweep();
        shared.dispatch_ready(&mut running);
    }

    // Nothing queued will ever run now; tell the owners.
    let abandoned: Vec<Task> = {
        let mut state = shared.state.lock();
        let tasks: Vec<Task> = std::iter::from_fn(|| state.queue.take_next()).collect();
        state.stats.skipped += tasks.len() as u64;
        state.stats.queued = 0;
        tasks
    };
    for task in abandoned {
        let (_, completion) = task.into_parts();
        completion.report(TaskOutcome::Skipped, Duration::ZERO);
    }

    while running.join_next().await.is_some() {}
    debug!("Dispatch loop exited");
}

impl PoolShared {
    fn sweep(&self) {
        let swept = {
            let mut state = self.state.lock();
            if !std::mem::take(&mut state.sweep_requested) {
                return;
            }
            let mut kept = PriorityWorkQueue::new();
            let mut swept = Vec::new();
            while let Some(task) = state.queue.take_next() {
                if task.is_cancelled() {
                    swept.push(task);
                } else {
                    kept.submit(task);
                }
            }
            state.queue = kept;
            state.stats.skipped += swept.len() as u64;
            state.stats.queued = state.queue.len();
            swept
        };

        if !swept.is_empty() {
            debug!(count = swept.len(), "Swept cancelled tasks from the queue");
        }
        for task in swept {
            let (_, completion) = task.into_parts();
            completion.report(TaskOutcome::Skipped, Duration::ZERO);
        }
    }

    fn dispatch_ready(self: &Arc<Self>, running: &mut JoinSet<()>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                if state.running >= state.capacity {
                    return;
                }
                let Some(task) = state.queue.take_next() else {
                    return;
                };
                state.stats.queued = state.queue.len();
                if task.is_cancelled() {
                    state.stats.skipped += 1;
                    Next::Skip(task)
                } else {
                    state.running += 1;
                    state.stats.dispatched += 1;
                    state.stats.peak_running = state.stats.peak_running.max(state.running);
                    Next::Run(task)
                }
            };

            match next {
                Next::Skip(task) => {
                    debug!(
                        job_id = %task.job_id(),
                        asin = %task.asin(),
                        stage = %task.stage(),
                        "Skipping cancelled task"
                    );
                    let (_, completion) = task.into_parts();
                    completion.report(TaskOutcome::Skipped, Duration::ZERO);
                }
                Next::Run(task) => {
                    let shared = Arc::clone(self);
                    running.spawn(execute(shared, task));
                }
            }
        }
    }
}

async fn execute(shared: Arc<PoolShared>, task: Task) {
    let job_id = task.job_id().to_string();
    let asin = task.asin().to_string();
    let stage = task.stage();
    debug!(%job_id, %asin, %stage, chapter = ?task.chapter(), "Worker picked up task");

    let (work, completion) = task.into_parts();
    let started = Instant::now();
    let result = AssertUnwindSafe(async move { work().await })
        .catch_unwind()
        .await;
    let elapsed = started.elapsed();

    let outcome = match result {
        Ok(Ok(output)) => TaskOutcome::Succeeded(output),
        Ok(Err(e)) => {
            warn!(%job_id, %asin, %stage, "Task failed: {:#}", e);
            TaskOutcome::Failed(format!("{:#}", e))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(%job_id, %asin, %stage, "Task panicked: {}", message);
            TaskOutcome::Failed(format!("task panicked: {}", message))
        }
    };

    {
        let mut state = shared.state.lock();
        state.running -= 1;
        if outcome.is_success() {
            state.stats.succeeded += 1;
        } else {
            state.stats.failed += 1;
        }
    }
    shared.notify.notify_one();

    debug!(%job_id, %asin, %stage, elapsed_ms = elapsed.as_millis() as u64, "Worker finished task");
    completion.report(outcome, elapsed);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
