//! Progress event stream and job snapshots.
//!
//! Every transition is mirrored into the snapshot of its job and broadcast to
//! subscribers while holding the same lock, so a client that subscribes and
//! then reads [`ProgressBroadcaster::active_job`] never misses a transition.
//! Updates for a job that has not started, or has already finished, are
//! dropped: a `job_finished` event is always the last event of its job.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::model::{ItemStatus, Job, JobItem, JobStatus, JobType};

/// Default broadcast capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Final (or current) status of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub asin: String,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStarted {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub items: Vec<ItemOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub job_id: String,
    /// `None` for job-level progress (SYNC phases).
    pub asin: Option<String>,
    pub status_text: String,
    pub progress_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFinished {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Authoritative final status of every item.
    pub items: Vec<ItemOutcome>,
}

/// Events delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    JobStarted(JobStarted),
    JobUpdate(JobUpdate),
    JobFinished(JobFinished),
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobStarted(_) => "job_started",
            Self::JobUpdate(_) => "job_update",
            Self::JobFinished(_) => "job_finished",
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::JobStarted(e) => &e.job_id,
            Self::JobUpdate(e) => &e.job_id,
            Self::JobFinished(e) => &e.job_id,
        }
    }

    /// Render as a server-sent-events frame.
    pub fn to_sse(&self) -> serde_json::Result<String> {
        let data = match self {
            Self::JobStarted(e) => serde_json::to_string(e)?,
            Self::JobUpdate(e) => serde_json::to_string(e)?,
            Self::JobFinished(e) => serde_json::to_string(e)?,
        };
        Ok(format!("event: {}\ndata: {}\n\n", self.name(), data))
    }
}

/// Current state of one item, for reconnecting clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub asin: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    pub progress_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

/// Current state of a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job: Job,
    pub items: Vec<ItemSnapshot>,
    /// Job-level progress, used by jobs without items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    pub progress_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_text: Option<String>,
}

impl JobSnapshot {
    fn item_mut(&mut self, asin: &str) -> Option<&mut ItemSnapshot> {
        self.items.iter_mut().find(|item| item.asin == asin)
    }
}

/// Ordered event stream plus snapshots of active jobs.
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<JobEvent>,
    /// Active jobs in start order.
    active: Mutex<Vec<JobSnapshot>>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            active: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to all future events.
    ///
    /// A receiver that falls more than the channel capacity behind gets
    /// `RecvError::Lagged` and should resynchronise from [`Self::active_job`].
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// The oldest job that has started and not finished.
    pub fn active_job(&self) -> Option<JobSnapshot> {
        self.active.lock().first().cloned()
    }

    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.active
            .lock()
            .iter()
            .find(|s| s.job.job_id == job_id)
            .cloned()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub(crate) fn job_started(&self, job: &Job, items: &[JobItem]) {
        let mut active = self.active.lock();
        if active.iter().any(|s| s.job.job_id == job.job_id) {
            return;
        }
        active.push(JobSnapshot {
            job: job.clone(),
            items: items
                .iter()
                .map(|item| ItemSnapshot {
                    asin: item.asin.clone(),
                    status: item.status,
                    status_text: None,
                    progress_percent: 0,
                    log: None,
                })
                .collect(),
            status_text: None,
            progress_percent: 0,
            phase_text: None,
        });
        self.emit(JobEvent::JobStarted(JobStarted {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            status: job.status,
            items: items
                .iter()
                .map(|item| ItemOutcome {
                    asin: item.asin.clone(),
                    status: item.status,
                })
                .collect(),
        }));
    }

    /// Mirror a job record change (e.g. QUEUED to RUNNING) into its snapshot.
    pub(crate) fn job_changed(&self, job: &Job) {
        let mut active = self.active.lock();
        if let Some(snapshot) = active.iter_mut().find(|s| s.job.job_id == job.job_id) {
            snapshot.job = job.clone();
        }
    }

    /// Per-item transition or progress.
    pub(crate) fn item_update(
        &self,
        job_id: &str,
        asin: &str,
        status: ItemStatus,
        status_text: impl Into<String>,
        progress_percent: u8,
        log: Option<&str>,
    ) {
        let status_text = status_text.into();
        let mut active = self.active.lock();
        let Some(snapshot) = active.iter_mut().find(|s| s.job.job_id == job_id) else {
            trace!(%job_id, %asin, "Dropping update for inactive job");
            return;
        };
        let Some(item) = snapshot.item_mut(asin) else {
            trace!(%job_id, %asin, "Dropping update for unknown item");
            return;
        };
        item.status = status;
        item.status_text = Some(status_text.clone());
        item.progress_percent = progress_percent;
        if let Some(log) = log {
            item.log = Some(log.to_string());
        }

        self.emit(JobEvent::JobUpdate(JobUpdate {
            job_id: job_id.to_string(),
            asin: Some(asin.to_string()),
            status_text,
            progress_percent,
            phase_text: None,
        }));
    }

    /// Job-level progress without an item.
    pub(crate) fn job_progress(
        &self,
        job_id: &str,
        status_text: impl Into<String>,
        progress_percent: u8,
        phase_text: Option<String>,
    ) {
        let status_text = status_text.into();
        let progress_percent = progress_percent.min(100);
        let mut active = self.active.lock();
        let Some(snapshot) = active.iter_mut().find(|s| s.job.job_id == job_id) else {
            trace!(%job_id, "Dropping progress for inactive job");
            return;
        };
        snapshot.status_text = Some(status_text.clone());
        snapshot.progress_percent = progress_percent;
        if phase_text.is_some() {
            snapshot.phase_text = phase_text.clone();
        }

        self.emit(JobEvent::JobUpdate(JobUpdate {
            job_id: job_id.to_string(),
            asin: None,
            status_text,
            progress_percent,
            phase_text,
        }));
    }

    /// Emit the single `job_finished` event and retire the snapshot.
    /// Returns false if the job was not active.
    pub(crate) fn job_finished(&self, job: &Job, items: Vec<ItemOutcome>) -> bool {
        let mut active = self.active.lock();
        let Some(position) = active.iter().position(|s| s.job.job_id == job.job_id) else {
            return false;
        };
        active.remove(position);
        self.emit(JobEvent::JobFinished(JobFinished {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            status: job.status,
            items,
        }));
        true
    }

    fn emit(&self, event: JobEvent) {
        debug!(job_id = %event.job_id(), event = event.name(), "Broadcasting job event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
