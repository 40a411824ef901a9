//! Dispatchable units of work.
//!
//! A [`Task`] is one stage invocation for one book (or one chapter of a book).
//! Tasks are never persisted: they live from the moment a pipeline submits them
//! until their [`TaskReport`] has been delivered back to the owner.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::collaborators::{EncodedChapter, PreparedBook};

/// Pipeline stage of a task. Doubles as the priority tier.
///
/// Lower [`StageKind::priority`] wins: ENCODE is preferred over PREPARE, which
/// is preferred over MERGE.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    /// Per-chapter CPU-bound conversion.
    Encode,
    /// Download and extraction of a new book.
    Prepare,
    /// Final assembly of an encoded book.
    Merge,
}

impl StageKind {
    /// Numeric priority tier, lowest number is dispatched first.
    pub const fn priority(self) -> u8 {
        match self {
            Self::Encode => 1,
            Self::Prepare => 2,
            Self::Merge => 3,
        }
    }
}

/// Successful result of a stage invocation.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Prepared(PreparedBook),
    Encoded(EncodedChapter),
    Merged(PathBuf),
}

/// How a task ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Succeeded(StageOutput),
    /// The work function returned an error (or panicked).
    Failed(String),
    /// The task was cancelled while still queued and never ran.
    Skipped,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

/// Result of a task delivered back to its owning pipeline.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub stage: StageKind,
    pub job_id: String,
    pub asin: String,
    pub chapter: Option<usize>,
    pub outcome: TaskOutcome,
    /// Time spent executing the work function. Zero for skipped tasks.
    pub elapsed: Duration,
}

pub type TaskFuture = BoxFuture<'static, anyhow::Result<StageOutput>>;
type WorkFn = Box<dyn FnOnce() -> TaskFuture + Send>;

/// A unit of dispatch.
pub struct Task {
    stage: StageKind,
    job_id: String,
    asin: String,
    chapter: Option<usize>,
    work: WorkFn,
    cancel: CancellationToken,
    reply_to: Option<mpsc::UnboundedSender<TaskReport>>,
}

impl Task {
    /// Create a task running `work` once a slot is available.
    pub fn new<F, Fut>(
        stage: StageKind,
        job_id: impl Into<String>,
        asin: impl Into<String>,
        work: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<StageOutput>> + Send + 'static,
    {
        Self {
            stage,
            job_id: job_id.into(),
            asin: asin.into(),
            chapter: None,
            work: Box::new(move || -> TaskFuture { Box::pin(work()) }),
            cancel: CancellationToken::new(),
            reply_to: None,
        }
    }

    pub fn with_chapter(mut self, index: usize) -> Self {
        self.chapter = Some(index);
        self
    }

    /// Token checked at dequeue time; a cancelled task is skipped.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn reply_to(mut self, tx: mpsc::UnboundedSender<TaskReport>) -> Self {
        self.reply_to = Some(tx);
        self
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn asin(&self) -> &str {
        &self.asin
    }

    pub fn chapter(&self) -> Option<usize> {
        self.chapter
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Split the task into its work function and a completion handle.
    pub(crate) fn into_parts(self) -> (WorkFn, TaskCompletion) {
        let completion = TaskCompletion {
            stage: self.stage,
            job_id: self.job_id,
            asin: self.asin,
            chapter: self.chapter,
            reply_to: self.reply_to,
        };
        (self.work, completion)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("stage", &self.stage)
            .field("job_id", &self.job_id)
            .field("asin", &self.asin)
            .field("chapter", &self.chapter)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Everything needed to report a task's outcome once its work has run.
pub(crate) struct TaskCompletion {
    stage: StageKind,
    job_id: String,
    asin: String,
    chapter: Option<usize>,
    reply_to: Option<mpsc::UnboundedSender<TaskReport>>,
}

impl TaskCompletion {
    pub(crate) fn report(self, outcome: TaskOutcome, elapsed: Duration) {
        let report = TaskReport {
            stage: self.stage,
            job_id: self.job_id,
            asin: self.asin,
            chapter: self.chapter,
            outcome,
            elapsed,
        };
        if let Some(tx) = self.reply_to {
            if tx.send(report).is_err() {
                tracing::debug!("Task owner is gone; dropping report");
            }
        }
    }
}
