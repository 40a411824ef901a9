//! Task runner: priority dispatch, per-book stage pipelines, job
//! coordination and progress broadcasting.

pub mod collaborators;
pub mod coordinator;
pub mod dispatcher;
pub mod eta;
pub mod gate;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod task;

pub use collaborators::{
    BookMetadata, CatalogClient, Chapter, EncodedChapter, LibrarySync, MediaBackend,
    PreparedBook, SyncContext, SyncMode, SyncOutcome, SyncReporter,
};
pub use coordinator::{Collaborators, DownloadStats, FinishedJob, JobCoordinator, RunnerStats};
pub use dispatcher::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};
pub use eta::EtaEstimator;
pub use gate::{DownloadGate, DownloadPermit};
pub use model::{
    ItemStatus, Job, JobItem, JobParams, JobStatus, JobType, aggregate_status, truncate_log,
};
pub use pipeline::{BookState, StagePipeline, Step};
pub use progress::{
    DEFAULT_EVENT_CAPACITY, ItemOutcome, ItemSnapshot, JobEvent, JobFinished, JobSnapshot,
    JobStarted, JobUpdate, ProgressBroadcaster,
};
pub use queue::PriorityWorkQueue;
pub use task::{StageKind, StageOutput, Task, TaskOutcome, TaskReport};
