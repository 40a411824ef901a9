//! Application-wide error types.

use thiserror::Error;

use crate::runner::StageKind;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad arguments to enqueue/reconfigure, or a job is already active.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The runner itself cannot accept work. Fatal to the calling operation.
    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),

    /// A single PREPARE/ENCODE/MERGE invocation failed.
    #[error("{stage} task failed for {asin}: {message}")]
    TaskFailure {
        stage: StageKind,
        asin: String,
        message: String,
    },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn task_failure(stage: StageKind, asin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskFailure {
            stage,
            asin: asin.into(),
            message: message.into(),
        }
    }

    /// Whether this error was caused by the caller rather than the runner.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}
