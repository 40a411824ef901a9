//! External collaborators of the runner.
//!
//! The catalog client, the encoder/muxer toolchain and the library sync are
//! opaque: each call may take arbitrarily long and may fail.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::progress::ProgressBroadcaster;

/// Catalog metadata of one book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMetadata {
    pub asin: String,
    pub title: String,
    pub author: String,
    /// Total runtime in minutes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_min: Option<u32>,
}

/// One chapter of a prepared book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub index: usize,
    pub start_offset_ms: u64,
    pub length_ms: u64,
}

/// A downloaded and extracted book, ready to encode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedBook {
    pub metadata: BookMetadata,
    pub chapters: Vec<Chapter>,
    /// Scratch directory holding the extracted assets.
    pub work_dir: PathBuf,
}

/// Output of one chapter encode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedChapter {
    pub index: usize,
    pub path: PathBuf,
}

/// Source of book metadata.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn fetch_metadata(&self, asin: &str) -> anyhow::Result<BookMetadata>;
}

/// Download, encode and merge invocations.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Download and extract the book's assets and chapter list.
    async fn prepare(&self, book: &BookMetadata) -> anyhow::Result<PreparedBook>;

    async fn encode_chapter(
        &self,
        book: &PreparedBook,
        chapter: &Chapter,
    ) -> anyhow::Result<EncodedChapter>;

    /// Assemble the final artifact. `chapters` is sorted by index.
    async fn merge(
        &self,
        book: &PreparedBook,
        chapters: &[EncodedChapter],
    ) -> anyhow::Result<PathBuf>;
}

/// Depth of a library sync.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
    /// Catalog API only.
    Fast,
    /// Catalog API plus a full filesystem scan and reconciliation.
    #[default]
    Deep,
}

/// Result of a successful library sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Books discovered by the sync that have not been processed yet.
    pub new_asins: Vec<String>,
}

/// Emits phase-level `job_update` events for a SYNC job.
#[derive(Clone)]
pub struct SyncReporter {
    job_id: String,
    broadcaster: Arc<ProgressBroadcaster>,
}

impl SyncReporter {
    pub(crate) fn new(job_id: impl Into<String>, broadcaster: Arc<ProgressBroadcaster>) -> Self {
        Self {
            job_id: job_id.into(),
            broadcaster,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Coarse progress inside the current phase, e.g. "50/120 scanned".
    pub fn progress(&self, status_text: impl Into<String>, progress_percent: u8) {
        self.broadcaster
            .job_progress(&self.job_id, status_text, progress_percent, None);
    }

    /// Progress that also announces a phase, e.g. "Phase 1/3: Fetching".
    pub fn phase(
        &self,
        phase_text: impl Into<String>,
        status_text: impl Into<String>,
        progress_percent: u8,
    ) {
        self.broadcaster.job_progress(
            &self.job_id,
            status_text,
            progress_percent,
            Some(phase_text.into()),
        );
    }
}

/// Everything a sync implementation gets from the runner.
#[derive(Clone)]
pub struct SyncContext {
    pub job_id: String,
    pub mode: SyncMode,
    pub reporter: SyncReporter,
    /// Fires when the job is cancelled. Checking it is cooperative.
    pub cancellation: CancellationToken,
}

/// Library synchronisation run by SYNC jobs.
#[async_trait]
pub trait LibrarySync: Send + Sync {
    async fn run(&self, ctx: SyncContext) -> anyhow::Result<SyncOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_mode_parse() {
        assert_eq!("fast".parse::<SyncMode>().unwrap(), SyncMode::Fast);
        assert_eq!("DEEP".parse::<SyncMode>().unwrap(), SyncMode::Deep);
        assert_eq!(SyncMode::default(), SyncMode::Deep);
        assert!("shallow".parse::<SyncMode>().is_err());
    }

    #[test]
    fn test_metadata_runtime_is_optional() {
        let metadata: BookMetadata =
            serde_json::from_str(r#"{"asin":"B01","title":"T","author":"A"}"#).unwrap();
        assert_eq!(metadata.runtime_min, None);
    }
}
