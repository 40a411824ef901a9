//! In-process stand-ins for the catalog, media toolchain and library sync.
//!
//! They sleep instead of doing work and record every stage they run, which
//! makes ordering and concurrency observable. Used by the binary and
//! by tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::runner::{
    BookMetadata, CatalogClient, Chapter, EncodedChapter, LibrarySync, MediaBackend,
    PreparedBook, StageKind, SyncContext, SyncMode, SyncOutcome,
};

/// Catalog answering from a fixed runtime, optionally failing for some books.
#[derive(Debug, Default)]
pub struct SimulatedCatalog {
    runtime_min: Option<u32>,
    failing: HashSet<String>,
}

impl SimulatedCatalog {
    pub fn new() -> Self {
        Self {
            runtime_min: Some(60),
            failing: HashSet::new(),
        }
    }

    pub fn with_runtime(mut self, runtime_min: Option<u32>) -> Self {
        self.runtime_min = runtime_min;
        self
    }

    pub fn fail_for(mut self, asin: impl Into<String>) -> Self {
        self.failing.insert(asin.into());
        self
    }
}

#[async_trait]
impl CatalogClient for SimulatedCatalog {
    async fn fetch_metadata(&self, asin: &str) -> anyhow::Result<BookMetadata> {
        if self.failing.contains(asin) {
            bail!("simulated catalog failure for {}", asin);
        }
        Ok(BookMetadata {
            asin: asin.to_string(),
            title: format!("Book {}", asin),
            author: "Simulated Author".to_string(),
            runtime_min: self.runtime_min,
        })
    }
}

/// One stage run by [`SimulatedMedia`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: StageKind,
    pub asin: String,
    pub chapter: Option<usize>,
    pub started: Instant,
    pub finished: Instant,
}

/// Media toolchain that sleeps for a configurable time per stage.
#[derive(Debug)]
pub struct SimulatedMedia {
    chapters: usize,
    chapters_by_asin: HashMap<String, usize>,
    prepare_delay: Duration,
    encode_delay: Duration,
    merge_delay: Duration,
    failures: HashSet<(String, StageKind)>,
    records: Mutex<Vec<StageRecord>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for SimulatedMedia {
    fn default() -> Self {
        Self {
            chapters: 2,
            chapters_by_asin: HashMap::new(),
            prepare_delay: Duration::from_millis(5),
            encode_delay: Duration::from_millis(5),
            merge_delay: Duration::from_millis(5),
            failures: HashSet::new(),
            records: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

impl SimulatedMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chapter count of every book without an override.
    pub fn with_chapters(mut self, chapters: usize) -> Self {
        self.chapters = chapters;
        self
    }

    pub fn with_chapters_for(mut self, asin: impl Into<String>, chapters: usize) -> Self {
        self.chapters_by_asin.insert(asin.into(), chapters);
        self
    }

    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = delay;
        self
    }

    pub fn with_encode_delay(mut self, delay: Duration) -> Self {
        self.encode_delay = delay;
        self
    }

    pub fn with_merge_delay(mut self, delay: Duration) -> Self {
        self.merge_delay = delay;
        self
    }

    /// Make `stage` fail for `asin`.
    pub fn fail_at(mut self, asin: impl Into<String>, stage: StageKind) -> Self {
        self.failures.insert((asin.into(), stage));
        self
    }

    /// Stages run so far, in completion order.
    pub fn records(&self) -> Vec<StageRecord> {
        self.records.lock().clone()
    }

    /// Largest number of stages that ran at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn run(
        &self,
        stage: StageKind,
        asin: &str,
        chapter: Option<usize>,
        delay: Duration,
    ) -> anyhow::Result<()> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let started = Instant::now();
        tokio::time::sleep(delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        self.records.lock().push(StageRecord {
            stage,
            asin: asin.to_string(),
            chapter,
            started,
            finished: Instant::now(),
        });

        if self.failures.contains(&(asin.to_string(), stage)) {
            bail!("simulated {} failure for {}", stage, asin);
        }
        Ok(())
    }
}

#[async_trait]
impl MediaBackend for SimulatedMedia {
    async fn prepare(&self, book: &BookMetadata) -> anyhow::Result<PreparedBook> {
        self.run(StageKind::Prepare, &book.asin, None, self.prepare_delay)
            .await?;
        let count = self
            .chapters_by_asin
            .get(&book.asin)
            .copied()
            .unwrap_or(self.chapters);
        let length_ms = 60_000;
        let chapters = (0..count)
            .map(|index| Chapter {
                index,
                start_offset_ms: index as u64 * length_ms,
                length_ms,
            })
            .collect();
        Ok(PreparedBook {
            metadata: book.clone(),
            chapters,
            work_dir: std::env::temp_dir().join("bookforge").join(&book.asin),
        })
    }

    async fn encode_chapter(
        &self,
        book: &PreparedBook,
        chapter: &Chapter,
    ) -> anyhow::Result<EncodedChapter> {
        self.run(
            StageKind::Encode,
            &book.metadata.asin,
            Some(chapter.index),
            self.encode_delay,
        )
        .await?;
        Ok(EncodedChapter {
            index: chapter.index,
            path: book.work_dir.join(format!("chapter_{:03}.m4a", chapter.index)),
        })
    }

    async fn merge(
        &self,
        book: &PreparedBook,
        chapters: &[EncodedChapter],
    ) -> anyhow::Result<PathBuf> {
        if chapters.windows(2).any(|w| w[0].index >= w[1].index) {
            bail!("chapters out of order for {}", book.metadata.asin);
        }
        self.run(StageKind::Merge, &book.metadata.asin, None, self.merge_delay)
            .await?;
        Ok(book.work_dir.join(format!("{}.m4b", book.metadata.asin)))
    }
}

/// Library sync that walks through its phases and reports a fixed set of
/// new books.
#[derive(Debug, Default)]
pub struct SimulatedLibrary {
    new_asins: Vec<String>,
    phase_delay: Duration,
    fail: bool,
    runs: AtomicUsize,
}

impl SimulatedLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_new_asins<I, S>(mut self, asins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.new_asins = asins.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_phase_delay(mut self, delay: Duration) -> Self {
        self.phase_delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Sleep for one phase. Returns false if the sync was cancelled.
    async fn pause(&self, ctx: &SyncContext) -> bool {
        tokio::select! {
            _ = ctx.cancellation.cancelled() => false,
            _ = tokio::time::sleep(self.phase_delay) => true,
        }
    }
}

#[async_trait]
impl LibrarySync for SimulatedLibrary {
    async fn run(&self, ctx: SyncContext) -> anyhow::Result<SyncOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let reporter = &ctx.reporter;

        let fetch_phase = match ctx.mode {
            SyncMode::Fast => "Phase 1/1: Fetching from catalog",
            SyncMode::Deep => "Phase 1/3: Fetching from catalog",
        };
        reporter.phase(fetch_phase, "Fetching library...", 10);
        if !self.pause(&ctx).await {
            return Ok(SyncOutcome::default());
        }
        if self.fail {
            bail!("simulated sync failure");
        }

        if ctx.mode == SyncMode::Deep {
            reporter.phase("Phase 2/3: Scanning filesystem", "Scanning local files...", 50);
            if !self.pause(&ctx).await {
                return Ok(SyncOutcome::default());
            }
            reporter.phase("Phase 3/3: Reconciling database", "Reconciling database...", 95);
        }

        reporter.progress("Finishing up...", 100);
        Ok(SyncOutcome {
            new_asins: self.new_asins.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_media_failure_message() {
        let media = SimulatedMedia::new().fail_at("B2", StageKind::Encode);
        let catalog = SimulatedCatalog::new();
        let metadata = catalog.fetch_metadata("B2").await.unwrap();
        let book = media.prepare(&metadata).await.unwrap();
        assert_eq!(book.chapters.len(), 2);

        let err = media
            .encode_chapter(&book, &book.chapters[0])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "simulated ENCODE failure for B2");
        assert_eq!(media.records().len(), 2);
    }

    #[tokio::test]
    async fn test_chapter_override_and_merge_order() {
        let media = SimulatedMedia::new().with_chapters(1).with_chapters_for("B9", 3);
        let metadata = SimulatedCatalog::new().fetch_metadata("B9").await.unwrap();
        let book = media.prepare(&metadata).await.unwrap();
        assert_eq!(book.chapters.len(), 3);

        let mut encoded = Vec::new();
        for chapter in book.chapters.iter().rev() {
            encoded.push(media.encode_chapter(&book, chapter).await.unwrap());
        }
        assert!(media.merge(&book, &encoded).await.is_err());
        encoded.reverse();
        let output = media.merge(&book, &encoded).await.unwrap();
        assert!(output.ends_with("B9.m4b"));
    }

    #[tokio::test]
    async fn test_catalog_failure() {
        let catalog = SimulatedCatalog::new().fail_for("B1");
        assert!(catalog.fetch_metadata("B1").await.is_err());
        assert_eq!(catalog.fetch_metadata("B2").await.unwrap().runtime_min, Some(60));
    }
}
