//! Per-book stage pipeline.
//!
//! `NOT_STARTED -> PREPARING -> ENCODING -> MERGING -> DONE`, with FAILED and
//! CANCELLED absorbing states reachable from every non-terminal state. The
//! pipeline only decides; the coordinator turns its [`Step`]s into tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::collaborators::{EncodedChapter, PreparedBook};
use super::model::ItemStatus;
use super::task::{StageKind, StageOutput, TaskOutcome};

/// State of one book.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookState {
    NotStarted,
    Preparing,
    Encoding,
    Merging,
    Done,
    Failed,
    Cancelled,
}

impl BookState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    pub fn item_status(self) -> ItemStatus {
        match self {
            Self::NotStarted => ItemStatus::Queued,
            Self::Preparing | Self::Encoding | Self::Merging => ItemStatus::Processing,
            Self::Done => ItemStatus::Completed,
            Self::Failed => ItemStatus::Failed,
            Self::Cancelled => ItemStatus::Cancelled,
        }
    }
}

/// What the owner must do after feeding a task result to the pipeline.
#[derive(Debug)]
pub enum Step {
    /// More results are outstanding before anything can be submitted.
    Wait { encoded: usize, total: usize },
    /// Submit one ENCODE task per chapter.
    SubmitEncodes(Arc<PreparedBook>),
    /// Submit the MERGE task with the encoded chapters sorted by index.
    SubmitMerge(Arc<PreparedBook>, Vec<EncodedChapter>),
    Done(PathBuf),
    Failed(String),
    /// The pipeline was already terminal; the result is ignored.
    Discarded,
}

/// Stage state machine for one book of a job.
#[derive(Debug)]
pub struct StagePipeline {
    asin: String,
    state: BookState,
    book: Option<Arc<PreparedBook>>,
    total_chapters: usize,
    encoded: Vec<EncodedChapter>,
    error: Option<String>,
    outstanding: usize,
    cancel: CancellationToken,
    started_at: Option<Instant>,
}

impl StagePipeline {
    /// `cancel` is checked by the dispatcher before running any of this
    /// book's queued tasks; it is fired when the book fails or is cancelled.
    pub fn new(asin: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            asin: asin.into(),
            state: BookState::NotStarted,
            book: None,
            total_chapters: 0,
            encoded: Vec::new(),
            error: None,
            outstanding: 0,
            cancel,
            started_at: None,
        }
    }

    pub fn asin(&self) -> &str {
        &self.asin
    }

    pub fn state(&self) -> BookState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn item_status(&self) -> ItemStatus {
        self.state.item_status()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Tasks submitted for this book that have not reported back yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn book(&self) -> Option<&Arc<PreparedBook>> {
        self.book.as_ref()
    }

    /// Time since the PREPARE task was submitted.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// Progress shown to clients for the current state.
    pub fn progress_percent(&self) -> u8 {
        match self.state {
            BookState::NotStarted => 0,
            BookState::Preparing => 5,
            BookState::Encoding if self.total_chapters > 0 => {
                (30 + self.encoded.len() * 60 / self.total_chapters) as u8
            }
            BookState::Encoding => 30,
            BookState::Merging => 90,
            BookState::Done | BookState::Failed | BookState::Cancelled => 100,
        }
    }

    /// Enter PREPARING; the caller submits the PREPARE task.
    pub fn start_prepare(&mut self) -> bool {
        if self.state != BookState::NotStarted {
            return false;
        }
        self.state = BookState::Preparing;
        self.outstanding += 1;
        self.started_at = Some(Instant::now());
        true
    }

    /// Forget a task that was counted but could not be submitted.
    pub fn submission_failed(&mut self, count: usize) {
        self.outstanding = self.outstanding.saturating_sub(count);
    }

    /// Feed back the result of one of this book's tasks.
    pub fn on_report(&mut self, stage: StageKind, outcome: TaskOutcome) -> Step {
        self.outstanding = self.outstanding.saturating_sub(1);

        if self.state.is_terminal() {
            return Step::Discarded;
        }

        let output = match outcome {
            TaskOutcome::Succeeded(output) => output,
            TaskOutcome::Failed(message) => return self.fail(message),
            TaskOutcome::Skipped => {
                return self.fail(format!("{} task was dropped before it ran", stage));
            }
        };

        match (self.state, stage, output) {
            (BookState::Preparing, StageKind::Prepare, StageOutput::Prepared(book)) => {
                if book.chapters.is_empty() {
                    return self.fail("Book has no chapter information.");
                }
                let book = Arc::new(book);
                self.total_chapters = book.chapters.len();
                self.encoded = Vec::with_capacity(self.total_chapters);
                self.book = Some(book.clone());
                self.state = BookState::Encoding;
                self.outstanding += self.total_chapters;
                Step::SubmitEncodes(book)
            }
            (BookState::Encoding, StageKind::Encode, StageOutput::Encoded(chapter)) => {
                self.encoded.push(chapter);
                if self.encoded.len() < self.total_chapters {
                    return Step::Wait {
                        encoded: self.encoded.len(),
                        total: self.total_chapters,
                    };
                }
                let Some(book) = self.book.clone() else {
                    return self.fail("encoded chapters without a prepared book");
                };
                let mut chapters = std::mem::take(&mut self.encoded);
                chapters.sort_by_key(|c| c.index);
                self.encoded = chapters.clone();
                self.state = BookState::Merging;
                self.outstanding += 1;
                Step::SubmitMerge(book, chapters)
            }
            (BookState::Merging, StageKind::Merge, StageOutput::Merged(path)) => {
                self.state = BookState::Done;
                Step::Done(path)
            }
            (state, stage, _) => self.fail(format!("unexpected {} result while {}", stage, state)),
        }
    }

    /// Move to FAILED and stop this book's queued tasks.
    pub fn fail(&mut self, message: impl Into<String>) -> Step {
        if self.state.is_terminal() {
            return Step::Discarded;
        }
        let message = message.into();
        self.state = BookState::Failed;
        self.error = Some(message.clone());
        self.cancel.cancel();
        Step::Failed(message)
    }

    /// Move to CANCELLED. Returns false if already terminal.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = BookState::Cancelled;
        self.cancel.cancel();
        true
    }
}
