//! Job and job item records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque key/value job configuration (e.g. `sync_mode`).
pub type JobParams = serde_json::Map<String, serde_json::Value>;

/// Job types.
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
pub enum JobType {
    Sync,
    Download,
}

/// Job status.
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
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Status of one book within a DOWNLOAD job.
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
pub enum ItemStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One batch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub params: JobParams,
}

impl Job {
    pub fn new(job_type: JobType, params: JobParams) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            job_type,
            status: JobStatus::Queued,
            start_time: Utc::now(),
            end_time: None,
            params,
        }
    }

    /// Move to a terminal status. Later calls are ignored.
    pub fn finish(&mut self, status: JobStatus) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.end_time = Some(Utc::now());
        true
    }

    /// String parameter lookup.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// One book's outcome within a DOWNLOAD job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobItem {
    pub job_id: String,
    pub asin: String,
    pub status: ItemStatus,
    /// Truncated error text, present only on FAILED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl JobItem {
    pub fn new(job_id: impl Into<String>, asin: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            asin: asin.into(),
            status: ItemStatus::Queued,
            log: None,
        }
    }
}

/// Final job status derived from the item statuses.
///
/// COMPLETED iff every item completed; CANCELLED iff cancellation was
/// requested and at least one item ended cancelled; FAILED otherwise.
pub fn aggregate_status<I>(items: I, cancel_requested: bool) -> JobStatus
where
    I: IntoIterator<Item = ItemStatus>,
{
    let mut all_completed = true;
    let mut any_cancelled = false;
    for status in items {
        all_completed &= status == ItemStatus::Completed;
        any_cancelled |= status == ItemStatus::Cancelled;
    }

    if all_completed {
        JobStatus::Completed
    } else if cancel_requested && any_cancelled {
        JobStatus::Cancelled
    } else {
        JobStatus::Failed
    }
}

/// Cut an error message down to `max_chars`, on a char boundary.
pub fn truncate_log(message: &str, max_chars: usize) -> String {
    let message = message.trim();
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &message[..cut]),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ItemStatus::*;

    #[test]
    fn test_aggregate_all_completed() {
        assert_eq!(
            aggregate_status([Completed, Completed, Completed], false),
            JobStatus::Completed
        );
    }

    #[test]
    fn test_aggregate_one_failed() {
        assert_eq!(
            aggregate_status([Completed, Failed, Completed], false),
            JobStatus::Failed
        );
    }

    #[test]
    fn test_aggregate_cancelled_mid_flight() {
        assert_eq!(
            aggregate_status([Completed, Cancelled, Cancelled], true),
            JobStatus::Cancelled
        );
    }

    #[test]
    fn test_aggregate_cancel_requested_but_everything_finished() {
        assert_eq!(
            aggregate_status([Completed, Completed], true),
            JobStatus::Completed
        );
        assert_eq!(aggregate_status([Completed, Failed], true), JobStatus::Failed);
    }

    #[test]
    fn test_job_finishes_once() {
        let mut job = Job::new(JobType::Download, JobParams::new());
        assert_eq!(job.status, JobStatus::Queued);
        assert!(!job.finish(JobStatus::Running));
        assert!(job.finish(JobStatus::Failed));
        let end = job.end_time;
        assert!(end.is_some());
        assert!(!job.finish(JobStatus::Completed));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.end_time, end);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Cancelled).unwrap(),
            "\"CANCELLED\""
        );
        assert_eq!(ItemStatus::Processing.to_string(), "PROCESSING");
        assert_eq!("SYNC".parse::<JobType>().unwrap(), JobType::Sync);
    }

    #[test]
    fn test_truncate_log() {
        assert_eq!(truncate_log("  short  ", 10), "short");
        assert_eq!(truncate_log("abcdefghij", 4), "abcd…");
        assert_eq!(truncate_log("ééééé", 2), "éé…");
    }
}
