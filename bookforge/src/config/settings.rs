//! The settings document.
//!
//! Settings live in a JSON file. Loading layers the file over the defaults
//! with a recursive merge, so a partial file is valid and keys this crate
//! does not know about are kept on save.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::runner::DEFAULT_EVENT_CAPACITY;
use crate::{Error, Result};

fn default_parallel_downloads() -> usize {
    2
}

fn default_processing_cores() -> usize {
    2
}

fn default_item_log_max_chars() -> usize {
    500
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

/// `job.download`: the two concurrency caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSettings {
    /// Maximum PREPARE tasks in flight.
    #[serde(default = "default_parallel_downloads")]
    pub max_parallel_downloads: usize,
    /// Worker pool capacity.
    #[serde(default = "default_processing_cores")]
    pub total_processing_cores: usize,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_parallel_downloads: default_parallel_downloads(),
            total_processing_cores: default_processing_cores(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default)]
    pub download: DownloadSettings,
    /// Accept a new job while another one is active.
    #[serde(default)]
    pub allow_concurrent_jobs: bool,
    /// Longest error text stored on a FAILED item.
    #[serde(default = "default_item_log_max_chars")]
    pub item_log_max_chars: usize,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            download: DownloadSettings::default(),
            allow_concurrent_jobs: false,
            item_log_max_chars: default_item_log_max_chars(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    /// Start a DOWNLOAD job for new books found by a SYNC job.
    #[serde(default)]
    pub process_new_on_sync: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive; empty means the built-in default.
    #[serde(default)]
    pub filter: String,
}

/// Application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub job: JobSettings,
    #[serde(default)]
    pub tasks: TaskSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Sections owned by other parts of the product.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Runtime configuration of the job runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub total_processing_cores: usize,
    pub max_parallel_downloads: usize,
    pub allow_concurrent_jobs: bool,
    pub item_log_max_chars: usize,
    pub event_channel_capacity: usize,
    pub process_new_on_sync: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Settings::default().runner_config()
    }
}

impl Settings {
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            total_processing_cores: self.job.download.total_processing_cores,
            max_parallel_downloads: self.job.download.max_parallel_downloads,
            allow_concurrent_jobs: self.job.allow_concurrent_jobs,
            item_log_max_chars: self.job.item_log_max_chars,
            event_channel_capacity: self.job.event_channel_capacity,
            process_new_on_sync: self.tasks.process_new_on_sync,
        }
    }

    /// Check the values the runner cannot work with.
    pub fn validate(&self) -> Result<()> {
        let download = &self.job.download;
        if download.total_processing_cores == 0 {
            return Err(Error::invalid_input(
                "job.download.total_processing_cores must be at least 1",
            ));
        }
        if download.max_parallel_downloads == 0 {
            return Err(Error::invalid_input(
                "job.download.max_parallel_downloads must be at least 1",
            ));
        }
        if self.job.event_channel_capacity == 0 {
            return Err(Error::invalid_input(
                "job.event_channel_capacity must be at least 1",
            ));
        }
        Ok(())
    }

    /// Layer a JSON document over the defaults.
    pub fn from_json(document: Value) -> Result<Self> {
        let mut merged = serde_json::to_value(Settings::default())?;
        merge_json(&mut merged, document);
        let settings: Settings = serde_json::from_value(merged)?;
        settings.validate().map_err(|e| match e {
            Error::InvalidInput(message) => Error::Configuration(message),
            other => other,
        })?;
        Ok(settings)
    }

    /// Load settings from `path`. A missing file yields the defaults; an
    /// unreadable or invalid one is logged and also yields the defaults.
    pub async fn load(path: &Path) -> Self {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file, using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), "Error reading settings: {}. Using default settings.", e);
                return Self::default();
            }
        };

        match serde_json::from_str::<Value>(&contents)
            .map_err(Error::from)
            .and_then(Self::from_json)
        {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), "Error loading settings: {}. Using default settings.", e);
                Self::default()
            }
        }
    }

    /// Write to `path` through a temporary file and a rename.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let tmp = tmp_path(path);
        let contents = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "Settings saved");
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Recursively merge `overrides` into `base`. Objects merge key by key;
/// any other value replaces what was there.
pub fn merge_json(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overrides) => *base = overrides,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.job.download.max_parallel_downloads, 2);
        assert_eq!(settings.job.download.total_processing_cores, 2);
        assert_eq!(settings.job.item_log_max_chars, 500);
        assert!(!settings.job.allow_concurrent_jobs);
        assert!(!settings.tasks.process_new_on_sync);
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let settings = Settings::from_json(json!({
            "job": { "download": { "total_processing_cores": 8 } },
            "naming": { "template": "{author}/{title}" }
        }))
        .unwrap();
        assert_eq!(settings.job.download.total_processing_cores, 8);
        assert_eq!(settings.job.download.max_parallel_downloads, 2);
        assert_eq!(settings.extra["naming"]["template"], "{author}/{title}");
    }

    #[test]
    fn test_invalid_document_rejected() {
        let err = Settings::from_json(json!({
            "job": { "download": { "max_parallel_downloads": 0 } }
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_merge_replaces_non_objects() {
        let mut base = json!({ "a": { "b": 1, "c": [1, 2] }, "d": 1 });
        merge_json(&mut base, json!({ "a": { "c": [3] }, "d": { "e": true } }));
        assert_eq!(base, json!({ "a": { "b": 1, "c": [3] }, "d": { "e": true } }));
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_files_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert_eq!(Settings::load(&path).await, Settings::default());

        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert_eq!(Settings::load(&path).await, Settings::default());
    }

    #[tokio::test]
    async fn test_save_is_atomic_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("settings.json");

        let mut settings = Settings::default();
        settings.job.download.total_processing_cores = 6;
        settings.tasks.process_new_on_sync = true;
        settings.save(&path).await.unwrap();

        assert!(!tmp_path(&path).exists());
        assert_eq!(Settings::load(&path).await, settings);
    }
}
