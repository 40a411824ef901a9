//! Application settings.

pub mod events;
pub mod service;
pub mod settings;

pub use events::{SettingsEvent, SettingsEventBroadcaster};
pub use service::SettingsStore;
pub use settings::{
    DownloadSettings, JobSettings, LoggingSettings, RunnerConfig, Settings, TaskSettings,
    merge_json,
};
