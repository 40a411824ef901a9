//! Settings change events.
//!
//! Every successful save is broadcast so running components can pick up
//! the new values without a restart.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::settings::Settings;

/// Events broadcast after settings are saved.
#[derive(Debug, Clone)]
pub enum SettingsEvent {
    /// One of the `job.download` caps changed. Sent before [`SettingsEvent::Updated`].
    DownloadLimitsChanged {
        total_processing_cores: usize,
        max_parallel_downloads: usize,
    },
    /// The settings document was replaced.
    Updated(Arc<Settings>),
}

impl SettingsEvent {
    /// Get a description of the event for logging.
    pub fn description(&self) -> String {
        match self {
            Self::DownloadLimitsChanged {
                total_processing_cores,
                max_parallel_downloads,
            } => format!(
                "Download limits changed: cores={}, parallel_downloads={}",
                total_processing_cores, max_parallel_downloads
            ),
            Self::Updated(_) => "Settings updated".to_string(),
        }
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Fan-out of [`SettingsEvent`]s.
#[derive(Clone)]
pub struct SettingsEventBroadcaster {
    sender: broadcast::Sender<SettingsEvent>,
}

impl SettingsEventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of receivers that got the event.
    pub fn publish(&self, event: SettingsEvent) -> usize {
        tracing::debug!("Publishing settings event: {}", event.description());
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SettingsEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
