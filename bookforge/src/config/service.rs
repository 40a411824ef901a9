//! Settings service.
//!
//! Holds the current [`Settings`], persists updates and broadcasts a
//! [`SettingsEvent`] after each successful save.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast};
use tracing::info;

use super::events::{SettingsEvent, SettingsEventBroadcaster};
use super::settings::Settings;
use crate::Result;

struct Inner {
    path: Option<PathBuf>,
    current: RwLock<Arc<Settings>>,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
    broadcaster: SettingsEventBroadcaster,
}

/// Shared handle to the application settings.
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<Inner>,
}

impl SettingsStore {
    /// Load settings from `path`. Updates are written back to the same file.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = Settings::load(&path).await;
        info!(path = %path.display(), "Settings loaded");
        Self::build(Some(path), settings)
    }

    /// Settings that are never written to disk.
    pub fn in_memory(settings: Settings) -> Self {
        Self::build(None, settings)
    }

    fn build(path: Option<PathBuf>, settings: Settings) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                current: RwLock::new(Arc::new(settings)),
                write_lock: Mutex::new(()),
                broadcaster: SettingsEventBroadcaster::new(),
            }),
        }
    }

    pub fn current(&self) -> Arc<Settings> {
        self.inner.current.read().clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsEvent> {
        self.inner.broadcaster.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.broadcaster.subscriber_count()
    }

    /// Apply `change` to a copy of the current settings, validate and save
    /// it, then make it current. Nothing changes if validation or the save
    /// fails.
    pub async fn update<F>(&self, change: F) -> Result<Arc<Settings>>
    where
        F: FnOnce(&mut Settings),
    {
        let _guard = self.inner.write_lock.lock().await;

        let previous = self.current();
        let mut next = (*previous).clone();
        change(&mut next);
        next.validate()?;

        if let Some(path) = &self.inner.path {
            next.save(path).await?;
        }

        let next = Arc::new(next);
        *self.inner.current.write() = next.clone();

        let limits = next.job.download;
        if limits != previous.job.download {
            info!(
                cores = limits.total_processing_cores,
                downloads = limits.max_parallel_downloads,
                "Download limits changed"
            );
            self.inner
                .broadcaster
                .publish(SettingsEvent::DownloadLimitsChanged {
                    total_processing_cores: limits.total_processing_cores,
                    max_parallel_downloads: limits.max_parallel_downloads,
                });
        }
        self.inner
            .broadcaster
            .publish(SettingsEvent::Updated(next.clone()));

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn test_update_persists_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path).await;
        let mut rx = store.subscribe();

        store
            .update(|s| s.job.download.max_parallel_downloads = 5)
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            SettingsEvent::DownloadLimitsChanged {
                total_processing_cores: 2,
                max_parallel_downloads: 5,
            }
        ));
        assert!(matches!(rx.recv().await.unwrap(), SettingsEvent::Updated(_)));

        let reopened = SettingsStore::open(&path).await;
        assert_eq!(reopened.current().job.download.max_parallel_downloads, 5);
    }

    #[tokio::test]
    async fn test_update_without_limit_change() {
        let store = SettingsStore::in_memory(Settings::default());
        let mut rx = store.subscribe();

        store.update(|s| s.job.allow_concurrent_jobs = true).await.unwrap();

        match rx.recv().await.unwrap() {
            SettingsEvent::Updated(settings) => assert!(settings.job.allow_concurrent_jobs),
            other => panic!("unexpected event: {}", other.description()),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_update_is_rejected() {
        let store = SettingsStore::in_memory(Settings::default());
        let mut rx = store.subscribe();

        let err = store
            .update(|s| s.job.download.total_processing_cores = 0)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(store.current().job.download.total_processing_cores, 2);
        assert!(rx.try_recv().is_err());
    }
}
