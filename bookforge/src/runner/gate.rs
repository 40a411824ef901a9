//! PREPARE admission cap (`max_parallel_downloads`).
//!
//! Independent of the worker pool capacity: a book holds a [`DownloadPermit`]
//! from the moment its PREPARE task is submitted until that task reports back.
//! The gate is shared by every job of a coordinator.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::info;

use crate::{Error, Result};

#[derive(Debug)]
struct GateState {
    limit: usize,
    in_flight: usize,
    peak: usize,
}

/// Counter of in-flight PREPARE tasks with a live-adjustable limit.
#[derive(Debug)]
pub struct DownloadGate {
    state: Mutex<GateState>,
    /// Bumped whenever a permit is released or the limit changes.
    changed: watch::Sender<u64>,
}

impl DownloadGate {
    pub fn new(limit: usize) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            state: Mutex::new(GateState {
                limit: limit.max(1),
                in_flight: 0,
                peak: 0,
            }),
            changed,
        }
    }

    /// Take a download slot if one is free.
    pub fn try_acquire(self: &Arc<Self>) -> Option<DownloadPermit> {
        let mut state = self.state.lock();
        if state.in_flight >= state.limit {
            return None;
        }
        state.in_flight += 1;
        state.peak = state.peak.max(state.in_flight);
        Some(DownloadPermit {
            gate: Arc::clone(self),
        })
    }

    /// Change the limit. Permits already handed out stay valid.
    pub fn set_limit(&self, limit: usize) -> Result<()> {
        if limit == 0 {
            return Err(Error::invalid_input(
                "max_parallel_downloads must be at least 1",
            ));
        }
        let previous = std::mem::replace(&mut self.state.lock().limit, limit);
        if previous != limit {
            info!(from = previous, to = limit, "Download limit changed");
        }
        self.bump();
        Ok(())
    }

    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Highest number of simultaneous permits observed.
    pub fn peak(&self) -> usize {
        self.state.lock().peak
    }

    /// Receiver that wakes whenever a slot may have become available.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.bump();
    }

    fn bump(&self) {
        self.changed.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

/// One in-flight PREPARE. Releases its slot on drop.
#[derive(Debug)]
pub struct DownloadPermit {
    gate: Arc<DownloadGate>,
}

impl Drop for DownloadPermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_bounds_permits() {
        let gate = Arc::new(DownloadGate::new(2));
        let a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.in_flight(), 2);

        drop(a);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_acquire().is_some());
        assert_eq!(gate.peak(), 2);
    }

    #[test]
    fn test_lowering_limit_keeps_existing_permits() {
        let gate = Arc::new(DownloadGate::new(3));
        let permits: Vec<_> = (0..3).map(|_| gate.try_acquire().unwrap()).collect();
        gate.set_limit(1).unwrap();
        assert_eq!(gate.in_flight(), 3);

        let mut permits = permits.into_iter();
        drop(permits.next());
        drop(permits.next());
        // Two left, limit 1.
        assert!(gate.try_acquire().is_none());
        drop(permits.next());
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let gate = DownloadGate::new(2);
        assert!(gate.set_limit(0).unwrap_err().is_invalid_input());
        assert_eq!(gate.limit(), 2);
    }

    #[tokio::test]
    async fn test_release_wakes_watchers() {
        let gate = Arc::new(DownloadGate::new(1));
        let mut rx = gate.watch();
        let permit = gate.try_acquire().unwrap();

        let waiter = tokio::spawn(async move { rx.changed().await.is_ok() });
        drop(permit);
        assert!(waiter.await.unwrap());
    }
}
