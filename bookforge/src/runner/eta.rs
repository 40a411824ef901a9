//! Conversion time estimates from recent history.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// Number of recent conversions kept for averaging.
pub const HISTORY_LENGTH: usize = 30;

/// Seconds of processing per minute of audio assumed without history.
pub const DEFAULT_SECS_PER_MINUTE: f64 = 10.0;

/// Rolling average of seconds spent per minute of runtime.
#[derive(Debug, Default)]
pub struct EtaEstimator {
    rates: Mutex<VecDeque<f64>>,
}

impl EtaEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished conversion. Zero runtimes or durations are ignored.
    pub fn record(&self, runtime_min: u32, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if runtime_min == 0 || secs <= 0.0 {
            return;
        }
        let rate = secs / runtime_min as f64;
        let mut rates = self.rates.lock();
        if rates.len() == HISTORY_LENGTH {
            rates.pop_front();
        }
        rates.push_back(rate);
        debug!(rate = format!("{rate:.2}"), "Recorded conversion rate (sec/min)");
    }

    pub fn secs_per_minute(&self) -> f64 {
        let rates = self.rates.lock();
        if rates.is_empty() {
            DEFAULT_SECS_PER_MINUTE
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        }
    }

    /// Estimated conversion time in whole seconds; 0 for an unknown runtime.
    pub fn estimate_secs(&self, runtime_min: u32) -> u64 {
        if runtime_min == 0 {
            return 0;
        }
        (runtime_min as f64 * self.secs_per_minute()) as u64
    }

    pub fn samples(&self) -> usize {
        self.rates.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rate_without_history() {
        let eta = EtaEstimator::new();
        assert_eq!(eta.estimate_secs(60), 600);
        assert_eq!(eta.estimate_secs(0), 0);
    }

    #[test]
    fn test_average_of_recorded_rates() {
        let eta = EtaEstimator::new();
        eta.record(10, Duration::from_secs(20));
        eta.record(10, Duration::from_secs(40));
        eta.record(0, Duration::from_secs(500));
        assert_eq!(eta.samples(), 2);
        assert_eq!(eta.estimate_secs(100), 300);
    }

    #[test]
    fn test_history_is_bounded() {
        let eta = EtaEstimator::new();
        eta.record(1, Duration::from_secs(1000));
        for _ in 0..HISTORY_LENGTH {
            eta.record(1, Duration::from_secs(2));
        }
        assert_eq!(eta.samples(), HISTORY_LENGTH);
        assert_eq!(eta.estimate_secs(10), 20);
    }
}
