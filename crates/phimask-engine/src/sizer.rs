//! Adaptive batch sizing

use std::time::Duration;

use phimask_core::ConfigurationError;
use tracing::debug;

/// Picks the size of the next batch from recent write behaviour.
///
/// Halves (down to `min`) after a failed write or a write slower than the
/// target; grows by half (up to `max`) when writes finish in under half the
/// target.
#[derive(Debug, Clone)]
pub struct BatchSizer {
    current: usize,
    min: usize,
    max: usize,
    target_latency: Duration,
}

impl BatchSizer {
    pub fn new(
        initial: usize,
        min: usize,
        max: usize,
        target_latency: Duration,
    ) -> Result<Self, ConfigurationError> {
        if min == 0 {
            return Err(ConfigurationError::InvalidBatchSize(
                "min must be at least 1".to_string(),
            ));
        }
        if min > max {
            return Err(ConfigurationError::InvalidBatchSize(format!(
                "min ({}) exceeds max ({})",
                min, max
            )));
        }
        if initial < min || initial > max {
            return Err(ConfigurationError::InvalidBatchSize(format!(
                "initial ({}) must lie within [{}, {}]",
                initial, min, max
            )));
        }
        Ok(Self {
            current: initial,
            min,
            max,
            target_latency,
        })
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn record_success(&mut self, latency: Duration) {
        if latency > self.target_latency {
            self.shrink();
        } else if latency < self.target_latency / 2 {
            self.grow();
        }
    }

    pub fn record_failure(&mut self) {
        self.shrink();
    }

    fn shrink(&mut self) {
        let next = (self.current / 2).max(self.min);
        if next != self.current {
            debug!(from = self.current, to = next, "Shrinking batch size");
            self.current = next;
        }
    }

    fn grow(&mut self) {
        let next = (self.current * 3).div_ceil(2).min(self.max);
        if next != self.current {
            debug!(from = self.current, to = next, "Growing batch size");
            self.current = next;
        }
    }
}
