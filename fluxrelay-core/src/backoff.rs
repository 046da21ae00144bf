//! Exponential back-off for background retries

use crate::config::{RETRY_INITIAL_BACKOFF, RETRY_MAX_BACKOFF};
use std::time::Duration;

/// Back-off parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub init: Duration,
    /// Upper bound on any delay
    pub max: Duration,
    /// Growth factor per failure
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init: RETRY_INITIAL_BACKOFF,
            max: RETRY_MAX_BACKOFF,
            base: 2.0,
        }
    }
}

/// Delay sequence for consecutive failures of one operation
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            next: config.init,
        }
    }

    /// Delay before the next attempt; grows until `max`
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.mul_f64(self.config.base).min(self.config.max);
        delay
    }

    /// Back to the initial delay after a success
    pub fn reset(&mut self) {
        self.next = self.config.init;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_to_max() {
        let mut backoff = Backoff::new(BackoffConfig {
            init: Duration::from_millis(100),
            max: Duration::from_millis(350),
            base: 2.0,
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
