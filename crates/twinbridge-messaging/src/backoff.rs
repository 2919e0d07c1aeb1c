//! Exponential backoff shared by publish-handle recreation and client
//! reconnection.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Tracks consecutive failures and yields the delay to wait before the
/// next attempt, doubling (or whatever the configured multiplier says)
/// until the cap is reached.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    config: BackoffConfig,
    attempt: u32,
    current_delay: Duration,
}

impl RetryBackoff {
    /// Creates a backoff at its initial delay.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            attempt: 0,
            current_delay: initial_delay,
        }
    }

    /// The number of attempts since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Resets the state after a successful attempt.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.config.initial_delay;
    }

    /// Returns the delay to wait before the next attempt and advances the
    /// state for the one after.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn next_backoff(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.current_delay;

        let next_ms =
            (self.current_delay.as_millis() as f64 * self.config.multiplier) as u64;
        self.current_delay = Duration::from_millis(next_ms).min(self.config.max_delay);

        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_doubles_each_attempt() {
        let mut backoff = RetryBackoff::new(config());
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn test_caps_at_max_delay() {
        let mut backoff = RetryBackoff::new(BackoffConfig {
            initial_delay: Duration::from_secs(20),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        });
        backoff.next_backoff(); // 20s
        assert_eq!(backoff.next_backoff(), Duration::from_secs(30));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(30));
    }

    #[test]
    fn test_reset_restores_initial_delay() {
        let mut backoff = RetryBackoff::new(config());
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
    }
}
