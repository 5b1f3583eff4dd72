//! Exponential backoff for retry logic
//!
//! Used by the reconnection controller (after failed attempts) and by the
//! scheduler (between transient-error retries). Jitter is optional; the
//! reconnection path runs without it so the schedule stays predictable.

use rand::Rng;
use std::time::Duration;

/// Configuration for exponential backoff
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
    /// Maximum number of retry attempts (None = unlimited)
    pub max_retries: Option<usize>,
    /// Randomization factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_retries: None,
            jitter_factor: 0.0,
        }
    }
}

impl BackoffConfig {
    /// Reconnection schedule: `base`, doubling per failure, capped at `max`
    pub fn reconnect(base: Duration, max: Duration) -> Self {
        Self {
            initial_delay: base,
            max_delay: max,
            ..Default::default()
        }
    }

    /// Short, bounded retries for transient operation failures
    pub fn transient(base: Duration, max_retries: u32) -> Self {
        Self {
            initial_delay: base,
            max_delay: base * 8,
            multiplier: 2.0,
            max_retries: Some(max_retries as usize),
            jitter_factor: 0.1,
        }
    }

    /// Delay for the `attempt`-th retry (0-based), before jitter
    ///
    /// Non-decreasing in `attempt` and flat once `max_delay` is reached.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}

/// Exponential backoff state machine
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_attempt: usize,
}

impl ExponentialBackoff {
    /// Create a new backoff with default configuration
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    /// Create a new backoff with custom configuration
    pub fn with_config(config: BackoffConfig) -> Self {
        Self {
            config,
            current_attempt: 0,
        }
    }

    /// Get the next delay duration and advance the backoff state
    ///
    /// Returns None if max retries exceeded
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }

        let base = self.config.delay_for_attempt(self.current_attempt as u32);
        self.current_attempt += 1;

        Some(self.apply_jitter(base))
    }

    /// Spread retries so many clients waking together do not stampede
    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor == 0.0 {
            return delay;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen::<f64>() * self.config.jitter_factor;
        let jitter_multiplier = 1.0 + (jitter - self.config.jitter_factor / 2.0);

        Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
    }

    /// Reset the backoff to initial state
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt_number(&self) -> usize {
        self.current_attempt
    }

    /// Check if more retries are available
    pub fn can_retry(&self) -> bool {
        match self.config.max_retries {
            Some(max) => self.current_attempt < max,
            None => true,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_basic() {
        let mut backoff = ExponentialBackoff::new();

        assert_eq!(backoff.attempt_number(), 0);
        assert!(backoff.can_retry());

        let delay1 = backoff.next_delay().unwrap();
        assert_eq!(backoff.attempt_number(), 1);

        let delay2 = backoff.next_delay().unwrap();
        assert_eq!(backoff.attempt_number(), 2);
        assert!(delay2 > delay1);
    }

    #[test]
    fn test_reconnect_schedule() {
        let mut backoff = ExponentialBackoff::with_config(BackoffConfig::reconnect(
            Duration::from_secs(5),
            Duration::from_secs(60),
        ));

        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60, 60]);
    }

    #[test]
    fn test_backoff_max_retries() {
        let config = BackoffConfig {
            max_retries: Some(3),
            ..Default::default()
        };
        let mut backoff = ExponentialBackoff::with_config(config);

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());

        assert!(backoff.next_delay().is_none());
        assert!(!backoff.can_retry());
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = ExponentialBackoff::new();

        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt_number(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt_number(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_transient_jitter_stays_bounded() {
        let config = BackoffConfig::transient(Duration::from_millis(100), 2);
        for _ in 0..50 {
            let mut backoff = ExponentialBackoff::with_config(config.clone());
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(95));
            assert!(delay <= Duration::from_millis(105));
        }
    }

    #[test]
    fn test_huge_attempt_numbers_saturate() {
        let config = BackoffConfig::reconnect(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(config.delay_for_attempt(10_000), Duration::from_secs(60));
    }
}
