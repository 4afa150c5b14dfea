//! Reconnect Backoff
//!
//! Exponential backoff with symmetric jitter for failed reconnect handshakes.
//! The n-th delay is `min(initial * multiplier^n, max)`, then jittered.

use std::time::Duration;

use rand::Rng;

/// Backoff tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay, before jitter.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = up to 10% either way).
    pub jitter_factor: f64,
    /// Retries allowed before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

/// Stateful backoff for one reconnect episode.
///
/// ```rust
/// use brokerage_stream::infrastructure::stream::backoff::{Backoff, BackoffConfig};
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(BackoffConfig {
///     jitter_factor: 0.0,
///     ..BackoffConfig::default()
/// });
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    /// Start a fresh episode.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay to wait before the next retry, or `None` once retries are spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        let base = self.base_delay(self.attempts);
        self.attempts += 1;
        Some(self.jitter(base))
    }

    /// Retries handed out so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the attempt cap has been reached.
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.config.multiplier.max(1.0).powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let scaled_ms = (self.config.initial_delay.as_millis() as f64 * factor).round();
        #[allow(clippy::cast_precision_loss)]
        let max_ms = self.config.max_delay.as_millis() as f64;
        if !scaled_ms.is_finite() || scaled_ms >= max_ms {
            return self.config.max_delay;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = scaled_ms.max(0.0) as u64;
        Duration::from_millis(millis)
    }

    fn jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.001))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial_ms: u64, max_ms: u64, multiplier: f64, max_attempts: u32) -> Backoff {
        Backoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter_factor: 0.0,
            max_attempts,
        })
    }

    #[test]
    fn delays_grow_geometrically() {
        let mut backoff = no_jitter(100, 10_000, 3.0, 0);
        let delays: Vec<_> = (0..4).filter_map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(300),
                Duration::from_millis(900),
                Duration::from_millis(2700),
            ]
        );
    }

    #[test]
    fn delays_are_capped() {
        let mut backoff = no_jitter(1_000, 1_500, 2.0, 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1_000)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1_500)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1_500)));
    }

    #[test]
    fn attempt_cap_is_enforced() {
        let mut backoff = no_jitter(10, 100, 2.0, 2);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.exhausted());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 2);
    }

    #[test]
    fn jitter_stays_in_band() {
        for _ in 0..200 {
            let mut backoff = Backoff::new(BackoffConfig {
                initial_delay: Duration::from_millis(1_000),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter_factor: 0.2,
                max_attempts: 0,
            });
            let millis = backoff.next_delay().unwrap().as_millis();
            assert!((800..=1_200).contains(&millis), "{millis}ms outside jitter band");
        }
    }

    #[test]
    fn default_policy_retries_forever() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for _ in 0..1_000 {
            assert!(backoff.next_delay().is_some());
        }
        assert!(!backoff.exhausted());
    }

    #[test]
    fn unlimited_never_exhausts() {
        let mut backoff = no_jitter(1, 2, 2.0, 0);
        for _ in 0..10_000 {
            assert!(backoff.next_delay().is_some());
        }
    }
}
