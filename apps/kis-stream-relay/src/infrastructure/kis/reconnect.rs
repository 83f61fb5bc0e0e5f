//! Reconnection Backoff
//!
//! Exponential backoff with jitter between upstream sessions. The feed
//! retries forever, so there is no attempt limit; the delay is capped and
//! reset once a session reaches streaming.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::WebSocketSettings;

/// Backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
    /// Random spread as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl From<&WebSocketSettings> for ReconnectConfig {
    fn from(settings: &WebSocketSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            ..Self::default()
        }
    }
}

/// Backoff state for one feed client.
///
/// ```rust
/// use kis_stream_relay::infrastructure::kis::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig {
///     jitter_factor: 0.0,
///     ..ReconnectConfig::default()
/// });
/// assert_eq!(policy.next_delay(), Duration::from_secs(1));
/// assert_eq!(policy.next_delay(), Duration::from_secs(2));
/// policy.reset();
/// assert_eq!(policy.next_delay(), Duration::from_secs(1));
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    base_delay: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a policy at its initial delay.
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        let base_delay = config.initial_delay.min(config.max_delay);
        Self {
            config,
            base_delay,
            attempts: 0,
        }
    }

    /// Delay before the next attempt. Grows the base delay for the one after.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let delay = jittered(self.base_delay, self.config.jitter_factor).min(self.config.max_delay);
        self.base_delay = self.grow(self.base_delay);
        delay
    }

    /// Return to the initial delay after a healthy session.
    pub fn reset(&mut self) {
        self.base_delay = self.config.initial_delay.min(self.config.max_delay);
        self.attempts = 0;
    }

    /// Failed attempts since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    fn grow(&self, delay: Duration) -> Duration {
        let multiplier = if self.config.multiplier.is_finite() {
            self.config.multiplier.max(1.0)
        } else {
            1.0
        };
        Duration::try_from_secs_f64(delay.as_secs_f64() * multiplier)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }
}

fn jittered(delay: Duration, factor: f64) -> Duration {
    if factor.is_nan() || factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    let spread = delay.as_secs_f64() * factor.min(1.0);
    let offset: f64 = rand::rng().random_range(-spread..=spread);
    Duration::try_from_secs_f64((delay.as_secs_f64() + offset).max(0.001)).unwrap_or(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(initial_ms: u64, max_ms: u64, multiplier: f64) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter_factor: 0.0,
        })
    }

    #[test]
    fn delays_double_until_cap() {
        let mut policy = exact(1_000, 30_000, 2.0);
        let delays: Vec<u128> = (0..7).map(|_| policy.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
        assert_eq!(policy.attempt_count(), 7);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut policy = exact(100, 10_000, 3.0);
        policy.next_delay();
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn never_gives_up() {
        let mut policy = exact(1, 5, 2.0);
        for _ in 0..10_000 {
            assert!(policy.next_delay() <= Duration::from_millis(5));
        }
    }

    #[test]
    fn multiplier_below_one_does_not_shrink() {
        let mut policy = exact(500, 1_000, 0.5);
        assert_eq!(policy.next_delay(), Duration::from_millis(500));
        assert_eq!(policy.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..200 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(1_000),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter_factor: 0.1,
            });
            let millis = policy.next_delay().as_millis();
            assert!((900..=1_100).contains(&millis), "delay {millis}ms out of range");
        }
    }

    #[test]
    fn built_from_settings() {
        let config = ReconnectConfig::from(&WebSocketSettings::default());
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
    }
}
