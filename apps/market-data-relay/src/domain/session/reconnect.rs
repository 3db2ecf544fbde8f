//! Reconnection Policy
//!
//! Exponential backoff for the upstream connection. The delay for a given
//! attempt count is `min(initial * multiplier^attempts, max)`. There is no
//! jitter and no attempt limit: the relay retries forever and the delay
//! never decreases until the counter is reset by a successful open.

use std::time::Duration;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
        }
    }
}

/// Stateless backoff calculator. The attempt counter lives in the session.
///
/// # Example
///
/// ```rust
/// use market_data_relay::domain::session::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let policy = ReconnectPolicy::new(ReconnectConfig::new(
///     Duration::from_millis(100),
///     Duration::from_secs(1),
///     2.0,
/// ));
///
/// assert_eq!(policy.delay(0), Duration::from_millis(100));
/// assert_eq!(policy.delay(3), Duration::from_millis(800));
/// assert_eq!(policy.delay(10), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Delay before the reconnect that follows `attempts` earlier ones.
    #[must_use]
    pub fn delay(&self, attempts: u32) -> Duration {
        let max_millis = self.config.max_delay.as_millis();
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.config.initial_delay.as_millis() as f64
            * self.config.multiplier.powi(exponent))
        .round();

        let millis = if !scaled.is_finite() {
            max_millis
        } else if scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                (scaled as u128).min(max_millis)
            }
        } else {
            0
        };

        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}
