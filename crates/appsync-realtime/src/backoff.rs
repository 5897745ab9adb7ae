//! Retry Policy
//!
//! Exponential backoff with jitter, shared by connection establishment and
//! subscription starts. Each retryable operation runs every attempt under
//! [`RetryConfig::attempt_timeout`] and draws its inter-attempt delay from
//! [`RetryPolicy::next_delay`]:
//!
//! ```text
//! delay = random(base, min(base^attempt, cap))
//! ```
//!
//! where `base` and `cap` are in milliseconds and `attempt` counts completed
//! failures. A policy permits `max_attempts` attempts in total.

use std::time::Duration;

use rand::Rng;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay; also the minimum of every jitter window.
    pub base: Duration,
    /// Upper bound on any delay.
    pub cap: Duration,
    /// Timeout applied to each individual attempt.
    pub attempt_timeout: Duration,
    /// Total number of attempts permitted (first attempt included).
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(2000),
            attempt_timeout: Duration::from_millis(5000),
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(
        base: Duration,
        cap: Duration,
        attempt_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            base,
            cap,
            attempt_timeout,
            max_attempts,
        }
    }

    /// Override the total attempt count.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Override the per-attempt timeout.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }
}

/// Tracks attempts for one retryable operation.
///
/// # Example
///
/// ```rust
/// use appsync_realtime::RetryConfig;
/// use appsync_realtime::RetryPolicy;
///
/// let mut policy = RetryPolicy::new(RetryConfig::default());
///
/// // After a failed first attempt:
/// let delay = policy.next_delay();
/// assert!(delay.is_some());
/// ```
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempt: u32,
}

impl RetryPolicy {
    /// Create a policy with the first attempt considered underway.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 1 }
    }

    /// Delay before the next attempt, or `None` once the attempt budget is
    /// spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }

        let exponent = self.attempt;
        self.attempt += 1;

        #[allow(clippy::cast_precision_loss)]
        let base = self.config.base.as_millis() as f64;
        #[allow(clippy::cast_precision_loss)]
        let cap = self.config.cap.as_millis() as f64;
        #[allow(clippy::cast_possible_wrap)]
        let ceiling = base.powi(exponent as i32).min(cap);

        let millis = if ceiling > base {
            rand::rng().random_range(base..=ceiling)
        } else {
            base
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(Duration::from_millis(millis as u64))
    }

    /// Number of the attempt currently underway (1-based).
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}
