//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for step retries
///
/// Supports exponential backoff with optional jitter to avoid thundering
/// herd when many executions retry the same dependency.
///
/// # Example
///
/// ```
/// use restep::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_max_attempts(5)
///     .with_backoff(Duration::from_millis(250));
///
/// // First retry after 250ms, second after 500ms, third after 1s, ...
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Base delay before the first retry
    #[serde(with = "duration_millis")]
    pub backoff: Duration,

    /// Double the delay after each failed attempt
    pub exponential_backoff: bool,

    /// Ceiling on the delay between retries
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(1000),
            exponential_backoff: true,
            max_backoff: Duration::from_millis(30_000),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Create a policy with fixed intervals (no exponential growth)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: interval,
            exponential_backoff: false,
            max_backoff: interval,
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the base backoff delay
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the backoff ceiling
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Enable or disable exponential growth
    pub fn with_exponential_backoff(mut self, exponential: bool) -> Self {
        self.exponential_backoff = exponential;
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after failed attempt `n` (1-based) before retrying
    ///
    /// `backoff(n) = exponential ? min(backoff * 2^(n-1), max_backoff) : backoff`
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = if self.exponential_backoff {
            let exp = attempt.saturating_sub(1).min(31);
            let grown = self.backoff.as_secs_f64() * 2f64.powi(exp as i32);
            grown.min(self.max_backoff.as_secs_f64())
        } else {
            self.backoff.as_secs_f64()
        };

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = base * self.jitter;
            let offset = rng.gen_range(-range..=range);
            (base + offset).max(0.0)
        } else {
            base
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check whether another attempt is allowed after attempt `current`
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
