//! Retry policy for saga steps.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the next attempt after waiting this long.
    RetryAfter(Duration),
    /// No attempts left; the failure is terminal.
    Exhausted,
}

/// Exponential backoff configuration for a step's forward action.
///
/// All methods are pure functions of the policy and the attempt number, so
/// the same policy always yields the same schedule. Attempts are 1-based.
///
/// ```
/// use domain::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::transient();
/// assert_eq!(policy.backoff(1), Duration::from_secs(2));
/// assert_eq!(policy.backoff(2), Duration::from_secs(4));
/// assert_eq!(policy.backoff(10), Duration::from_secs(20));
/// assert!(policy.is_exhausted(6));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any single delay.
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Multiplier applied per attempt.
    pub backoff_coefficient: f64,

    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transient()
    }
}

impl RetryPolicy {
    /// Policy for transient collaborator failures.
    ///
    /// - 2 second initial interval
    /// - 20 second max interval
    /// - 2x backoff coefficient
    /// - 5 max attempts
    pub fn transient() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(20),
            backoff_coefficient: 2.0,
            max_attempts: 5,
        }
    }

    /// Policy that runs a single attempt.
    pub fn no_retry() -> Self {
        Self {
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            max_attempts: 1,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Delay to wait after attempt `attempt` failed.
    ///
    /// `min(initial_interval * coefficient^(attempt - 1), max_interval)`.
    /// Attempt 0 is treated as attempt 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Returns true if attempt number `attempt` may not run.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }

    /// Decides whether to retry after attempt `failed_attempt` failed.
    pub fn next_attempt(&self, failed_attempt: u32) -> RetryDecision {
        if self.is_exhausted(failed_attempt.saturating_add(1)) {
            RetryDecision::Exhausted
        } else {
            RetryDecision::RetryAfter(self.backoff(failed_attempt))
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
