use std::time::Duration;

use crate::config::RuntimeConfig;

/// How to proceed after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { delay: Duration },
    Fail,
}

/// Bounded, capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    /// Invocation retry budget for 5xx responses.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.max_retries, config.retry_min_delay, config.retry_max_delay)
    }

    /// Policy for manifest fetches: `attempts` total tries.
    pub fn for_discovery(config: &RuntimeConfig) -> Self {
        Self::new(
            config.discovery_max_attempts.saturating_sub(1),
            config.retry_min_delay,
            config.retry_max_delay,
        )
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (0-based); a server hint wins but is still capped.
    pub fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let base = self.min_delay.saturating_mul(factor);
        retry_after.unwrap_or(base).min(self.max_delay)
    }

    /// `attempt` is the 0-based index of the attempt that just failed.
    pub fn decide(&self, attempt: u32, retryable: bool, retry_after: Option<Duration>) -> Decision {
        if retryable && attempt < self.max_retries {
            Decision::Retry {
                delay: self.backoff_delay(attempt, retry_after),
            }
        } else {
            Decision::Fail
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}
