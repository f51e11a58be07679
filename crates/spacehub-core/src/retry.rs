//! Bounded retry with exponential backoff and jitter.

use std::time::Duration;

use crate::SourceError;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    /// `base * factor^attempt`, capped at `max`, optionally with +/- 50% jitter.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(150),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let seconds = (base.as_secs_f64() * factor.powi(exponent)).min(max.as_secs_f64());
                let delay = Duration::from_secs_f64(seconds.max(0.0));

                if !jitter {
                    return delay;
                }

                let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                let spread = millis / 2;
                let offset = fastrand::u64(0..=spread.saturating_mul(2));
                Duration::from_millis(millis.saturating_sub(spread).saturating_add(offset))
            }
        }
    }
}

/// Retry policy applied by the aggregator to retry-eligible failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether a failure on attempt `attempt` (0-based) should be retried.
    pub fn should_retry(&self, error: &SourceError, attempt: u32) -> bool {
        error.retryable() && attempt < self.max_retries
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}
