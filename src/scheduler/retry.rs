//! Retry policy: exponential backoff with a cap

use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::domain::FailureKind;

/// What happens to a task after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    DeadLetter,
}

impl RetryDecision {
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RetryDecision::Retry { delay } => Some(*delay),
            RetryDecision::DeadLetter => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_secs: u64,
    max_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_secs: 30,
            max_secs: 600,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_secs: u64, max_secs: u64) -> Self {
        Self {
            base_secs,
            max_secs,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.retry_base_delay_secs, config.retry_max_delay_secs)
    }

    /// Delay before retry number `retry` (0-based): base * 2^retry, capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let secs = self
            .base_secs
            .saturating_mul(2u64.saturating_pow(retry))
            .min(self.max_secs);
        Duration::from_secs(secs)
    }

    /// Decide after a failure. `attempt_count` already includes the attempt
    /// that just failed.
    pub fn decide(&self, kind: FailureKind, attempt_count: u32, max_attempts: u32) -> RetryDecision {
        if !kind.is_retryable() || attempt_count >= max_attempts {
            return RetryDecision::DeadLetter;
        }
        RetryDecision::Retry {
            delay: self.backoff(attempt_count.saturating_sub(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..7).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 480, 600, 600]);
        assert_eq!(policy.backoff(u32::MAX).as_secs(), 600);
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(FailureKind::Transient, 1, 3),
            RetryDecision::Retry {
                delay: Duration::from_secs(30)
            }
        );
        assert_eq!(
            policy.decide(FailureKind::SoftTimeout, 2, 3).delay(),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            policy.decide(FailureKind::Transient, 3, 3),
            RetryDecision::DeadLetter
        );
        assert_eq!(
            policy.decide(FailureKind::Fatal, 1, 3),
            RetryDecision::DeadLetter
        );
    }
}
