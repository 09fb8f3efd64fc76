//! Retry policy for failed fetch attempts.
//!
//! Decode errors (usually a truncated body) and timeouts are worth another
//! attempt on a fresh connection. HTTP and connection failures are not retried
//! within a run; they feed the ban list instead.

use std::time::Duration;

use crate::config::FetchConfig;
use crate::types::ErrorKind;

/// Calculate exponential backoff duration for a given attempt.
///
/// Uses `base_delay * 2^attempt` with a cap at 30 seconds.
pub fn backoff_duration(attempt: u32, base_delay_ms: u64) -> Duration {
    let delay = base_delay_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(delay.min(30_000))
}

/// Retries used so far by one fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryBudget {
    pub decode: u32,
    pub timeout: u32,
}

impl RetryBudget {
    pub fn total(&self) -> u32 {
        self.decode + self.timeout
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_timeout: Duration,
    pub decode_retries: u32,
    pub timeout_retries: u32,
    pub timeout_backoff_factor: u32,
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&FetchConfig::default())
    }
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(config: &FetchConfig) -> Self {
        Self {
            base_timeout: Duration::from_millis(config.timeout_ms),
            decode_retries: config.decode_retries,
            timeout_retries: config.timeout_retries,
            timeout_backoff_factor: config.timeout_backoff_factor.max(1),
            retry_delay_ms: config.retry_delay_ms,
        }
    }
}

impl RetryPolicy {
    /// Deadline for the next attempt: each timeout retry stretches it.
    pub fn deadline(&self, used: &RetryBudget) -> Duration {
        let factor = self.timeout_backoff_factor.saturating_pow(used.timeout);
        self.base_timeout.saturating_mul(factor)
    }

    /// Consume one retry for `kind` if the budget allows it.
    pub fn try_consume(&self, kind: ErrorKind, used: &mut RetryBudget) -> bool {
        match kind {
            ErrorKind::DecodeError if used.decode < self.decode_retries => {
                used.decode += 1;
                true
            }
            ErrorKind::Timeout if used.timeout < self.timeout_retries => {
                used.timeout += 1;
                true
            }
            _ => false,
        }
    }

    /// Pause before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        if self.retry_delay_ms == 0 {
            return Duration::ZERO;
        }
        backoff_duration(retry.saturating_sub(1), self.retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_decode_and_timeout_consume_retries() {
        let policy = RetryPolicy {
            decode_retries: 5,
            timeout_retries: 5,
            ..RetryPolicy::default()
        };
        let mut used = RetryBudget::default();
        for kind in [
            ErrorKind::HttpStatus(404),
            ErrorKind::ConnectionFailure,
            ErrorKind::BanListedSkip,
        ] {
            assert!(!policy.try_consume(kind, &mut used), "{kind:?}");
        }
        assert_eq!(used.total(), 0);
        assert!(policy.try_consume(ErrorKind::DecodeError, &mut used));
        assert!(policy.try_consume(ErrorKind::Timeout, &mut used));
    }

    #[test]
    fn test_default_policy_retries_decode_once() {
        let policy = RetryPolicy::default();
        let mut used = RetryBudget::default();
        assert!(policy.try_consume(ErrorKind::DecodeError, &mut used));
        assert!(!policy.try_consume(ErrorKind::DecodeError, &mut used));
        assert!(!policy.try_consume(ErrorKind::Timeout, &mut used));
        assert_eq!(used.total(), 1);
    }

    #[test]
    fn test_timeout_retries_stretch_deadline() {
        let policy = RetryPolicy {
            base_timeout: Duration::from_millis(100),
            timeout_retries: 2,
            timeout_backoff_factor: 3,
            ..RetryPolicy::default()
        };
        let mut used = RetryBudget::default();
        assert_eq!(policy.deadline(&used), Duration::from_millis(100));
        assert!(policy.try_consume(ErrorKind::Timeout, &mut used));
        assert_eq!(policy.deadline(&used), Duration::from_millis(300));
        assert!(policy.try_consume(ErrorKind::Timeout, &mut used));
        assert_eq!(policy.deadline(&used), Duration::from_millis(900));
        assert!(!policy.try_consume(ErrorKind::Timeout, &mut used));
    }

    #[test]
    fn test_backoff_exponential() {
        assert_eq!(backoff_duration(0, 1000), Duration::from_millis(1000));
        assert_eq!(backoff_duration(1, 1000), Duration::from_millis(2000));
        assert_eq!(backoff_duration(3, 1000), Duration::from_millis(8000));
    }

    #[test]
    fn test_backoff_capped_at_30s() {
        assert_eq!(backoff_duration(10, 1000), Duration::from_millis(30_000));
    }

    #[test]
    fn test_zero_delay_disables_backoff() {
        let policy = RetryPolicy {
            retry_delay_ms: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(3), Duration::ZERO);
    }
}
