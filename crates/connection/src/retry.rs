//! Auto-retry policy.

use settings::constants;
use settings::ConnectionSettings;
use std::time::Duration;

use crate::error::{ConnectionError, RetryStrategy};

/// Exponential backoff: `base * min(2^attempt, 4)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 1u32
        .checked_shl(attempt)
        .unwrap_or(u32::MAX)
        .min(constants::retry::MAX_BACKOFF_MULTIPLIER);
    base.saturating_mul(multiplier)
}

/// Outcome of asking whether a retry should be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Schedule(Duration),
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyPending,
    AttemptsExhausted,
    Offline,
    NotAutoRetryable,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SkipReason::AlreadyPending => "retry already pending",
            SkipReason::AttemptsExhausted => "retry attempts exhausted",
            SkipReason::Offline => "network offline",
            SkipReason::NotAutoRetryable => "error is not auto-retryable",
        };
        f.write_str(text)
    }
}

/// Decides whether and when a failed connection is retried automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub network_restored_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: constants::retry::MAX_ATTEMPTS,
            network_restored_delay: constants::retry::NETWORK_RESTORED_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            max_attempts: settings.max_retry_attempts,
            network_restored_delay: settings.network_restored_delay(),
        }
    }

    /// Delay before retry `attempt` (0-based), or `None` for errors that are
    /// never retried on a timer.
    pub fn delay_for(
        &self,
        error: &ConnectionError,
        attempt: u32,
        online: bool,
    ) -> Option<Duration> {
        let base = error.retry_after()?;
        match error.retry_strategy() {
            RetryStrategy::NoRetry => None,
            RetryStrategy::FixedDelay => Some(base),
            RetryStrategy::ExponentialBackoff => Some(backoff_delay(base, attempt)),
            RetryStrategy::WaitForNetwork if online => Some(self.network_restored_delay),
            RetryStrategy::WaitForNetwork => Some(base),
        }
    }

    /// Apply the auto-retry guard.
    pub fn decide(
        &self,
        error: &ConnectionError,
        retry_count: u32,
        online: bool,
        timer_pending: bool,
    ) -> RetryDecision {
        if timer_pending {
            return RetryDecision::Skip(SkipReason::AlreadyPending);
        }
        if retry_count >= self.max_attempts {
            return RetryDecision::Skip(SkipReason::AttemptsExhausted);
        }
        if !online {
            return RetryDecision::Skip(SkipReason::Offline);
        }
        if !error.should_auto_retry() {
            return RetryDecision::Skip(SkipReason::NotAutoRetryable);
        }
        match self.delay_for(error, retry_count, online) {
            Some(delay) => RetryDecision::Schedule(delay),
            None => RetryDecision::Skip(SkipReason::NotAutoRetryable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;
    use test_case::test_case;

    fn err(kind: ErrorKind) -> ConnectionError {
        ConnectionError::new(kind, "")
    }

    // ==================== Backoff Tests ====================

    #[test_case(0, 10 ; "first attempt")]
    #[test_case(1, 20 ; "second attempt")]
    #[test_case(2, 40 ; "third attempt capped at x4")]
    #[test_case(3, 40 ; "stays capped")]
    #[test_case(40, 40 ; "huge attempt does not overflow")]
    fn backoff_values(attempt: u32, expected_secs: u64) {
        assert_eq!(
            backoff_delay(Duration::from_secs(10), attempt),
            Duration::from_secs(expected_secs)
        );
    }

    proptest! {
        #[test]
        fn backoff_matches_formula(base_ms in 1u64..100_000, attempt in 0u32..64) {
            let base = Duration::from_millis(base_ms);
            let multiplier = if attempt >= 2 { 4 } else { 1u32 << attempt };
            prop_assert_eq!(backoff_delay(base, attempt), base * multiplier);
        }
    }

    // ==================== Policy Tests ====================

    #[test]
    fn host_unreachable_first_retry_is_ten_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&err(ErrorKind::HostUnreachable), 0, true, false),
            RetryDecision::Schedule(Duration::from_secs(10))
        );
    }

    #[test]
    fn wait_for_network_uses_short_delay_when_online() {
        let policy = RetryPolicy::default();
        let e = err(ErrorKind::NetworkUnreachable);
        assert_eq!(policy.delay_for(&e, 0, true), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(&e, 0, false), Some(Duration::from_secs(5)));
    }

    #[test]
    fn fixed_delay_ignores_attempt() {
        let policy = RetryPolicy::default();
        let e = err(ErrorKind::ResourceUnavailable);
        assert_eq!(policy.delay_for(&e, 0, true), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for(&e, 2, true), Some(Duration::from_secs(5)));
    }

    #[test]
    fn guard_order() {
        let policy = RetryPolicy::default();
        let e = err(ErrorKind::PortClosed);
        assert_eq!(
            policy.decide(&e, 0, true, true),
            RetryDecision::Skip(SkipReason::AlreadyPending)
        );
        assert_eq!(
            policy.decide(&e, 3, true, false),
            RetryDecision::Skip(SkipReason::AttemptsExhausted)
        );
        assert_eq!(
            policy.decide(&e, 0, false, false),
            RetryDecision::Skip(SkipReason::Offline)
        );
    }

    #[test_case(ErrorKind::AuthenticationFailed ; "auth")]
    #[test_case(ErrorKind::ResourceUnavailable ; "resource is manual only")]
    #[test_case(ErrorKind::Unknown ; "unknown is manual only")]
    #[test_case(ErrorKind::Cancelled ; "cancelled")]
    fn never_auto_retried(kind: ErrorKind) {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&err(kind), 0, true, false),
            RetryDecision::Skip(SkipReason::NotAutoRetryable)
        );
    }

    #[test]
    fn from_settings_copies_values() {
        let settings = ConnectionSettings {
            max_retry_attempts: 5,
            network_restored_delay_secs: 1,
            ..ConnectionSettings::default()
        };
        let policy = RetryPolicy::from_settings(&settings);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.network_restored_delay, Duration::from_secs(1));
    }
}
