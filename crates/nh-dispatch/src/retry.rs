//! Retry classification and backoff schedule.
//!
//! Retryability is decided by `ErrorKind` alone (adapters classify at
//! the edge). Attempt `k` (0-indexed) waits
//! `min(base * 2^k + jitter, max)` with `jitter ∈ [0, base/2)`; a
//! rate-limit error with a provider hint waits at least `retry_after`.

use std::time::Duration;

use nh_common::{ErrorKind, NotifyError, RetryPolicy};
use rand::Rng;

/// Whether a failed attempt should be re-enqueued.
pub fn should_retry(error: &NotifyError, attempt: u32, policy: &RetryPolicy) -> bool {
    error.retryable() && attempt < policy.max_retries
}

/// Delay before re-enqueueing attempt `attempt + 1`.
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32, error: &NotifyError) -> Duration {
    // 2^attempt with the exponent clamped so the multiply cannot wrap;
    // anything past the clamp saturates at `max` anyway.
    let factor = 1u32 << attempt.min(20);
    let exp = policy
        .base
        .checked_mul(factor)
        .unwrap_or(policy.max)
        .min(policy.max);

    let half_base_ms = (policy.base.as_millis() as u64) / 2;
    let jitter = if half_base_ms > 0 {
        Duration::from_millis(rand::thread_rng().gen_range(0..half_base_ms))
    } else {
        Duration::ZERO
    };

    let mut delay = exp.saturating_add(jitter).min(policy.max);

    if error.kind == ErrorKind::RateLimitExceeded {
        if let Some(retry_after) = error.retry_after {
            delay = delay.max(retry_after);
        }
    }

    delay
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn retry_stops_at_max_retries() {
        let p = policy(2, 10, 1000);
        let err = NotifyError::new(ErrorKind::NetworkTimeout, "timed out");
        assert!(should_retry(&err, 0, &p));
        assert!(should_retry(&err, 1, &p));
        assert!(!should_retry(&err, 2, &p));
    }

    #[test]
    fn non_retryable_kinds_never_retry() {
        let p = policy(3, 10, 1000);
        let err = NotifyError::new(ErrorKind::InvalidCredentials, "bad token");
        assert!(!should_retry(&err, 0, &p));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = policy(10, 100, 450);
        let err = NotifyError::new(ErrorKind::ConnectionFailed, "refused");

        let d0 = delay_for_attempt(&p, 0, &err);
        assert!(d0 >= Duration::from_millis(100) && d0 < Duration::from_millis(150));

        let d1 = delay_for_attempt(&p, 1, &err);
        assert!(d1 >= Duration::from_millis(200) && d1 < Duration::from_millis(250));

        // Past the cap, jitter included.
        let d4 = delay_for_attempt(&p, 4, &err);
        assert_eq!(d4, Duration::from_millis(450));
    }

    #[test]
    fn huge_attempt_saturates_at_max() {
        let p = policy(10, 100, 450);
        let err = NotifyError::new(ErrorKind::ConnectionFailed, "refused");
        assert_eq!(delay_for_attempt(&p, 63, &err), Duration::from_millis(450));
    }

    #[test]
    fn rate_limit_hint_extends_the_delay() {
        let p = policy(3, 10, 10_000);
        let err = NotifyError::rate_limited(Duration::from_millis(700));
        let d = delay_for_attempt(&p, 0, &err);
        assert!(d >= Duration::from_millis(700));
    }
}
