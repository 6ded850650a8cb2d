//! Token-bucket rate limiting keyed by (platform, bucket key).
//!
//! Each configured platform gets one keyed `governor` limiter; the
//! bucket key defaults to the platform-wide bucket and adapters may
//! supply a finer key per target (see `Platform::rate_limit_key`).
//! The limiter is consulted before work reaches an adapter; a deny is a
//! retryable `RateLimitExceeded` carrying the time-to-refill hint so the
//! retry scheduler can delay the re-queue accordingly.

use std::num::NonZeroU32;
use std::time::Duration;

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};
use nh_common::{ErrorKind, NotifyError, RateLimitSettings};

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Bucket key for targets without a finer adapter-supplied key.
const PLATFORM_BUCKET: &str = "";

struct PlatformLimiter {
    limiter: KeyedLimiter,
    clock: DefaultClock,
}

/// Per-platform keyed token buckets. Platforms without an entry are
/// unlimited.
pub struct RateLimiterRegistry {
    limiters: DashMap<String, PlatformLimiter>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self {
            limiters: DashMap::new(),
        }
    }

    /// Install (or replace) the limiter for a platform.
    pub fn configure(&self, platform: &str, settings: RateLimitSettings) -> Result<(), NotifyError> {
        let rate = NonZeroU32::new(settings.rate).ok_or_else(|| {
            NotifyError::new(ErrorKind::InvalidConfig, "rate limit rate must be non-zero")
                .with_platform(platform)
        })?;
        let burst = NonZeroU32::new(settings.burst).ok_or_else(|| {
            NotifyError::new(ErrorKind::InvalidConfig, "rate limit burst must be non-zero")
                .with_platform(platform)
        })?;
        let period = settings.window.checked_div(rate.get()).filter(|p| !p.is_zero());
        let quota = period
            .and_then(Quota::with_period)
            .ok_or_else(|| {
                NotifyError::new(
                    ErrorKind::InvalidConfig,
                    "rate limit window too small for the configured rate",
                )
                .with_platform(platform)
            })?
            .allow_burst(burst);

        let clock = DefaultClock::default();
        let limiter = RateLimiter::dashmap_with_clock(quota, &clock);
        self.limiters
            .insert(platform.to_string(), PlatformLimiter { limiter, clock });
        Ok(())
    }

    /// Remove the limiter for a platform.
    pub fn remove(&self, platform: &str) {
        self.limiters.remove(platform);
    }

    pub fn is_configured(&self, platform: &str) -> bool {
        self.limiters.contains_key(platform)
    }

    /// Try to take one token. A deny returns `RateLimitExceeded` with
    /// the refill delay as the `retry_after` hint.
    pub fn allow(&self, platform: &str, key: Option<&str>) -> Result<(), NotifyError> {
        let Some(entry) = self.limiters.get(platform) else {
            return Ok(());
        };
        let bucket = key.unwrap_or(PLATFORM_BUCKET).to_string();
        match entry.limiter.check_key(&bucket) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until
                    .wait_time_from(entry.clock.now())
                    .max(Duration::from_millis(1));
                Err(NotifyError::rate_limited(wait).with_platform(platform))
            }
        }
    }

    /// Park until a token is available. Callers impose deadlines with
    /// `tokio::time::timeout`; dropping the future abandons the wait.
    pub async fn wait(&self, platform: &str, key: Option<&str>) {
        let Some(entry) = self.limiters.get(platform) else {
            return;
        };
        let bucket = key.unwrap_or(PLATFORM_BUCKET).to_string();
        entry.limiter.until_key_ready(&bucket).await;
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(rate: u32, window: Duration, burst: u32) -> RateLimitSettings {
        RateLimitSettings { rate, window, burst }
    }

    #[test]
    fn unconfigured_platform_is_unlimited() {
        let registry = RateLimiterRegistry::new();
        for _ in 0..1000 {
            assert!(registry.allow("anything", None).is_ok());
        }
    }

    #[test]
    fn burst_bounds_allows_within_one_window() {
        let registry = RateLimiterRegistry::new();
        registry
            .configure("webhook", settings(10, Duration::from_secs(60), 5))
            .unwrap();

        let mut allowed = 0;
        for _ in 0..20 {
            if registry.allow("webhook", None).is_ok() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5, "at most burst tokens within one window");
    }

    #[test]
    fn deny_carries_refill_hint() {
        let registry = RateLimiterRegistry::new();
        registry
            .configure("webhook", settings(1, Duration::from_secs(60), 1))
            .unwrap();

        assert!(registry.allow("webhook", None).is_ok());
        let err = registry.allow("webhook", None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimitExceeded);
        assert!(err.retryable());
        let hint = err.retry_after.expect("refill hint");
        assert!(hint > Duration::ZERO && hint <= Duration::from_secs(60));
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let registry = RateLimiterRegistry::new();
        registry
            .configure("email", settings(1, Duration::from_secs(60), 1))
            .unwrap();

        assert!(registry.allow("email", Some("a.example.com")).is_ok());
        assert!(registry.allow("email", Some("b.example.com")).is_ok());
        assert!(registry.allow("email", Some("a.example.com")).is_err());
    }

    #[test]
    fn zero_rate_is_rejected() {
        let registry = RateLimiterRegistry::new();
        let err = registry
            .configure("webhook", settings(0, Duration::from_secs(60), 1))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
    }
}
