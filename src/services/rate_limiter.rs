//! Fixed-window rate limiter
//!
//! Counters live in the volatile cache under `rl:{action}:{subject}` and
//! expire with their window. A read that finds the subject at or over its
//! limit denies without touching the counter; otherwise the counter is
//! incremented atomically. Two processes racing on the last slot may both
//! get through; that slack is accepted.
//!
//! When the counter store is unreachable (or no cache is configured) the
//! decision follows `rate_limit.fail_open`.

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::cache::SharedCache;
use crate::config::{RateLimitConfig, WindowLimit};

/// Rate-limited actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    /// Keyed by client IP
    Login,
    /// Keyed by client IP
    Signup,
    /// Keyed by normalized email
    PasswordReset,
    /// Keyed by normalized email
    Contact,
}

impl RateLimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAction::Login => "login",
            RateLimitAction::Signup => "signup",
            RateLimitAction::PasswordReset => "password_reset",
            RateLimitAction::Contact => "contact",
        }
    }

    /// Counter key for this action and subject
    pub fn key(&self, subject: &str) -> String {
        format!("rl:{}:{}", self.as_str(), subject)
    }
}

/// The caller exceeded its allowance
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded, retry after {retry_after}s")]
pub struct RateLimited {
    /// Seconds until the caller should retry (the window length)
    pub retry_after: u64,
}

/// Rate limiter over the shared cache
pub struct RateLimiter {
    cache: Option<SharedCache>,
    config: RateLimitConfig,
    cache_timeout: Duration,
}

impl RateLimiter {
    pub fn new(cache: Option<SharedCache>, config: RateLimitConfig, cache_timeout: Duration) -> Self {
        Self {
            cache,
            config,
            cache_timeout,
        }
    }

    /// Whether an unreachable counter store lets requests through
    pub fn fail_open(&self) -> bool {
        self.config.fail_open
    }

    /// Configured limit for an action
    pub fn limit_for(&self, action: RateLimitAction) -> WindowLimit {
        match action {
            RateLimitAction::Login => self.config.login,
            RateLimitAction::Signup => self.config.signup,
            RateLimitAction::PasswordReset => self.config.password_reset,
            RateLimitAction::Contact => self.config.contact,
        }
    }

    /// Decide whether one more action under `key` is allowed, consuming a slot if so.
    pub async fn allow(&self, key: &str, limit: u64, window: Duration) -> bool {
        match self.count(key).await {
            Ok(Some(count)) if count >= limit => return false,
            Ok(_) => {}
            Err(e) => return self.unreachable(key, &e),
        }

        match self.record(key, window).await {
            Ok(_) => true,
            Err(e) => self.unreachable(key, &e),
        }
    }

    /// Apply the configured limit for `action` to `subject`.
    pub async fn check(&self, action: RateLimitAction, subject: &str) -> Result<(), RateLimited> {
        let limit = self.limit_for(action);
        let key = action.key(subject);

        if self.allow(&key, limit.limit, limit.window()).await {
            Ok(())
        } else {
            tracing::info!(action = action.as_str(), "Rate limit exceeded");
            Err(RateLimited {
                retry_after: limit.window_seconds,
            })
        }
    }

    /// Read a counter. `Err` means the store could not be asked.
    pub async fn count(&self, key: &str) -> Result<Option<u64>> {
        let cache = self.cache()?;
        tokio::time::timeout(self.cache_timeout, cache.get_counter(key))
            .await
            .map_err(|_| anyhow!("counter read timed out"))?
    }

    /// Increment a counter, starting a new window if none is live.
    pub async fn record(&self, key: &str, window: Duration) -> Result<u64> {
        let cache = self.cache()?;
        tokio::time::timeout(self.cache_timeout, cache.incr(key, window))
            .await
            .map_err(|_| anyhow!("counter increment timed out"))?
    }

    fn cache(&self) -> Result<&SharedCache> {
        self.cache
            .as_ref()
            .ok_or_else(|| anyhow!("no counter store configured"))
    }

    fn unreachable(&self, key: &str, error: &anyhow::Error) -> bool {
        let action = key.split(':').nth(1).unwrap_or("unknown");
        if self.config.fail_open {
            tracing::warn!(action, error = %error, "Counter store unavailable, allowing request");
        } else {
            tracing::warn!(action, error = %error, "Counter store unavailable, denying request");
        }
        self.config.fail_open
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::cache::CacheLayer;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Cache double whose every call fails
    pub struct FailingCache;

    #[async_trait]
    impl CacheLayer for FailingCache {
        async fn set_fields(&self, _: &str, _: &HashMap<String, String>, _: Duration) -> Result<()> {
            bail!("cache down")
        }
        async fn get_fields(&self, _: &str) -> Result<Option<HashMap<String, String>>> {
            bail!("cache down")
        }
        async fn incr(&self, _: &str, _: Duration) -> Result<u64> {
            bail!("cache down")
        }
        async fn get_counter(&self, _: &str) -> Result<Option<u64>> {
            bail!("cache down")
        }
        async fn delete(&self, _: &str) -> Result<()> {
            bail!("cache down")
        }
    }

    /// Cache double that never answers
    pub struct HangingCache;

    #[async_trait]
    impl CacheLayer for HangingCache {
        async fn set_fields(&self, _: &str, _: &HashMap<String, String>, _: Duration) -> Result<()> {
            std::future::pending().await
        }
        async fn get_fields(&self, _: &str) -> Result<Option<HashMap<String, String>>> {
            std::future::pending().await
        }
        async fn incr(&self, _: &str, _: Duration) -> Result<u64> {
            std::future::pending().await
        }
        async fn get_counter(&self, _: &str) -> Result<Option<u64>> {
            std::future::pending().await
        }
        async fn delete(&self, _: &str) -> Result<()> {
            std::future::pending().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{FailingCache, HangingCache};
    use super::*;
    use crate::cache::MemoryCache;
    use std::sync::Arc;

    fn limiter_with(cache: Option<SharedCache>, fail_open: bool) -> RateLimiter {
        let config = RateLimitConfig {
            fail_open,
            ..RateLimitConfig::default()
        };
        RateLimiter::new(cache, config, Duration::from_millis(200))
    }

    fn memory_limiter() -> RateLimiter {
        limiter_with(Some(Arc::new(MemoryCache::new())), true)
    }

    #[tokio::test]
    async fn test_five_per_minute_then_deny() {
        let limiter = memory_limiter();
        let window = Duration::from_secs(60);

        for _ in 0..5 {
            assert!(limiter.allow("rl:login:203.0.113.9", 5, window).await);
        }
        assert!(!limiter.allow("rl:login:203.0.113.9", 5, window).await);
    }

    #[tokio::test]
    async fn test_denied_request_does_not_increment() {
        let limiter = memory_limiter();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            limiter.allow("k", 2, window).await;
        }

        assert_eq!(limiter.count("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = memory_limiter();
        let window = Duration::from_secs(60);

        assert!(limiter.allow("a", 1, window).await);
        assert!(!limiter.allow("a", 1, window).await);
        assert!(limiter.allow("b", 1, window).await);
    }

    #[tokio::test]
    async fn test_window_reopens_after_expiry() {
        let limiter = memory_limiter();
        let window = Duration::from_millis(50);

        assert!(limiter.allow("short", 1, window).await);
        assert!(!limiter.allow("short", 1, window).await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.allow("short", 1, window).await);
    }

    #[tokio::test]
    async fn test_check_uses_action_limits() {
        let limiter = memory_limiter();
        let limit = limiter.limit_for(RateLimitAction::PasswordReset);

        for _ in 0..limit.limit {
            limiter
                .check(RateLimitAction::PasswordReset, "a@example.com")
                .await
                .unwrap();
        }

        let err = limiter
            .check(RateLimitAction::PasswordReset, "a@example.com")
            .await
            .unwrap_err();
        assert_eq!(err.retry_after, limit.window_seconds);

        // Another action for the same subject is counted separately
        limiter
            .check(RateLimitAction::Contact, "a@example.com")
            .await
            .unwrap();
    }

    #[test]
    fn test_action_keys() {
        assert_eq!(RateLimitAction::Login.key("10.0.0.1"), "rl:login:10.0.0.1");
        assert_eq!(
            RateLimitAction::PasswordReset.key("a@b.c"),
            "rl:password_reset:a@b.c"
        );
    }

    #[tokio::test]
    async fn test_unreachable_store_fail_open() {
        let limiter = limiter_with(Some(Arc::new(FailingCache)), true);
        assert!(limiter.allow("k", 1, Duration::from_secs(60)).await);
        assert!(limiter.check(RateLimitAction::Signup, "ip").await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_store_fail_closed() {
        let limiter = limiter_with(Some(Arc::new(FailingCache)), false);
        assert!(!limiter.allow("k", 1, Duration::from_secs(60)).await);
        assert!(limiter.check(RateLimitAction::Signup, "ip").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_cache_is_unreachable() {
        assert!(limiter_with(None, true).allow("k", 1, Duration::from_secs(1)).await);
        assert!(!limiter_with(None, false).allow("k", 1, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_hanging_store_times_out() {
        let limiter = limiter_with(Some(Arc::new(HangingCache)), false);

        let started = std::time::Instant::now();
        assert!(!limiter.allow("k", 1, Duration::from_secs(60)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
