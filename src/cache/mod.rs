//! Cache layer
//!
//! This module provides the volatile cache used by the session subsystem.
//! It supports:
//! - In-memory cache (moka) - default, for single-instance deployment
//! - Redis cache - optional, for multi-instance deployment
//! - No cache at all, in which case sessions are served from the database
//!
//! The cache is an accelerator only. Every caller must be prepared for any
//! operation to fail and fall back to the durable store.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tradepost::cache::create_cache;
//! use tradepost::config::CacheConfig;
//!
//! let cache = create_cache(&CacheConfig::default()).await?;
//! if let Some(cache) = cache {
//!     cache.incr("rl:login:203.0.113.9", Duration::from_secs(60)).await?;
//! }
//! ```

pub mod memory;
#[cfg(feature = "redis-cache")]
pub mod redis;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheConfig, CacheDriver};

pub use memory::MemoryCache;
#[cfg(feature = "redis-cache")]
pub use redis::RedisCache;

/// Cache layer trait
///
/// Keys carry their own expiry; nothing outlives the TTL it was written with.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Store a field map under `key`, replacing any previous value, expiring after `ttl`
    async fn set_fields(&self, key: &str, fields: &HashMap<String, String>, ttl: Duration)
        -> Result<()>;

    /// Get all fields stored under `key`
    async fn get_fields(&self, key: &str) -> Result<Option<HashMap<String, String>>>;

    /// Atomically increment the counter at `key` and return the new count.
    ///
    /// The first increment in a window sets the expiry to `window`; later
    /// increments leave it untouched (fixed window).
    async fn incr(&self, key: &str, window: Duration) -> Result<u64>;

    /// Read the counter at `key` without modifying it
    async fn get_counter(&self, key: &str) -> Result<Option<u64>>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Shared, thread-safe cache handle
pub type SharedCache = Arc<dyn CacheLayer>;

/// Create a cache instance based on configuration
///
/// - `CacheDriver::Disabled` - no cache, returns `None`
/// - `CacheDriver::Memory` - in-memory cache using moka
/// - `CacheDriver::Redis` - Redis cache (requires `redis-cache` feature)
///
/// # Errors
/// - Returns an error if Redis is configured but the `redis-cache` feature is not enabled
/// - Returns an error if Redis connection fails
pub async fn create_cache(config: &CacheConfig) -> Result<Option<SharedCache>> {
    match config.driver {
        CacheDriver::Disabled => Ok(None),
        CacheDriver::Memory => {
            let cache = MemoryCache::with_capacity(config.max_capacity);
            Ok(Some(Arc::new(cache)))
        }
        CacheDriver::Redis => {
            #[cfg(feature = "redis-cache")]
            {
                let redis_url = config.redis_url.as_ref().ok_or_else(|| {
                    anyhow::anyhow!(
                        "Redis URL is required when using Redis cache driver. \
                         Set 'redis_url' in cache configuration or use TRADEPOST_CACHE_REDIS_URL environment variable."
                    )
                })?;

                let cache = RedisCache::new(redis_url).await?;
                Ok(Some(Arc::new(cache)))
            }

            #[cfg(not(feature = "redis-cache"))]
            {
                anyhow::bail!(
                    "Redis cache driver is configured but the 'redis-cache' feature is not enabled. \
                     Either enable the feature with `--features redis-cache` or use 'memory' cache driver."
                )
            }
        }
    }
}
