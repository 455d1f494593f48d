//! Redis cache implementation
//!
//! Provides a shared cache using Redis for multi-instance deployments.
//!
//! # Features
//! - Field maps stored as Redis hashes, replaced and expired in one MULTI block
//! - Fixed-window counters via `INCR` + `EXPIRE NX` in one MULTI block
//! - Thread-safe async access over a multiplexed connection
//!
//! `EXPIRE ... NX` requires Redis 7.0 or newer.

use super::CacheLayer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;

/// Redis cache implementation
pub struct RedisCache {
    /// Multiplexed connection, cloned per operation
    connection: MultiplexedConnection,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Create a new Redis cache with the given connection URL
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Failed to create Redis client")?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;

        Ok(Self { connection })
    }
}

/// Redis expiries are whole seconds; never send 0, which would delete the key.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheLayer for RedisCache {
    async fn set_fields(
        &self,
        key: &str,
        fields: &HashMap<String, String>,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.connection.clone();

        if fields.is_empty() {
            let _: () = conn
                .del(key)
                .await
                .context("Failed to delete key from Redis")?;
            return Ok(());
        }

        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let _: () = redis::pipe()
            .atomic()
            .del(key)
            .ignore()
            .hset_multiple(key, &items)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .context("Failed to store hash in Redis")?;

        Ok(())
    }

    /// An empty hash is indistinguishable from a missing key in Redis.
    async fn get_fields(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let mut conn = self.connection.clone();

        let fields: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .context("Failed to read hash from Redis")?;

        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fields))
        }
    }

    async fn incr(&self, key: &str, window: Duration) -> Result<u64> {
        let mut conn = self.connection.clone();

        // NX keeps the expiry set by the first increment of the window
        let (count, _): (u64, i64) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(window))
            .arg("NX")
            .query_async(&mut conn)
            .await
            .context("Failed to increment counter in Redis")?;

        Ok(count)
    }

    async fn get_counter(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.connection.clone();

        let count: Option<u64> = conn
            .get(key)
            .await
            .context("Failed to read counter from Redis")?;

        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();

        let _: () = conn
            .del(key)
            .await
            .context("Failed to delete key from Redis")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to get Redis URL from environment or use default
    fn get_redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    // Run with: cargo test --features redis-cache -- --ignored

    #[test]
    fn test_ttl_secs_never_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(90)), 90);
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_set_and_get_fields() {
        let cache = RedisCache::new(&get_redis_url()).await.unwrap();
        cache.delete("test:session:1").await.unwrap();

        let mut fields = HashMap::new();
        fields.insert("user_id".to_string(), "1".to_string());
        fields.insert("expires_at".to_string(), "2030-01-01T00:00:00+00:00".to_string());

        cache
            .set_fields("test:session:1", &fields, Duration::from_secs(60))
            .await
            .unwrap();

        let result = cache.get_fields("test:session:1").await.unwrap();
        assert_eq!(result, Some(fields));

        cache.delete("test:session:1").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_get_nonexistent() {
        let cache = RedisCache::new(&get_redis_url()).await.unwrap();

        assert_eq!(cache.get_fields("test:nonexistent_key_12345").await.unwrap(), None);
        assert_eq!(cache.get_counter("test:nonexistent_key_12345").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_set_replaces_stale_fields() {
        let cache = RedisCache::new(&get_redis_url()).await.unwrap();

        let mut first = HashMap::new();
        first.insert("a".to_string(), "1".to_string());
        first.insert("b".to_string(), "2".to_string());
        cache
            .set_fields("test:replace", &first, Duration::from_secs(60))
            .await
            .unwrap();

        let mut second = HashMap::new();
        second.insert("a".to_string(), "3".to_string());
        cache
            .set_fields("test:replace", &second, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.get_fields("test:replace").await.unwrap(), Some(second));
        cache.delete("test:replace").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_incr_fixed_window() {
        let cache = RedisCache::new(&get_redis_url()).await.unwrap();
        cache.delete("test:rl:incr").await.unwrap();

        assert_eq!(cache.incr("test:rl:incr", Duration::from_secs(1)).await.unwrap(), 1);
        assert_eq!(cache.incr("test:rl:incr", Duration::from_secs(1)).await.unwrap(), 2);
        assert_eq!(cache.get_counter("test:rl:incr").await.unwrap(), Some(2));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(cache.get_counter("test:rl:incr").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_ttl_expiration() {
        let cache = RedisCache::new(&get_redis_url()).await.unwrap();

        let mut fields = HashMap::new();
        fields.insert("user_id".to_string(), "9".to_string());
        cache
            .set_fields("test:ttl_key", &fields, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(cache.get_fields("test:ttl_key").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(cache.get_fields("test:ttl_key").await.unwrap(), None);
    }
}
