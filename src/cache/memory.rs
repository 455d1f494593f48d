//! In-memory cache implementation using moka
//!
//! Provides a fast, thread-safe in-memory cache with per-entry expiry.
//!
//! # Features
//! - Each entry carries an absolute deadline enforced through moka's `Expiry`
//! - Counter increments are atomic per key (`and_upsert_with`) and keep the
//!   deadline set by the first increment of the window
//! - Thread-safe concurrent access

use super::CacheLayer;
use anyhow::{bail, Result};
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default maximum cache capacity (number of entries)
const DEFAULT_MAX_CAPACITY: u64 = 100_000;

#[derive(Clone, Debug)]
enum CacheValue {
    Fields(Arc<HashMap<String, String>>),
    Counter(u64),
}

/// Cache entry with the instant it stops being visible
#[derive(Clone, Debug)]
struct CacheEntry {
    value: CacheValue,
    deadline: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline > now
    }
}

/// Expiry policy reading the deadline stored in each entry
struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.deadline.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.deadline.saturating_duration_since(updated_at))
    }
}

/// In-memory cache using moka
pub struct MemoryCache {
    cache: Cache<String, CacheEntry>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl MemoryCache {
    /// Create a new memory cache with default capacity (100,000 entries)
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_CAPACITY)
    }

    /// Create a new memory cache with custom max capacity
    pub fn with_capacity(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build();

        Self { cache }
    }

    /// Get the current number of entries in the cache
    ///
    /// The count is maintained lazily; call [`Self::run_pending_tasks`] first
    /// for an exact figure.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Flush pending evictions and bookkeeping
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheLayer for MemoryCache {
    async fn set_fields(
        &self,
        key: &str,
        fields: &HashMap<String, String>,
        ttl: Duration,
    ) -> Result<()> {
        let entry = CacheEntry {
            value: CacheValue::Fields(Arc::new(fields.clone())),
            deadline: Instant::now() + ttl,
        };
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn get_fields(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        match self.cache.get(key).await {
            Some(entry) if entry.is_live(Instant::now()) => match entry.value {
                CacheValue::Fields(fields) => Ok(Some(fields.as_ref().clone())),
                CacheValue::Counter(_) => bail!("cached value at '{}' is not a field map", key),
            },
            _ => Ok(None),
        }
    }

    async fn incr(&self, key: &str, window: Duration) -> Result<u64> {
        let entry = self
            .cache
            .entry(key.to_string())
            .and_upsert_with(|existing| {
                let now = Instant::now();
                let next = match existing.map(|e| e.into_value()) {
                    Some(CacheEntry {
                        value: CacheValue::Counter(count),
                        deadline,
                    }) if deadline > now => CacheEntry {
                        value: CacheValue::Counter(count.saturating_add(1)),
                        deadline,
                    },
                    _ => CacheEntry {
                        value: CacheValue::Counter(1),
                        deadline: now + window,
                    },
                };
                std::future::ready(next)
            })
            .await;

        match entry.into_value().value {
            CacheValue::Counter(count) => Ok(count),
            CacheValue::Fields(_) => bail!("cached value at '{}' is not a counter", key),
        }
    }

    async fn get_counter(&self, key: &str) -> Result<Option<u64>> {
        match self.cache.get(key).await {
            Some(entry) if entry.is_live(Instant::now()) => match entry.value {
                CacheValue::Counter(count) => Ok(Some(count)),
                CacheValue::Fields(_) => bail!("cached value at '{}' is not a counter", key),
            },
            _ => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}
