//! Segment cache
//!
//! Best-effort read-through cache of per-user segment lists. Entries live
//! for a fixed TTL and every successful write drops the whole cache, since
//! one segment mutation can touch an unbounded set of cached users.
//! The cache is never authoritative; everything in it can be re-derived
//! from the shards.
//!
//! Each flush starts a new generation. Readers write back only under the
//! generation they saw before loading from a shard, so a load that raced a
//! write cannot repopulate the cache with pre-write data.

pub mod memory;
pub mod redis_cache;

pub use memory::MemoryCache;
pub use redis_cache::RedisCache;

use crate::common::{CacheBackend, CacheConfig, Result};
use crate::domain::{Segment, UserId};
use async_trait::async_trait;
use std::sync::Arc;

/// Key prefix of cached user segment lists.
pub const KEY_PREFIX: &str = "userSegments";

/// Cache key for `user`, e.g. `userSegments:42`.
pub fn cache_key(user: UserId) -> String {
    format!("{}:{}", KEY_PREFIX, user)
}

/// Token naming one cache "era". Every [`SegmentCache::clear`] starts a new
/// one.
pub type Generation = u64;

#[async_trait]
pub trait SegmentCache: Send + Sync {
    /// `Ok(None)` on a miss. A hit may be an empty list.
    async fn get(&self, user: UserId) -> Result<Option<Vec<Segment>>>;

    /// Current generation. Read it before loading the value to be cached.
    async fn generation(&self) -> Result<Generation>;

    /// Store `segments` unless a `clear` happened after `generation` was
    /// read. The check and the write are atomic with respect to `clear`.
    /// Returns whether the entry was stored.
    async fn set(
        &self,
        user: UserId,
        segments: &[Segment],
        generation: Generation,
    ) -> Result<bool>;

    /// Drop every entry and start a new generation.
    async fn clear(&self) -> Result<()>;
}

/// Cache that stores nothing (caching disabled).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait]
impl SegmentCache for NoopCache {
    async fn get(&self, _user: UserId) -> Result<Option<Vec<Segment>>> {
        Ok(None)
    }

    async fn generation(&self) -> Result<Generation> {
        Ok(0)
    }

    async fn set(
        &self,
        _user: UserId,
        _segments: &[Segment],
        _generation: Generation,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the cache described by `config`.
pub async fn from_config(config: &CacheConfig) -> Result<Arc<dyn SegmentCache>> {
    let cache: Arc<dyn SegmentCache> = match config.backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new(config.ttl(), config.max_entries)),
        CacheBackend::Redis => {
            let url = config.resolve_url()?;
            Arc::new(RedisCache::connect(&url, config.ttl()).await?)
        }
        CacheBackend::Disabled => Arc::new(NoopCache),
    };
    tracing::info!(backend = ?config.backend, ttl_secs = config.ttl_secs, "segment cache ready");
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        assert_eq!(cache_key(42), "userSegments:42");
    }

    #[tokio::test]
    async fn test_noop_cache_always_misses() {
        let cache = NoopCache;
        let generation = cache.generation().await.unwrap();
        assert!(!cache.set(1, &[Segment::new("S", "d")], generation).await.unwrap());
        assert_eq!(cache.get(1).await.unwrap(), None);
        cache.clear().await.unwrap();
    }
}
