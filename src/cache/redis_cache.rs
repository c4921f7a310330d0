//! Redis-backed segment cache
//!
//! Values are JSON arrays of `{id, description}` stored under
//! `userSegments:<userID>` with `SET ... EX <ttl>`. Invalidation flushes the
//! selected Redis database, so the cache should own its database number.
//!
//! The generation lives under its own key and is replaced with a fresh random
//! token in the same `MULTI` as the flush. Writes go through a script that
//! compares the token first.

use crate::cache::{cache_key, Generation, SegmentCache, KEY_PREFIX};
use crate::common::Result;
use crate::domain::{Segment, UserId};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::time::Duration;

/// KEYS[1] generation, KEYS[2] entry; ARGV generation, value, ttl.
const SET_IF_GENERATION: &str = r"
if (redis.call('GET', KEYS[1]) or '0') ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
return 1
";

fn generation_key() -> String {
    format!("{}:generation", KEY_PREFIX)
}

pub struct RedisCache {
    conn: MultiplexedConnection,
    ttl: Duration,
    set_script: Script,
}

impl RedisCache {
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        redis::cmd("PING").query_async::<()>(&mut conn).await?;

        tracing::info!(ttl_secs = ttl.as_secs(), "connected to redis segment cache");
        Ok(Self {
            conn,
            ttl,
            set_script: Script::new(SET_IF_GENERATION),
        })
    }
}

#[async_trait]
impl SegmentCache for RedisCache {
    async fn get(&self, user: UserId) -> Result<Option<Vec<Segment>>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(cache_key(user))
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn generation(&self) -> Result<Generation> {
        let mut conn = self.conn.clone();
        let current: Option<Generation> = redis::cmd("GET")
            .arg(generation_key())
            .query_async(&mut conn)
            .await?;
        Ok(current.unwrap_or(0))
    }

    async fn set(
        &self,
        user: UserId,
        segments: &[Segment],
        generation: Generation,
    ) -> Result<bool> {
        let json = serde_json::to_string(segments)?;
        let mut conn = self.conn.clone();
        let stored: i64 = self
            .set_script
            .key(generation_key())
            .key(cache_key(user))
            .arg(generation)
            .arg(json)
            .arg(self.ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(stored == 1)
    }

    async fn clear(&self) -> Result<()> {
        // Never 0, which is what readers see when the key is missing.
        let next: Generation = rand::random::<Generation>().max(1);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("FLUSHDB")
            .ignore()
            .cmd("SET")
            .arg(generation_key())
            .arg(next)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}
