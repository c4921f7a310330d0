//! In-process segment cache backed by `moka`.

use crate::cache::{Generation, SegmentCache};
use crate::common::Result;
use crate::domain::{Segment, UserId};
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub struct MemoryCache {
    entries: Cache<UserId, Arc<Vec<Segment>>>,
    /// Inserts hold the read side, `clear` the write side, so no insert
    /// can slip in between the bump and `invalidate_all`.
    generation: RwLock<Generation>,
}

impl MemoryCache {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self {
            entries,
            generation: RwLock::new(0),
        }
    }
}

#[async_trait]
impl SegmentCache for MemoryCache {
    async fn get(&self, user: UserId) -> Result<Option<Vec<Segment>>> {
        Ok(self
            .entries
            .get(&user)
            .await
            .map(|segments| segments.as_ref().clone()))
    }

    async fn generation(&self) -> Result<Generation> {
        Ok(*self.generation.read().await)
    }

    async fn set(
        &self,
        user: UserId,
        segments: &[Segment],
        generation: Generation,
    ) -> Result<bool> {
        let current = self.generation.read().await;
        if *current != generation {
            return Ok(false);
        }
        self.entries.insert(user, Arc::new(segments.to_vec())).await;
        Ok(true)
    }

    async fn clear(&self) -> Result<()> {
        let mut current = self.generation.write().await;
        *current = current.wrapping_add(1);
        self.entries.invalidate_all();
        Ok(())
    }
}
