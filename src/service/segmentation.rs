//! Public segmentation operations
//!
//! Thin layer over the coordinator: validates input, reads through the
//! segment cache, flushes the cache after every successful write and
//! classifies every error before it leaves.

use crate::cache::SegmentCache;
use crate::common::{classify, validate_segment_id, Error, PublicError};
use crate::coordinator::aggregate;
use crate::coordinator::SegmentCoordinator;
use crate::domain::{Percentage, Segment, SegmentInfo, SegmentPatch, UserId};
use crate::shard::bounded;
use std::sync::Arc;
use tracing::{debug, error, warn};

type ServiceResult<T> = std::result::Result<T, PublicError>;

pub struct SegmentationService {
    coordinator: Arc<SegmentCoordinator>,
    cache: Arc<dyn SegmentCache>,
}

impl SegmentationService {
    pub fn new(coordinator: Arc<SegmentCoordinator>, cache: Arc<dyn SegmentCache>) -> Self {
        Self { coordinator, cache }
    }

    pub fn coordinator(&self) -> &Arc<SegmentCoordinator> {
        &self.coordinator
    }

    pub async fn create_segment(&self, segment: Segment) -> ServiceResult<String> {
        validate_segment_id(&segment.id)?;
        let id = self.coordinator.create_segment(segment).await?;
        self.invalidate().await;
        Ok(id)
    }

    pub async fn delete_segment(&self, id: &str) -> ServiceResult<String> {
        validate_segment_id(id)?;
        let id = self.coordinator.delete_segment(id).await?;
        self.invalidate().await;
        Ok(id)
    }

    pub async fn update_segment(&self, id: &str, patch: SegmentPatch) -> ServiceResult<String> {
        validate_segment_id(id)?;
        let id = self.coordinator.update_segment(id, patch).await?;
        self.invalidate().await;
        Ok(id)
    }

    /// `percentage` comes straight from the caller and is checked here,
    /// before any shard is touched.
    pub async fn distribute_segment(&self, id: &str, percentage: i64) -> ServiceResult<String> {
        validate_segment_id(id)?;
        let percentage = Percentage::new(percentage)?;
        let id = self.coordinator.distribute_segment(id, percentage).await?;
        self.invalidate().await;
        Ok(id)
    }

    pub async fn get_segment_info(&self, id: &str) -> ServiceResult<SegmentInfo> {
        validate_segment_id(id)?;
        let info = aggregate::segment_info(
            self.coordinator.shards(),
            id,
            self.coordinator.shard_timeout(),
        )
        .await?;
        Ok(info)
    }

    /// Segments of one user. A cached entry, even an empty one, is returned
    /// without touching the user's shard.
    ///
    /// The cache generation is taken before the shard read, so a list loaded
    /// before a concurrent write's flush is never written back after it.
    pub async fn get_user_segments(&self, user: UserId) -> ServiceResult<Vec<Segment>> {
        match self.cache.get(user).await {
            Ok(Some(segments)) => {
                debug!(user, "segment cache hit");
                return Ok(segments);
            }
            Ok(None) => {}
            Err(err) => error!(user, error = %err, "failed to read segment cache"),
        }

        let generation = match self.cache.generation().await {
            Ok(generation) => Some(generation),
            Err(err) => {
                error!(user, error = %err, "failed to read cache generation");
                None
            }
        };

        let shards = self.coordinator.shards();
        let shard = shards.for_user(user);
        let segments = bounded(
            shard.index(),
            self.coordinator.shard_timeout(),
            shard.user_segments(user),
        )
        .await?
        .ok_or_else(|| classify(Error::UserNotFound))?;

        if let Some(generation) = generation {
            match self.cache.set(user, &segments, generation).await {
                Ok(true) => {}
                Ok(false) => debug!(user, "cache flushed during read, result not cached"),
                Err(err) => error!(user, error = %err, "failed to cache user segments"),
            }
        }
        Ok(segments)
    }

    /// A failed flush never undoes the write that preceded it.
    async fn invalidate(&self) {
        if let Err(err) = self.cache.clear().await {
            warn!(error = %err, "segment cache invalidation failed");
        }
    }
}
