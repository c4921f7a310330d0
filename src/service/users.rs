//! User lifecycle
//!
//! Users live on exactly one shard, picked by the router, so these
//! operations are plain local transactions on that shard.

use crate::cache::SegmentCache;
use crate::common::{Error, PublicError};
use crate::domain::UserId;
use crate::shard::{bounded, ShardSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

type ServiceResult<T> = std::result::Result<T, PublicError>;

pub struct UsersService {
    shards: Arc<ShardSet>,
    cache: Arc<dyn SegmentCache>,
    shard_timeout: Duration,
}

impl UsersService {
    pub fn new(
        shards: Arc<ShardSet>,
        cache: Arc<dyn SegmentCache>,
        shard_timeout: Duration,
    ) -> Self {
        Self {
            shards,
            cache,
            shard_timeout,
        }
    }

    pub async fn create_user(&self, id: UserId) -> ServiceResult<UserId> {
        let shard = self.shards.for_user(id);
        bounded(shard.index(), self.shard_timeout, shard.create_user(id)).await?;
        info!(user = id, shard = shard.index(), "user created");
        Ok(id)
    }

    /// Removes the user and its memberships, then flushes the segment cache.
    /// Unlike segment writes, a failed flush fails the call (the user is
    /// already gone at that point).
    pub async fn delete_user(&self, id: UserId) -> ServiceResult<UserId> {
        let shard = self.shards.for_user(id);
        let deleted = bounded(shard.index(), self.shard_timeout, shard.delete_user(id)).await?;
        if deleted == 0 {
            return Err(Error::UserNotFound.into());
        }
        info!(user = id, shard = shard.index(), "user deleted");

        self.cache.clear().await?;
        Ok(id)
    }
}
