//! User placement across shards
//!
//! Users live on exactly one shard, chosen by `user_id mod shard_count`.
//! The shard count is fixed at startup; changing it relocates users and
//! needs a re-sharding step this gateway does not perform.

use crate::domain::UserId;

/// Deterministic user → shard mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    num_shards: usize,
}

impl ShardRouter {
    /// `num_shards` must be non-zero; [`crate::shard::ShardSet`] guarantees it.
    pub fn new(num_shards: usize) -> Self {
        assert!(num_shards > 0, "shard router needs at least one shard");
        Self { num_shards }
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// Shard index owning `user`. Negative ids use the Euclidean remainder
    /// so they still land in `0..num_shards`.
    pub fn route(&self, user: UserId) -> usize {
        user.rem_euclid(self.num_shards as i64) as usize
    }
}
