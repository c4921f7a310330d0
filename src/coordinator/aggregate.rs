//! Scatter-gather segment statistics
//!
//! Every shard holds a replica of the segment row and its own slice of the
//! memberships, so `GetSegmentInfo` asks all shards at once and merges the
//! answers. A shard that errors or times out is logged and treated like a
//! shard that lacks the segment.

use crate::common::{Error, Result};
use crate::domain::SegmentInfo;
use crate::shard::{bounded, ShardSet};
use futures::future::join_all;
use std::time::Duration;
use tracing::{debug, warn};

/// What one shard said about a segment.
#[derive(Debug)]
pub enum ShardRead {
    Present(SegmentInfo),
    Absent,
    Failed(Error),
}

/// Query every shard concurrently. The result is ordered by shard index.
pub async fn collect_segment_info(
    shards: &ShardSet,
    id: &str,
    deadline: Duration,
) -> Vec<(usize, ShardRead)> {
    let reads = shards.all().iter().map(|shard| async move {
        let index = shard.index();
        let read = match bounded(index, deadline, shard.segment_stats(id)).await {
            Ok(Some(info)) => ShardRead::Present(info),
            Ok(None) => ShardRead::Absent,
            Err(err) => ShardRead::Failed(err),
        };
        (index, read)
    });
    join_all(reads).await
}

/// Merge per-shard reads into one answer: the description of the lowest
/// present shard and the sum of every present shard's count.
pub fn merge_segment_info(id: &str, mut reads: Vec<(usize, ShardRead)>) -> Result<SegmentInfo> {
    reads.sort_by_key(|(index, _)| *index);

    let mut merged: Option<SegmentInfo> = None;
    let mut failed = 0usize;

    for (index, read) in reads {
        match read {
            ShardRead::Present(info) => match merged.as_mut() {
                Some(acc) => acc.users_num += info.users_num,
                None => merged = Some(info),
            },
            ShardRead::Absent => debug!(segment = %id, shard = index, "segment absent on shard"),
            ShardRead::Failed(err) => {
                failed += 1;
                warn!(segment = %id, shard = index, error = %err, "shard read failed");
            }
        }
    }

    match merged {
        Some(info) => {
            if failed > 0 {
                warn!(
                    segment = %id,
                    failed_shards = failed,
                    users_num = info.users_num,
                    "segment info is partial"
                );
            }
            Ok(info)
        }
        None => Err(Error::SegmentNotFound),
    }
}

/// Fan out and merge in one step.
pub async fn segment_info(shards: &ShardSet, id: &str, deadline: Duration) -> Result<SegmentInfo> {
    let reads = collect_segment_info(shards, id, deadline).await;
    merge_segment_info(id, reads)
}
