//! Segment-wide writes with two-phase commit
//!
//! Segment metadata lives on every shard, so create/update/delete/distribute
//! must land on all shards or on none. For one call:
//! 1. every shard opens a transaction, runs the statement and parks it as
//!    prepared under a fresh transaction id
//! 2. any failure rolls back the failing shard and every shard that
//!    already prepared
//! 3. only once all shards are prepared does any shard commit
//!
//! There is no durable coordinator log. A commit that fails after other
//! shards committed leaves the write partially applied; that is reported as
//! `ShardCommitFailed` and never retried blindly. Transactions orphaned by a
//! crash stay prepared on their shards; see [`crate::ops::reconcile`].

use crate::common::{generate_tx_id, Error, Result};
use crate::domain::{Percentage, Segment, SegmentPatch};
use crate::shard::{bounded, SegmentStatement, Shard, ShardSet, StatementOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Floor on the retry interval while chasing an abandoned prepare.
const MIN_ABANDONED_POLL: Duration = Duration::from_millis(5);

/// Summary of a committed distributed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub tx_id: String,
    /// Rows changed across all shards
    pub rows_affected: u64,
}

/// Drives segment-wide mutations across the shard set.
pub struct SegmentCoordinator {
    shards: Arc<ShardSet>,
    /// Deadline for each shard step (prepare, commit, rollback)
    shard_timeout: Duration,
}

impl SegmentCoordinator {
    pub fn new(shards: Arc<ShardSet>, shard_timeout: Duration) -> Self {
        Self {
            shards,
            shard_timeout,
        }
    }

    pub fn shards(&self) -> &Arc<ShardSet> {
        &self.shards
    }

    pub fn shard_timeout(&self) -> Duration {
        self.shard_timeout
    }

    /// Insert the segment on every shard. Fails with `SegmentAlreadyExists`
    /// if any shard already has the id.
    pub async fn create_segment(&self, segment: Segment) -> Result<String> {
        let id = segment.id.clone();
        self.run_two_phase(SegmentStatement::Insert(segment)).await?;
        Ok(id)
    }

    /// Delete the segment everywhere. Succeeds if at least one shard had it.
    pub async fn delete_segment(&self, id: &str) -> Result<String> {
        self.run_two_phase(SegmentStatement::Delete(id.to_string()))
            .await?;
        Ok(id.to_string())
    }

    /// Update the segment everywhere. Succeeds if at least one shard had it.
    pub async fn update_segment(&self, id: &str, patch: SegmentPatch) -> Result<String> {
        self.run_two_phase(SegmentStatement::Update {
            id: id.to_string(),
            patch,
        })
        .await?;
        Ok(id.to_string())
    }

    /// Add `percentage` of every shard's users to the segment. Fails with
    /// `SegmentDistributed` if a sampled user already belongs to it.
    pub async fn distribute_segment(&self, id: &str, percentage: Percentage) -> Result<String> {
        let report = self
            .run_two_phase(SegmentStatement::Distribute {
                id: id.to_string(),
                percentage,
            })
            .await?;
        info!(
            segment = %id,
            %percentage,
            inserted = report.rows_affected,
            "segment distributed"
        );
        Ok(id.to_string())
    }

    /// Prepare `statement` on every shard, then commit everywhere.
    pub async fn run_two_phase(&self, statement: SegmentStatement) -> Result<CommitReport> {
        let tx_id = generate_tx_id();
        let mut prepared: Vec<usize> = Vec::with_capacity(self.shards.len());
        let mut outcomes: Vec<StatementOutcome> = Vec::with_capacity(self.shards.len());

        debug!(
            %tx_id,
            statement = statement.name(),
            segment = %statement.segment_id(),
            "starting distributed write"
        );

        for shard in self.shards.all() {
            let index = shard.index();
            let attempt =
                tokio::time::timeout(self.shard_timeout, shard.prepare(&tx_id, &statement)).await;

            match attempt {
                Ok(Ok(outcome)) => {
                    prepared.push(index);
                    outcomes.push(outcome);
                }
                Ok(Err(err)) => {
                    // The shard already rolled back its own open transaction.
                    self.rollback_all(&tx_id, &prepared).await;
                    return Err(match err {
                        Error::UniqueViolation { .. } => statement.conflict_error(),
                        other => {
                            error!(%tx_id, shard = index, error = %other, "prepare failed");
                            other
                        }
                    });
                }
                Err(_) => {
                    warn!(%tx_id, shard = index, "prepare timed out");
                    self.abort_abandoned(shard, &tx_id).await;
                    self.rollback_all(&tx_id, &prepared).await;
                    return Err(Error::ShardUnavailable {
                        shard: index,
                        reason: format!("prepare timed out after {:?}", self.shard_timeout),
                    });
                }
            }
        }

        if !statement.matched(&outcomes) {
            self.rollback_all(&tx_id, &prepared).await;
            return Err(Error::SegmentNotFound);
        }

        self.commit_all(&tx_id, &prepared).await?;

        let rows_affected = outcomes.iter().map(|o| o.rows_affected).sum();
        info!(
            %tx_id,
            statement = statement.name(),
            segment = %statement.segment_id(),
            shards = prepared.len(),
            rows = rows_affected,
            "distributed write committed"
        );
        Ok(CommitReport {
            tx_id,
            rows_affected,
        })
    }

    /// Commit on every prepared shard. Failed shards get a rollback attempt
    /// so they do not keep holding locks.
    async fn commit_all(&self, tx_id: &str, prepared: &[usize]) -> Result<()> {
        let mut committed = Vec::with_capacity(prepared.len());
        let mut failed = Vec::new();
        let mut first_reason = None;

        for &index in prepared {
            let Some(shard) = self.shards.get(index) else {
                continue;
            };
            match bounded(index, self.shard_timeout, shard.commit_prepared(tx_id)).await {
                Ok(()) => committed.push(index),
                Err(err) => {
                    error!(%tx_id, shard = index, error = %err, "commit failed");
                    first_reason.get_or_insert_with(|| err.to_string());
                    failed.push(index);
                }
            }
        }

        if failed.is_empty() {
            return Ok(());
        }

        self.rollback_all(tx_id, &failed).await;
        if !committed.is_empty() {
            error!(
                %tx_id,
                ?committed,
                ?failed,
                "distributed write partially applied"
            );
        }
        Err(Error::ShardCommitFailed {
            tx_id: tx_id.to_string(),
            failed,
            committed,
            reason: first_reason.unwrap_or_default(),
        })
    }

    /// Roll back `tx_id` on each listed shard. Failures are logged; the
    /// transaction then stays prepared until reconciled.
    async fn rollback_all(&self, tx_id: &str, prepared: &[usize]) {
        for &index in prepared {
            if let Some(shard) = self.shards.get(index) {
                self.abort_shard(shard, tx_id).await;
            }
        }
    }

    /// Roll back a prepare the coordinator stopped waiting for. The shard
    /// may still be running it, so a missing transaction is retried until
    /// one more shard deadline has passed.
    async fn abort_abandoned(&self, shard: &Arc<dyn Shard>, tx_id: &str) {
        let index = shard.index();
        let give_up = Instant::now() + self.shard_timeout;
        let interval = (self.shard_timeout / 8).max(MIN_ABANDONED_POLL);

        loop {
            match bounded(index, self.shard_timeout, shard.rollback_prepared(tx_id)).await {
                Ok(()) => {
                    debug!(%tx_id, shard = index, "abandoned prepare rolled back");
                    return;
                }
                Err(Error::UnknownTransaction { .. }) => {}
                Err(err) => {
                    error!(
                        %tx_id,
                        shard = index,
                        error = %err,
                        "abandoned prepare may be left behind, resolve with `segmentd prepared`"
                    );
                    return;
                }
            }

            if Instant::now() >= give_up {
                warn!(
                    %tx_id,
                    shard = index,
                    "abandoned prepare never showed up on the shard"
                );
                return;
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn abort_shard(&self, shard: &Arc<dyn Shard>, tx_id: &str) {
        let index = shard.index();
        match bounded(index, self.shard_timeout, shard.rollback_prepared(tx_id)).await {
            Ok(()) => debug!(%tx_id, shard = index, "rolled back"),
            Err(Error::UnknownTransaction { .. }) => {
                debug!(%tx_id, shard = index, "nothing prepared to roll back")
            }
            Err(err) => error!(%tx_id, shard = index, error = %err, "rollback failed"),
        }
    }
}
