//! Shard capability and the shard set
//!
//! A shard is one independently owned relational store holding a disjoint
//! partition of users plus a full replica of segment metadata. The gateway
//! talks to shards only through the [`Shard`] trait:
//! - segment-wide writes go through `prepare` / `commit_prepared` /
//!   `rollback_prepared` (named prepared transactions)
//! - user-scoped operations run as ordinary local transactions
//!
//! Backends: [`MemoryShard`] (in-process) and [`PgShard`] (Postgres).

pub mod memory;
pub mod postgres;

pub use memory::MemoryShard;
pub use postgres::PgShard;

use crate::common::{Error, Result, ShardBackend, ShardsConfig};
use crate::coordinator::placement::ShardRouter;
use crate::domain::{Percentage, Segment, SegmentInfo, SegmentPatch, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A shard-local statement applied identically on every shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentStatement {
    Insert(Segment),
    Delete(String),
    Update { id: String, patch: SegmentPatch },
    Distribute { id: String, percentage: Percentage },
}

impl SegmentStatement {
    pub fn segment_id(&self) -> &str {
        match self {
            SegmentStatement::Insert(segment) => &segment.id,
            SegmentStatement::Delete(id)
            | SegmentStatement::Update { id, .. }
            | SegmentStatement::Distribute { id, .. } => id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SegmentStatement::Insert(_) => "create",
            SegmentStatement::Delete(_) => "delete",
            SegmentStatement::Update { .. } => "update",
            SegmentStatement::Distribute { .. } => "distribute",
        }
    }

    /// The domain error a uniqueness violation means for this statement.
    pub fn conflict_error(&self) -> Error {
        match self {
            SegmentStatement::Insert(_) => Error::SegmentAlreadyExists,
            SegmentStatement::Distribute { .. } => Error::SegmentDistributed,
            other => Error::Internal(format!(
                "unexpected unique violation in {} of segment {}",
                other.name(),
                other.segment_id()
            )),
        }
    }

    /// Whether the statement found its segment somewhere, given every
    /// shard's outcome. Creation never needs an existing row.
    pub fn matched(&self, outcomes: &[StatementOutcome]) -> bool {
        match self {
            SegmentStatement::Insert(_) => true,
            SegmentStatement::Delete(_) | SegmentStatement::Update { .. } => {
                outcomes.iter().any(|o| o.rows_affected > 0)
            }
            SegmentStatement::Distribute { .. } => outcomes.iter().any(|o| o.segment_present),
        }
    }
}

/// Result of running a statement inside a shard's prepared transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementOutcome {
    pub rows_affected: u64,
    /// The segment row existed on this shard when the statement ran.
    pub segment_present: bool,
}

/// A prepared transaction parked on a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedTx {
    pub shard: usize,
    pub tx_id: String,
    pub prepared_at: DateTime<Utc>,
}

/// Capability set of a single shard.
#[async_trait]
pub trait Shard: Send + Sync {
    /// Position of this shard in the shard set
    fn index(&self) -> usize;

    fn name(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    /// Open a local transaction, run `statement`, and park the transaction
    /// as prepared under `tx_id`. If the statement fails the open
    /// transaction is rolled back before the error is returned.
    async fn prepare(&self, tx_id: &str, statement: &SegmentStatement)
        -> Result<StatementOutcome>;

    async fn commit_prepared(&self, tx_id: &str) -> Result<()>;

    async fn rollback_prepared(&self, tx_id: &str) -> Result<()>;

    /// Prepared transactions issued by this gateway that are still pending.
    async fn list_prepared(&self) -> Result<Vec<PreparedTx>>;

    async fn create_user(&self, id: UserId) -> Result<()>;

    /// Returns the number of deleted rows.
    async fn delete_user(&self, id: UserId) -> Result<u64>;

    /// `None` when the user does not live on this shard.
    async fn user_segments(&self, id: UserId) -> Result<Option<Vec<Segment>>>;

    /// Segment row plus this shard's membership count, `None` if absent.
    async fn segment_stats(&self, id: &str) -> Result<Option<SegmentInfo>>;
}

/// Run a shard operation under a deadline. Elapsed deadlines surface as
/// `ShardUnavailable` for that shard.
pub async fn bounded<T, F>(shard: usize, deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::ShardUnavailable {
            shard,
            reason: format!("no response within {:?}", deadline),
        }),
    }
}

/// Fixed, ordered collection of shards, built once at startup.
pub struct ShardSet {
    shards: Vec<Arc<dyn Shard>>,
    router: ShardRouter,
}

impl ShardSet {
    pub fn new(shards: Vec<Arc<dyn Shard>>) -> Result<Self> {
        if shards.is_empty() {
            return Err(Error::InvalidConfig("shard set cannot be empty".into()));
        }
        for (position, shard) in shards.iter().enumerate() {
            if shard.index() != position {
                return Err(Error::InvalidConfig(format!(
                    "shard {} registered at position {}",
                    shard.index(),
                    position
                )));
            }
        }
        let router = ShardRouter::new(shards.len());
        Ok(Self { shards, router })
    }

    /// In-process shard set
    pub fn memory(count: usize) -> Result<Self> {
        let shards = (0..count)
            .map(|i| Arc::new(MemoryShard::new(i)) as Arc<dyn Shard>)
            .collect();
        Self::new(shards)
    }

    /// Build the shard set described by `config`. Postgres pools connect
    /// lazily; call [`ShardSet::ping_all`] to verify reachability.
    pub fn from_config(config: &ShardsConfig) -> Result<Self> {
        match config.backend {
            ShardBackend::Memory => Self::memory(config.count),
            ShardBackend::Postgres => {
                let mut shards: Vec<Arc<dyn Shard>> = Vec::with_capacity(config.count);
                for (index, endpoint) in config.endpoints.iter().enumerate() {
                    let dsn = endpoint.resolve_dsn()?;
                    let shard = PgShard::connect_lazy(
                        index,
                        &endpoint.name,
                        &dsn,
                        config.max_connections,
                        config.statement_timeout(),
                    )?;
                    shards.push(Arc::new(shard));
                }
                Self::new(shards)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn all(&self) -> &[Arc<dyn Shard>] {
        &self.shards
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn Shard>> {
        self.shards.get(index)
    }

    /// The shard owning `user`.
    pub fn for_user(&self, user: UserId) -> &Arc<dyn Shard> {
        &self.shards[self.router.route(user)]
    }

    /// Ping every shard, failing on the first unreachable one.
    pub async fn ping_all(&self, deadline: Duration) -> Result<()> {
        for shard in &self.shards {
            bounded(shard.index(), deadline, shard.ping()).await?;
            tracing::debug!(shard = shard.index(), name = shard.name(), "shard reachable");
        }
        Ok(())
    }
}
