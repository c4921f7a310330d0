//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use segmentation_gateway::cache::{Generation, MemoryCache, SegmentCache};
use segmentation_gateway::coordinator::http::GatewayState;
use segmentation_gateway::shard::{
    MemoryShard, PreparedTx, SegmentStatement, Shard, ShardSet, StatementOutcome,
};
use segmentation_gateway::{
    Error, Gateway, Result, Segment, SegmentCoordinator, SegmentInfo, UserId,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const SHARD_TIMEOUT: Duration = Duration::from_millis(200);

/// How long after the caller's deadline a [`Fault::LatePrepare`] lands.
pub const LATE_PREPARE_DELAY: Duration = Duration::from_millis(80);

/// Fault a [`FaultyShard`] injects into the 2PC path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// Refuse to prepare
    FailPrepare,
    /// Prepare, then never answer
    HangPrepare,
    /// Never answer, but prepare shortly after the caller's deadline, as a
    /// server still executing an abandoned `PREPARE` would
    LatePrepare,
    /// Refuse to commit a prepared transaction
    FailCommit,
}

/// Pauses the next `user_segments` call after it has read from the shard.
#[derive(Clone, Default)]
pub struct ReadGate {
    /// Signalled once the read is done and parked.
    pub reached: Arc<Notify>,
    /// Lets the parked read return.
    pub release: Arc<Notify>,
}

/// Memory shard wrapper that can be told to misbehave.
pub struct FaultyShard {
    inner: Arc<MemoryShard>,
    fault: Mutex<Fault>,
    read_gate: Mutex<Option<ReadGate>>,
}

impl FaultyShard {
    pub fn new(inner: Arc<MemoryShard>) -> Self {
        Self {
            inner,
            fault: Mutex::new(Fault::None),
            read_gate: Mutex::new(None),
        }
    }

    pub fn inject(&self, fault: Fault) {
        *self.fault.lock().unwrap() = fault;
    }

    pub fn gate_next_read(&self) -> ReadGate {
        let gate = ReadGate::default();
        *self.read_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn fault(&self) -> Fault {
        *self.fault.lock().unwrap()
    }
}

#[async_trait]
impl Shard for FaultyShard {
    fn index(&self) -> usize {
        self.inner.index()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn prepare(
        &self,
        tx_id: &str,
        statement: &SegmentStatement,
    ) -> Result<StatementOutcome> {
        match self.fault() {
            Fault::FailPrepare => Err(Error::ShardPrepareFailed {
                shard: self.index(),
                tx_id: tx_id.to_string(),
                reason: "injected".into(),
            }),
            Fault::HangPrepare => {
                self.inner.prepare(tx_id, statement).await?;
                std::future::pending().await
            }
            Fault::LatePrepare => {
                let inner = self.inner.clone();
                let tx_id = tx_id.to_string();
                let statement = statement.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(SHARD_TIMEOUT + LATE_PREPARE_DELAY).await;
                    let _ = inner.prepare(&tx_id, &statement).await;
                });
                std::future::pending().await
            }
            _ => self.inner.prepare(tx_id, statement).await,
        }
    }

    async fn commit_prepared(&self, tx_id: &str) -> Result<()> {
        if self.fault() == Fault::FailCommit {
            return Err(Error::Statement {
                shard: self.index(),
                reason: "injected commit failure".into(),
            });
        }
        self.inner.commit_prepared(tx_id).await
    }

    async fn rollback_prepared(&self, tx_id: &str) -> Result<()> {
        self.inner.rollback_prepared(tx_id).await
    }

    async fn list_prepared(&self) -> Result<Vec<PreparedTx>> {
        self.inner.list_prepared().await
    }

    async fn create_user(&self, id: UserId) -> Result<()> {
        self.inner.create_user(id).await
    }

    async fn delete_user(&self, id: UserId) -> Result<u64> {
        self.inner.delete_user(id).await
    }

    async fn user_segments(&self, id: UserId) -> Result<Option<Vec<Segment>>> {
        let segments = self.inner.user_segments(id).await;
        let gate = self.read_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }
        segments
    }

    async fn segment_stats(&self, id: &str) -> Result<Option<SegmentInfo>> {
        self.inner.segment_stats(id).await
    }
}

/// Cache whose every call fails, to exercise the invalidation rules.
#[derive(Default)]
pub struct FailingCache;

fn cache_down() -> Error {
    Error::Cache("connection refused".into())
}

#[async_trait]
impl SegmentCache for FailingCache {
    async fn get(&self, _user: UserId) -> Result<Option<Vec<Segment>>> {
        Err(cache_down())
    }

    async fn generation(&self) -> Result<Generation> {
        Err(cache_down())
    }

    async fn set(
        &self,
        _user: UserId,
        _segments: &[Segment],
        _generation: Generation,
    ) -> Result<bool> {
        Err(cache_down())
    }

    async fn clear(&self) -> Result<()> {
        Err(cache_down())
    }
}

/// A shard set of `count` faulty memory shards.
pub struct Cluster {
    pub set: Arc<ShardSet>,
    pub faulty: Vec<Arc<FaultyShard>>,
    pub memory: Vec<Arc<MemoryShard>>,
}

impl Cluster {
    pub fn new(count: usize) -> Self {
        let memory: Vec<Arc<MemoryShard>> = (0..count)
            .map(|i| Arc::new(MemoryShard::with_seed(i, 42 + i as u64)))
            .collect();
        let faulty: Vec<Arc<FaultyShard>> = memory
            .iter()
            .map(|m| Arc::new(FaultyShard::new(m.clone())))
            .collect();
        let shards = faulty.iter().map(|f| f.clone() as Arc<dyn Shard>).collect();
        let set = Arc::new(ShardSet::new(shards).unwrap());
        Self {
            set,
            faulty,
            memory,
        }
    }

    pub fn coordinator(&self) -> SegmentCoordinator {
        SegmentCoordinator::new(self.set.clone(), SHARD_TIMEOUT)
    }

    pub fn state(&self) -> (GatewayState, Arc<dyn SegmentCache>) {
        let cache: Arc<dyn SegmentCache> =
            Arc::new(MemoryCache::new(Duration::from_secs(300), 10_000));
        (self.state_with_cache(cache.clone()), cache)
    }

    pub fn state_with_cache(&self, cache: Arc<dyn SegmentCache>) -> GatewayState {
        Gateway::state_from_parts(self.set.clone(), cache, SHARD_TIMEOUT)
    }

    /// Insert a committed segment row directly on one shard.
    pub async fn seed_segment(&self, shard: usize, id: &str, description: &str) {
        let statement = SegmentStatement::Insert(Segment::new(id, description));
        let tx_id = format!("tx_seed_{}_{}", shard, id);
        self.memory[shard].prepare(&tx_id, &statement).await.unwrap();
        self.memory[shard].commit_prepared(&tx_id).await.unwrap();
    }

    /// Create users `0..count`, each on its routed shard.
    pub async fn seed_users(&self, count: i64) {
        for user in 0..count {
            self.set.for_user(user).create_user(user).await.unwrap();
        }
    }

    pub fn prepared_total(&self) -> usize {
        self.memory.iter().map(|m| m.prepared_count()).sum()
    }

    pub fn holders(&self, id: &str) -> Vec<usize> {
        self.memory
            .iter()
            .enumerate()
            .filter(|(_, m)| m.segment(id).is_some())
            .map(|(i, _)| i)
            .collect()
    }
}
