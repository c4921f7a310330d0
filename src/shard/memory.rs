//! In-process shard backend
//!
//! Keeps the three shard tables (`segments`, `users`, `users_segments`) in
//! memory and implements named prepared transactions: a prepared write is
//! staged under its transaction id and only touches the tables on commit.
//! Uniqueness is checked against committed rows and against rows staged by
//! other prepared transactions, the way a row lock would block them.

use crate::common::{Error, Result};
use crate::coordinator::sampler;
use crate::domain::{Segment, SegmentInfo, UserId};
use crate::shard::{PreparedTx, SegmentStatement, Shard, StatementOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Tables {
    /// segment id → description
    segments: BTreeMap<String, String>,
    users: BTreeSet<UserId>,
    /// (user_id, segment_id)
    memberships: BTreeSet<(UserId, String)>,
}

impl Tables {
    fn delete_segment(&mut self, id: &str) {
        if self.segments.remove(id).is_some() {
            self.memberships.retain(|(_, segment)| segment != id);
        }
    }

    fn delete_user(&mut self, id: UserId) -> bool {
        let removed = self.users.remove(&id);
        if removed {
            self.memberships.retain(|(user, _)| *user != id);
        }
        removed
    }
}

#[derive(Debug, Clone)]
enum Change {
    InsertSegment(Segment),
    DeleteSegment(String),
    UpdateSegment { id: String, description: String },
    AddMembers { segment: String, users: Vec<UserId> },
}

#[derive(Debug)]
struct PreparedWrite {
    change: Option<Change>,
    prepared_at: DateTime<Utc>,
}

struct State {
    tables: Tables,
    prepared: HashMap<String, PreparedWrite>,
    rng: StdRng,
}

impl State {
    fn staged(&self) -> impl Iterator<Item = &Change> {
        self.prepared.values().filter_map(|p| p.change.as_ref())
    }

    fn apply(&mut self, change: Change) {
        match change {
            Change::InsertSegment(segment) => {
                self.tables.segments.insert(segment.id, segment.description);
            }
            Change::DeleteSegment(id) => self.tables.delete_segment(&id),
            Change::UpdateSegment { id, description } => {
                if let Some(current) = self.tables.segments.get_mut(&id) {
                    *current = description;
                }
            }
            Change::AddMembers { segment, users } => {
                // Rows of users or segments deleted meanwhile are dropped,
                // as a foreign key would have blocked them.
                if !self.tables.segments.contains_key(&segment) {
                    return;
                }
                for user in users {
                    if self.tables.users.contains(&user) {
                        self.tables.memberships.insert((user, segment.clone()));
                    }
                }
            }
        }
    }
}

/// Shard backed by in-memory tables.
pub struct MemoryShard {
    index: usize,
    name: String,
    state: Mutex<State>,
}

impl MemoryShard {
    pub fn new(index: usize) -> Self {
        Self::with_rng(index, StdRng::from_entropy())
    }

    /// Shard whose distribution sampling is reproducible.
    pub fn with_seed(index: usize, seed: u64) -> Self {
        Self::with_rng(index, StdRng::seed_from_u64(seed))
    }

    fn with_rng(index: usize, rng: StdRng) -> Self {
        Self {
            index,
            name: format!("memory-{}", index),
            state: Mutex::new(State {
                tables: Tables::default(),
                prepared: HashMap::new(),
                rng,
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal(format!("shard {} state poisoned", self.index)))
    }

    /// Committed segment row, if any.
    pub fn segment(&self, id: &str) -> Option<Segment> {
        let state = self.lock().ok()?;
        state
            .tables
            .segments
            .get(id)
            .map(|description| Segment::new(id, description.clone()))
    }

    /// Committed membership rows for `segment`.
    pub fn member_count(&self, segment: &str) -> usize {
        self.lock()
            .map(|state| {
                state
                    .tables
                    .memberships
                    .iter()
                    .filter(|(_, s)| s == segment)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn user_count(&self) -> usize {
        self.lock().map(|state| state.tables.users.len()).unwrap_or(0)
    }

    pub fn prepared_count(&self) -> usize {
        self.lock().map(|state| state.prepared.len()).unwrap_or(0)
    }

    fn stage(
        &self,
        state: &mut State,
        statement: &SegmentStatement,
    ) -> Result<(Option<Change>, StatementOutcome)> {
        match statement {
            SegmentStatement::Insert(segment) => {
                let staged_elsewhere = state.staged().any(
                    |c| matches!(c, Change::InsertSegment(s) if s.id == segment.id),
                );
                if state.tables.segments.contains_key(&segment.id) || staged_elsewhere {
                    return Err(Error::UniqueViolation { shard: self.index });
                }
                Ok((
                    Some(Change::InsertSegment(segment.clone())),
                    StatementOutcome {
                        rows_affected: 1,
                        segment_present: true,
                    },
                ))
            }
            SegmentStatement::Delete(id) => {
                if !state.tables.segments.contains_key(id) {
                    return Ok((None, StatementOutcome::default()));
                }
                Ok((
                    Some(Change::DeleteSegment(id.clone())),
                    StatementOutcome {
                        rows_affected: 1,
                        segment_present: true,
                    },
                ))
            }
            SegmentStatement::Update { id, patch } => {
                let Some(current) = state.tables.segments.get(id) else {
                    return Ok((None, StatementOutcome::default()));
                };
                let description = patch
                    .description
                    .clone()
                    .unwrap_or_else(|| current.clone());
                Ok((
                    Some(Change::UpdateSegment {
                        id: id.clone(),
                        description,
                    }),
                    StatementOutcome {
                        rows_affected: 1,
                        segment_present: true,
                    },
                ))
            }
            SegmentStatement::Distribute { id, percentage } => {
                if !state.tables.segments.contains_key(id) {
                    return Ok((None, StatementOutcome::default()));
                }
                let users: Vec<UserId> = state.tables.users.iter().copied().collect();
                let sample = sampler::sample_users(&users, *percentage, &mut state.rng);

                let collides = sample.iter().any(|user| {
                    state.tables.memberships.contains(&(*user, id.clone()))
                        || state.staged().any(|c| {
                            matches!(c, Change::AddMembers { segment, users }
                                if segment == id && users.contains(user))
                        })
                });
                if collides {
                    return Err(Error::UniqueViolation { shard: self.index });
                }

                let outcome = StatementOutcome {
                    rows_affected: sample.len() as u64,
                    segment_present: true,
                };
                Ok((
                    Some(Change::AddMembers {
                        segment: id.clone(),
                        users: sample,
                    }),
                    outcome,
                ))
            }
        }
    }
}

#[async_trait]
impl Shard for MemoryShard {
    fn index(&self) -> usize {
        self.index
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    async fn prepare(
        &self,
        tx_id: &str,
        statement: &SegmentStatement,
    ) -> Result<StatementOutcome> {
        let mut state = self.lock()?;
        if state.prepared.contains_key(tx_id) {
            return Err(Error::ShardPrepareFailed {
                shard: self.index,
                tx_id: tx_id.to_string(),
                reason: "transaction identifier already in use".into(),
            });
        }

        // Nothing is applied until commit, so a failed statement needs no undo.
        let (change, outcome) = self.stage(&mut state, statement)?;
        state.prepared.insert(
            tx_id.to_string(),
            PreparedWrite {
                change,
                prepared_at: Utc::now(),
            },
        );
        Ok(outcome)
    }

    async fn commit_prepared(&self, tx_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        let prepared = state
            .prepared
            .remove(tx_id)
            .ok_or_else(|| Error::UnknownTransaction {
                shard: self.index,
                tx_id: tx_id.to_string(),
            })?;
        if let Some(change) = prepared.change {
            state.apply(change);
        }
        Ok(())
    }

    async fn rollback_prepared(&self, tx_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        state
            .prepared
            .remove(tx_id)
            .map(|_| ())
            .ok_or_else(|| Error::UnknownTransaction {
                shard: self.index,
                tx_id: tx_id.to_string(),
            })
    }

    async fn list_prepared(&self) -> Result<Vec<PreparedTx>> {
        let state = self.lock()?;
        let mut pending: Vec<PreparedTx> = state
            .prepared
            .iter()
            .map(|(tx_id, write)| PreparedTx {
                shard: self.index,
                tx_id: tx_id.clone(),
                prepared_at: write.prepared_at,
            })
            .collect();
        pending.sort_by(|a, b| a.prepared_at.cmp(&b.prepared_at));
        Ok(pending)
    }

    async fn create_user(&self, id: UserId) -> Result<()> {
        let mut state = self.lock()?;
        if !state.tables.users.insert(id) {
            return Err(Error::UserExists);
        }
        Ok(())
    }

    async fn delete_user(&self, id: UserId) -> Result<u64> {
        let mut state = self.lock()?;
        Ok(u64::from(state.tables.delete_user(id)))
    }

    async fn user_segments(&self, id: UserId) -> Result<Option<Vec<Segment>>> {
        let state = self.lock()?;
        if !state.tables.users.contains(&id) {
            return Ok(None);
        }
        let segments = state
            .tables
            .memberships
            .range((id, String::new())..)
            .take_while(|(user, _)| *user == id)
            .filter_map(|(_, segment)| {
                state
                    .tables
                    .segments
                    .get(segment)
                    .map(|description| Segment::new(segment.clone(), description.clone()))
            })
            .collect();
        Ok(Some(segments))
    }

    async fn segment_stats(&self, id: &str) -> Result<Option<SegmentInfo>> {
        let state = self.lock()?;
        let Some(description) = state.tables.segments.get(id) else {
            return Ok(None);
        };
        let users_num = state
            .tables
            .memberships
            .iter()
            .filter(|(_, segment)| segment == id)
            .count() as i64;
        Ok(Some(SegmentInfo {
            id: id.to_string(),
            description: description.clone(),
            users_num,
        }))
    }
}
