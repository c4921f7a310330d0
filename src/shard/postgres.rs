//! Postgres shard backend
//!
//! Segment-wide writes use Postgres' two-phase commit primitives:
//! `BEGIN` → statement → `PREPARE TRANSACTION '<tx>'`, later resolved with
//! `COMMIT PREPARED` / `ROLLBACK PREPARED`. The server must run with
//! `max_prepared_transactions > 0`.

use crate::common::{validate_tx_id, Error, Result};
use crate::coordinator::sampler;
use crate::domain::{Segment, SegmentInfo, UserId};
use crate::shard::{PreparedTx, SegmentStatement, Shard, StatementOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{Executor, PgPool, Postgres};
use std::time::Duration;

const UNIQUE_VIOLATION: &str = "23505";
const UNDEFINED_OBJECT: &str = "42704";

/// Per-shard schema. Memberships cascade with their user and segment.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS segments (
    id          TEXT PRIMARY KEY,
    description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS users (
    id BIGINT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS users_segments (
    user_id    BIGINT NOT NULL REFERENCES users (id) ON DELETE CASCADE,
    segment_id TEXT   NOT NULL REFERENCES segments (id) ON DELETE CASCADE,
    PRIMARY KEY (user_id, segment_id)
);

CREATE INDEX IF NOT EXISTS users_segments_segment_idx ON users_segments (segment_id);
"#;

const DISTRIBUTE_SQL: &str = r#"
WITH
target_limit AS (
    SELECT COUNT(*) * $2 / 100 AS max_count FROM users
),
users_to_add AS (
    SELECT id FROM users TABLESAMPLE BERNOULLI ($3)
),
users_to_add_limited AS (
    SELECT id FROM users_to_add
    ORDER BY random()
    LIMIT (SELECT max_count FROM target_limit)
)
INSERT INTO users_segments (user_id, segment_id)
SELECT id, $1 FROM users_to_add_limited
"#;

const SEGMENT_STATS_SQL: &str = r#"
WITH
cnt AS (
    SELECT COUNT(*) AS users_count FROM users_segments WHERE segment_id = $1
),
info AS (
    SELECT id, description FROM segments WHERE id = $1
)
SELECT info.id, info.description, cnt.users_count
FROM cnt JOIN info ON TRUE
"#;

/// Opens the transaction a prepare runs in. A zero timeout would disable
/// the server-side limit, hence the floor of 1ms.
fn begin_sql(statement_timeout: Duration) -> String {
    format!(
        "BEGIN; SET LOCAL statement_timeout = {}",
        statement_timeout.as_millis().max(1)
    )
}

/// Pooled connection on which a raw `BEGIN` was issued. Unless the
/// transaction was settled (prepared or rolled back), the connection is
/// closed on drop instead of returning to the pool; the server then rolls
/// back whatever the session left open. This covers prepares abandoned by
/// a caller deadline.
struct OpenTx {
    conn: PoolConnection<Postgres>,
    settled: bool,
}

impl Drop for OpenTx {
    fn drop(&mut self) {
        if !self.settled {
            self.conn.close_on_drop();
        }
    }
}

/// Shard backed by one Postgres database.
pub struct PgShard {
    index: usize,
    name: String,
    pool: PgPool,
    /// Server-side cap on every statement of a prepare, so work the caller
    /// stopped waiting for is cancelled by the server too.
    statement_timeout: Duration,
}

impl PgShard {
    /// Build the connection pool without connecting yet. `statement_timeout`
    /// bounds pool acquisition and each statement of a prepare.
    pub fn connect_lazy(
        index: usize,
        name: &str,
        dsn: &str,
        max_connections: u32,
        statement_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(0)
            .acquire_timeout(statement_timeout)
            .idle_timeout(Duration::from_secs(60))
            .connect_lazy(dsn)
            .map_err(|e| Error::InvalidConfig(format!("shard {}: {}", name, e)))?;

        tracing::info!(shard = index, name, max_connections, "shard pool configured");

        Ok(Self {
            index,
            name: name.to_string(),
            pool,
            statement_timeout,
        })
    }

    /// Create the shard tables if they are missing.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| self.classify(e))?;
        tracing::info!(shard = self.index, name = %self.name, "schema applied");
        Ok(())
    }

    /// Translate a driver error, keeping the shard in context.
    fn classify(&self, err: sqlx::Error) -> Error {
        let shard = self.index;
        match &err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Error::UniqueViolation { shard }
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => Error::ShardUnavailable {
                shard,
                reason: err.to_string(),
            },
            _ => Error::Statement {
                shard,
                reason: err.to_string(),
            },
        }
    }

    fn is_undefined_object(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNDEFINED_OBJECT))
    }

    async fn run_statement(
        &self,
        conn: &mut PgConnection,
        statement: &SegmentStatement,
    ) -> Result<StatementOutcome> {
        match statement {
            SegmentStatement::Insert(segment) => {
                let result = sqlx::query("INSERT INTO segments (id, description) VALUES ($1, $2)")
                    .bind(&segment.id)
                    .bind(&segment.description)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| self.classify(e))?;
                Ok(StatementOutcome {
                    rows_affected: result.rows_affected(),
                    segment_present: true,
                })
            }
            SegmentStatement::Delete(id) => {
                let result = sqlx::query("DELETE FROM segments WHERE id = $1")
                    .bind(id)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| self.classify(e))?;
                Ok(StatementOutcome {
                    rows_affected: result.rows_affected(),
                    segment_present: result.rows_affected() > 0,
                })
            }
            SegmentStatement::Update { id, patch } => {
                let result = sqlx::query(
                    "UPDATE segments SET description = COALESCE($1, description) WHERE id = $2",
                )
                .bind(patch.description.as_deref())
                .bind(id)
                .execute(&mut *conn)
                .await
                .map_err(|e| self.classify(e))?;
                Ok(StatementOutcome {
                    rows_affected: result.rows_affected(),
                    segment_present: result.rows_affected() > 0,
                })
            }
            SegmentStatement::Distribute { id, percentage } => {
                let present: bool =
                    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM segments WHERE id = $1)")
                        .bind(id)
                        .fetch_one(&mut *conn)
                        .await
                        .map_err(|e| self.classify(e))?;
                if !present {
                    return Ok(StatementOutcome::default());
                }

                let result = sqlx::query(DISTRIBUTE_SQL)
                    .bind(id)
                    .bind(i64::from(percentage.get()))
                    .bind(f32::from(sampler::oversample_percent(*percentage)))
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| self.classify(e))?;
                Ok(StatementOutcome {
                    rows_affected: result.rows_affected(),
                    segment_present: true,
                })
            }
        }
    }
}

#[async_trait]
impl Shard for PgShard {
    fn index(&self) -> usize {
        self.index
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::ShardUnavailable {
                shard: self.index,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn prepare(
        &self,
        tx_id: &str,
        statement: &SegmentStatement,
    ) -> Result<StatementOutcome> {
        validate_tx_id(tx_id)?;
        let conn = self.pool.acquire().await.map_err(|e| self.classify(e))?;
        let mut tx = OpenTx {
            conn,
            settled: false,
        };

        let begin = begin_sql(self.statement_timeout);
        (&mut *tx.conn)
            .execute(sqlx::raw_sql(&begin))
            .await
            .map_err(|e| self.classify(e))?;

        let outcome = match self.run_statement(&mut tx.conn, statement).await {
            Ok(outcome) => outcome,
            Err(err) => {
                match (&mut *tx.conn).execute(sqlx::raw_sql("ROLLBACK")).await {
                    Ok(_) => tx.settled = true,
                    Err(rollback_err) => tracing::warn!(
                        shard = self.index,
                        tx_id,
                        error = %rollback_err,
                        "local rollback failed, discarding connection"
                    ),
                }
                return Err(err);
            }
        };

        let prepare_sql = format!("PREPARE TRANSACTION '{}'", tx_id);
        (&mut *tx.conn)
            .execute(sqlx::raw_sql(&prepare_sql))
            .await
            .map_err(|e| Error::ShardPrepareFailed {
                shard: self.index,
                tx_id: tx_id.to_string(),
                reason: e.to_string(),
            })?;
        tx.settled = true;

        tracing::debug!(
            shard = self.index,
            tx_id,
            statement = statement.name(),
            rows = outcome.rows_affected,
            "transaction prepared"
        );
        Ok(outcome)
    }

    async fn commit_prepared(&self, tx_id: &str) -> Result<()> {
        validate_tx_id(tx_id)?;
        let sql = format!("COMMIT PREPARED '{}'", tx_id);
        match sqlx::raw_sql(&sql).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(e) if Self::is_undefined_object(&e) => Err(Error::UnknownTransaction {
                shard: self.index,
                tx_id: tx_id.to_string(),
            }),
            Err(e) => Err(self.classify(e)),
        }
    }

    async fn rollback_prepared(&self, tx_id: &str) -> Result<()> {
        validate_tx_id(tx_id)?;
        let sql = format!("ROLLBACK PREPARED '{}'", tx_id);
        match sqlx::raw_sql(&sql).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(e) if Self::is_undefined_object(&e) => Err(Error::UnknownTransaction {
                shard: self.index,
                tx_id: tx_id.to_string(),
            }),
            Err(e) => Err(Error::ShardRollbackFailed {
                shard: self.index,
                tx_id: tx_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn list_prepared(&self) -> Result<Vec<PreparedTx>> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT gid, prepared FROM pg_prepared_xacts \
             WHERE database = current_database() AND gid LIKE 'tx\\_%' \
             ORDER BY prepared",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.classify(e))?;

        Ok(rows
            .into_iter()
            .map(|(tx_id, prepared_at)| PreparedTx {
                shard: self.index,
                tx_id,
                prepared_at,
            })
            .collect())
    }

    async fn create_user(&self, id: UserId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| self.classify(e))?;
        let inserted = sqlx::query("INSERT INTO users (id) VALUES ($1)")
            .bind(id)
            .execute(&mut *tx)
            .await;
        match inserted.map_err(|e| self.classify(e)) {
            Ok(_) => {}
            Err(Error::UniqueViolation { .. }) => return Err(Error::UserExists),
            Err(e) => return Err(e),
        }
        tx.commit().await.map_err(|e| self.classify(e))?;
        Ok(())
    }

    async fn delete_user(&self, id: UserId) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(|e| self.classify(e))?;
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.classify(e))?;
        tx.commit().await.map_err(|e| self.classify(e))?;
        Ok(result.rows_affected())
    }

    async fn user_segments(&self, id: UserId) -> Result<Option<Vec<Segment>>> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.classify(e))?;
        if !exists {
            return Ok(None);
        }

        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT seg.id, seg.description \
             FROM users_segments us \
             JOIN segments seg ON us.segment_id = seg.id \
             WHERE us.user_id = $1 \
             ORDER BY seg.id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.classify(e))?;

        Ok(Some(
            rows.into_iter()
                .map(|(id, description)| Segment { id, description })
                .collect(),
        ))
    }

    async fn segment_stats(&self, id: &str) -> Result<Option<SegmentInfo>> {
        let row: Option<(String, String, i64)> = sqlx::query_as(SEGMENT_STATS_SQL)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.classify(e))?;

        Ok(row.map(|(id, description, users_num)| SegmentInfo {
            id,
            description,
            users_num,
        }))
    }
}
