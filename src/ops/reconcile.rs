//! Resolve prepared transactions left behind by a crashed gateway
//!
//! A gateway that dies between prepare and commit leaves transactions
//! parked on shards, holding locks on the segment rows they touched.
//! Nothing resolves them automatically: an operator lists them and then
//! commits or rolls back each id on every shard that still has it.

use crate::common::{validate_tx_id, Error, Result};
use crate::shard::{bounded, PreparedTx, ShardSet};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Commit,
    Rollback,
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "commit" => Ok(Resolution::Commit),
            "rollback" => Ok(Resolution::Rollback),
            other => Err(Error::InvalidArgument(format!(
                "resolution must be commit or rollback, got {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Commit => write!(f, "commit"),
            Resolution::Rollback => write!(f, "rollback"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolveReport {
    pub tx_id: String,
    /// Shards where the transaction was found and resolved
    pub resolved: Vec<usize>,
    /// Shards with no such prepared transaction
    pub missing: Vec<usize>,
}

/// Every gateway-issued prepared transaction on every shard, oldest first.
pub async fn list_orphans(shards: &ShardSet, deadline: Duration) -> Result<Vec<PreparedTx>> {
    let mut orphans = Vec::new();
    for shard in shards.all() {
        let pending = bounded(shard.index(), deadline, shard.list_prepared()).await?;
        orphans.extend(pending);
    }
    orphans.sort_by(|a, b| a.prepared_at.cmp(&b.prepared_at));
    Ok(orphans)
}

/// Commit or roll back `tx_id` on every shard that still holds it.
///
/// Stops at the first shard that fails for a reason other than the
/// transaction being absent; shards resolved so far stay resolved.
pub async fn resolve(
    shards: &ShardSet,
    tx_id: &str,
    resolution: Resolution,
    deadline: Duration,
) -> Result<ResolveReport> {
    validate_tx_id(tx_id)?;

    let mut report = ResolveReport {
        tx_id: tx_id.to_string(),
        ..Default::default()
    };

    for shard in shards.all() {
        let index = shard.index();
        let outcome = match resolution {
            Resolution::Commit => bounded(index, deadline, shard.commit_prepared(tx_id)).await,
            Resolution::Rollback => bounded(index, deadline, shard.rollback_prepared(tx_id)).await,
        };
        match outcome {
            Ok(()) => report.resolved.push(index),
            Err(Error::UnknownTransaction { .. }) => report.missing.push(index),
            Err(err) => {
                warn!(%tx_id, shard = index, %resolution, error = %err, "resolve failed");
                return Err(err);
            }
        }
    }

    if report.resolved.is_empty() {
        warn!(%tx_id, "no shard holds this prepared transaction");
    } else {
        info!(
            %tx_id,
            %resolution,
            resolved = ?report.resolved,
            "prepared transaction resolved"
        );
    }
    Ok(report)
}
