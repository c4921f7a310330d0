//! # segmentation-gateway
//!
//! A user segmentation gateway over N independently owned database shards:
//! - Users live on exactly one shard (`user_id mod N`)
//! - Segment metadata is replicated on every shard and written with
//!   two-phase commit (prepare everywhere, then commit everywhere)
//! - Segment statistics are read scatter-gather and merged
//! - Distribution adds a percentage of each shard's users to a segment
//! - Per-user segment lists are cached with a TTL and flushed on any write
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!            HTTP API / user events
//!                     │
//! ┌───────────────────▼─────────────────────┐
//! │  SegmentationService / UsersService     │──── segment cache
//! │   SegmentCoordinator (2PC)              │     (moka | redis)
//! │   aggregate reader · shard router       │
//! └───────┬──────────────┬──────────────┬───┘
//!         │              │              │
//!   ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!   │ Shard 0   │  │ Shard 1   │  │ Shard 2   │
//!   │ users 3k  │  │ users 3k+1│  │ users 3k+2│
//!   │ +segments │  │ +segments │  │ +segments │
//!   └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Apply the schema to every configured Postgres shard
//! segmentd --config gateway.toml migrate
//!
//! # Start the gateway
//! segmentd --config gateway.toml serve
//!
//! # Inspect and resolve prepared transactions left by a crash
//! segmentd --config gateway.toml prepared list
//! segmentd --config gateway.toml prepared resolve tx_3f2a... rollback
//! ```

pub mod cache;
pub mod common;
pub mod coordinator;
pub mod domain;
pub mod events;
pub mod ops;
pub mod service;
pub mod shard;

// Re-export commonly used types
pub use common::{Error, ErrorKind, GatewayConfig, PublicError, Result};
pub use coordinator::{Gateway, SegmentCoordinator};
pub use domain::{Percentage, Segment, SegmentInfo, SegmentPatch, UserId};
pub use shard::{Shard, ShardSet};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
