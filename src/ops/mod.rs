//! Ops commands for shard maintenance

pub mod reconcile;

pub use reconcile::{list_orphans, resolve, Resolution, ResolveReport};
