//! Shard coordination layer
//!
//! - Routing of user-scoped operations (`user_id mod N`)
//! - Segment-wide writes as two-phase commit across every shard
//! - Scatter-gather segment statistics
//! - Per-shard distribution sampling
//! - The HTTP gateway in front of it all

pub mod aggregate;
pub mod http;
pub mod placement;
pub mod sampler;
pub mod server;
pub mod transaction;

pub use aggregate::{collect_segment_info, merge_segment_info, ShardRead};
pub use placement::ShardRouter;
pub use server::Gateway;
pub use transaction::{CommitReport, SegmentCoordinator};
