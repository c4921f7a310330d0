//! Common utilities and types shared across the gateway

pub mod config;
pub mod error;
pub mod tracing_middleware;
pub mod utils;

pub use config::{
    CacheBackend, CacheConfig, GatewayConfig, HttpConfig, ShardBackend, ShardEndpoint,
    ShardsConfig,
};
pub use error::{classify, Error, ErrorKind, PublicError, Result};
pub use utils::{generate_tx_id, parse_duration, validate_segment_id, validate_tx_id};
