//! Gateway server

use crate::cache;
use crate::common::{GatewayConfig, Result};
use crate::coordinator::http::{create_router, GatewayState};
use crate::coordinator::SegmentCoordinator;
use crate::events::UserEventHandler;
use crate::service::{SegmentationService, UsersService};
use crate::shard::ShardSet;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct Gateway {
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Wire shards, cache and services together. Every shard must answer a
    /// ping before this returns.
    pub async fn build_state(&self) -> Result<GatewayState> {
        let shard_timeout = self.config.shards.statement_timeout();
        let shards = Arc::new(ShardSet::from_config(&self.config.shards)?);
        shards.ping_all(shard_timeout).await?;

        let cache = cache::from_config(&self.config.cache).await?;
        Ok(Self::state_from_parts(shards, cache, shard_timeout))
    }

    /// Assemble handler state from an existing shard set and cache.
    pub fn state_from_parts(
        shards: Arc<ShardSet>,
        cache: Arc<dyn cache::SegmentCache>,
        shard_timeout: std::time::Duration,
    ) -> GatewayState {
        let coordinator = Arc::new(SegmentCoordinator::new(shards.clone(), shard_timeout));
        let segmentation = Arc::new(SegmentationService::new(coordinator, cache.clone()));
        let users = Arc::new(UsersService::new(shards.clone(), cache, shard_timeout));
        let events = Arc::new(UserEventHandler::new(users.clone()));

        GatewayState {
            segmentation,
            users,
            events,
            shards,
            shard_timeout,
        }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting gateway: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", self.config.http.bind_addr);
        tracing::info!(
            "  Shards: {} ({:?})",
            self.config.shards.count,
            self.config.shards.backend
        );
        tracing::info!("  Cache: {:?}", self.config.cache.backend);

        let state = self.build_state().await?;
        let router = create_router(state, self.config.http.body_limit_bytes);

        let listener = tokio::net::TcpListener::bind(self.config.http.bind_addr).await?;
        tracing::info!("✓ Gateway ready");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        tracing::info!("Gateway stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
