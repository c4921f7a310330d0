//! HTTP API for the gateway
//!
//! Public endpoints:
//! - `POST /segments`, `GET|PUT|DELETE /segments/:id`
//! - `POST /segments/:id/distribute`
//! - `GET /users/:id/segments`, `POST /users`, `DELETE /users/:id`
//! - `POST /events/:topic` (user lifecycle events)
//! - `GET /health`
//!
//! Admin endpoints:
//! - `GET /admin/prepared`: prepared transactions still parked on shards
//! - `POST /admin/prepared/resolve`: commit or roll one back by id
//!
//! Error bodies are `{"error": <public message>, "code": <status code>}`.

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, PublicError};
use crate::domain::{Segment, SegmentPatch, UserId};
use crate::events::{EventOutcome, UserEventHandler};
use crate::ops::reconcile::{self, Resolution};
use crate::service::{SegmentationService, UsersService};
use crate::shard::ShardSet;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

/// Shared gateway state for HTTP handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub segmentation: Arc<SegmentationService>,
    pub users: Arc<UsersService>,
    pub events: Arc<UserEventHandler>,
    pub shards: Arc<ShardSet>,
    pub shard_timeout: Duration,
}

impl IntoResponse for PublicError {
    fn into_response(self) -> Response {
        let status = self.kind.to_http_status();
        let body = Json(json!({
            "error": self.message,
            "code": self.kind.code(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, PublicError>;

#[derive(Debug, Deserialize)]
struct DistributeRequest {
    percentage: i64,
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    id: UserId,
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    tx_id: String,
    resolution: Resolution,
}

/// Creates the HTTP router with all endpoints.
pub fn create_router(state: GatewayState, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        // Segments
        .route("/segments", post(create_segment))
        .route(
            "/segments/:id",
            get(get_segment_info)
                .put(update_segment)
                .delete(delete_segment),
        )
        .route("/segments/:id/distribute", post(distribute_segment))
        // Users
        .route("/users", post(create_user))
        .route("/users/:id", axum::routing::delete(delete_user))
        .route("/users/:id/segments", get(get_user_segments))
        // User lifecycle events
        .route("/events/:topic", post(handle_event))
        // Reconciliation
        .route("/admin/prepared", get(admin_list_prepared))
        .route("/admin/prepared/resolve", post(admin_resolve_prepared))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(request_tracing_middleware))
                .layer(RequestBodyLimitLayer::new(body_limit_bytes)),
        )
        .with_state(state)
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    let mut shards = Vec::with_capacity(state.shards.len());
    let mut healthy = true;
    for shard in state.shards.all() {
        let ok = crate::shard::bounded(shard.index(), state.shard_timeout, shard.ping())
            .await
            .is_ok();
        healthy &= ok;
        shards.push(json!({
            "index": shard.index(),
            "name": shard.name(),
            "healthy": ok,
        }));
    }

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "shards": shards,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

async fn create_segment(
    State(state): State<GatewayState>,
    Json(segment): Json<Segment>,
) -> ApiResult<impl IntoResponse> {
    let id = state.segmentation.create_segment(segment).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn update_segment(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Json(patch): Json<SegmentPatch>,
) -> ApiResult<impl IntoResponse> {
    let id = state.segmentation.update_segment(&id, patch).await?;
    Ok(Json(json!({ "id": id })))
}

async fn delete_segment(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = state.segmentation.delete_segment(&id).await?;
    Ok(Json(json!({ "id": id })))
}

async fn get_segment_info(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let info = state.segmentation.get_segment_info(&id).await?;
    Ok(Json(info))
}

async fn distribute_segment(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Json(req): Json<DistributeRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = state
        .segmentation
        .distribute_segment(&id, req.percentage)
        .await?;
    Ok(Json(json!({ "id": id })))
}

async fn get_user_segments(
    State(state): State<GatewayState>,
    Path(user): Path<UserId>,
) -> ApiResult<impl IntoResponse> {
    let segments = state.segmentation.get_user_segments(user).await?;
    Ok(Json(json!({ "segments": segments })))
}

async fn create_user(
    State(state): State<GatewayState>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = state.users.create_user(req.id).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn delete_user(
    State(state): State<GatewayState>,
    Path(user): Path<UserId>,
) -> ApiResult<impl IntoResponse> {
    let id = state.users.delete_user(user).await?;
    Ok(Json(json!({ "id": id })))
}

async fn handle_event(
    State(state): State<GatewayState>,
    Path(topic): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.events.handle(&topic, &body).await?;
    let status = match outcome {
        EventOutcome::Applied => StatusCode::OK,
        EventOutcome::Ignored => StatusCode::ACCEPTED,
    };
    let applied = outcome == EventOutcome::Applied;
    Ok((status, Json(json!({ "topic": topic, "applied": applied }))))
}

async fn admin_list_prepared(State(state): State<GatewayState>) -> ApiResult<impl IntoResponse> {
    let prepared = reconcile::list_orphans(&state.shards, state.shard_timeout)
        .await
        .map_err(PublicError::from)?;
    Ok(Json(json!({
        "count": prepared.len(),
        "prepared": prepared,
    })))
}

async fn admin_resolve_prepared(
    State(state): State<GatewayState>,
    Json(req): Json<ResolveRequest>,
) -> ApiResult<impl IntoResponse> {
    let report = reconcile::resolve(
        &state.shards,
        &req.tx_id,
        req.resolution,
        state.shard_timeout,
    )
    .await
    .map_err(PublicError::from)?;

    if report.resolved.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "no shard holds prepared transaction {}",
            req.tx_id
        ))
        .into());
    }
    Ok(Json(report))
}
