//! HTTP API tests driven through the router without a socket

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{Cluster, Fault};
use segmentation_gateway::coordinator::http::create_router;
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(cluster: &Cluster) -> Router {
    let (state, _) = cluster.state();
    create_router(state, 64 * 1024)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_segment_endpoints() {
    let cluster = Cluster::new(2);
    let app = router(&cluster);

    let (status, body) = call(
        &app,
        "POST",
        "/segments",
        Some(json!({"id": "S", "description": "d1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], "S");

    let (status, body) = call(
        &app,
        "POST",
        "/segments",
        Some(json!({"id": "S", "description": "again"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ALREADY_EXISTS");

    let (status, _) = call(
        &app,
        "PUT",
        "/segments/S",
        Some(json!({"description": "d2"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, "GET", "/segments/S", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["description"], "d2");
    assert_eq!(body["users_num"], 0);

    let (status, _) = call(&app, "DELETE", "/segments/S", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, "GET", "/segments/S", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "segment not found");
}

#[tokio::test]
async fn test_distribute_and_user_segments() {
    let cluster = Cluster::new(2);
    let app = router(&cluster);

    for id in 0..6 {
        let (status, _) = call(&app, "POST", "/users", Some(json!({ "id": id }))).await;
        assert_eq!(status, StatusCode::CREATED);
    }
    call(
        &app,
        "POST",
        "/segments",
        Some(json!({"id": "S", "description": "d"})),
    )
    .await;

    let (status, body) = call(
        &app,
        "POST",
        "/segments/S/distribute",
        Some(json!({"percentage": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_ARGUMENT");

    let (status, _) = call(
        &app,
        "POST",
        "/segments/S/distribute",
        Some(json!({"percentage": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, "GET", "/users/4/segments", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["segments"], json!([{"id": "S", "description": "d"}]));

    let (status, _) = call(&app, "DELETE", "/users/4", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&app, "GET", "/users/4/segments", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_events_endpoint() {
    let cluster = Cluster::new(2);
    let app = router(&cluster);

    let (status, body) = call(&app, "POST", "/events/create-user", Some(json!({"id": 3}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], true);
    assert_eq!(cluster.memory[1].user_count(), 1);

    let (status, body) = call(&app, "POST", "/events/rename-user", Some(json!({"id": 3}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["applied"], false);
}

#[tokio::test]
async fn test_internal_errors_are_opaque() {
    let cluster = Cluster::new(2);
    cluster.faulty[1].inject(Fault::FailPrepare);
    let app = router(&cluster);

    let (status, body) = call(
        &app,
        "POST",
        "/segments",
        Some(json!({"id": "S", "description": "d"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "internal server error");
    assert_eq!(body["code"], "INTERNAL");
}

#[tokio::test]
async fn test_health_and_request_id() {
    let cluster = Cluster::new(3);
    let app = router(&cluster);

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["shards"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_admin_prepared_endpoints() {
    let cluster = Cluster::new(2);
    let app = router(&cluster);

    let (status, body) = call(&app, "GET", "/admin/prepared", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);

    let (status, _) = call(
        &app,
        "POST",
        "/admin/prepared/resolve",
        Some(json!({"tx_id": "tx_missing", "resolution": "rollback"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
