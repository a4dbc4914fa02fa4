//! Health router tests
//!
//! Drives the axum router with `oneshot` against a manager running on the
//! in-memory broker.

use amqp_worker::{
    health_router, ConsumerConfig, ConsumerManager, HealthState, MemoryBroker, NoOpProcessor,
};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt; // For oneshot()

async fn get(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn app(manager: &ConsumerManager<MemoryBroker>) -> axum::Router {
    health_router(HealthState::new(
        Arc::new(manager.clone()),
        "amqp-consumer",
        "0.1.0",
    ))
}

#[tokio::test]
async fn test_liveness_always_ok() {
    let manager = ConsumerManager::new(
        MemoryBroker::new(),
        NoOpProcessor,
        ConsumerConfig::new("memory://", "orders"),
    )
    .unwrap();

    for uri in ["/health", "/healthz"] {
        let (status, body) = get(app(&manager), uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["name"], "amqp-consumer");
    }
}

#[tokio::test]
async fn test_readiness_follows_manager_state() {
    let broker = MemoryBroker::new();
    let manager = ConsumerManager::new(
        broker.clone(),
        NoOpProcessor,
        ConsumerConfig::new("memory://", "orders").with_concurrent_consumers(2),
    )
    .unwrap();

    let (status, body) = get(app(&manager), "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["checks"]["manager"], "stopped");

    manager.start().await.unwrap();

    let (status, body) = get(app(&manager), "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["checks"]["workers"]["started"], 2);
    assert_eq!(body["queue"], "orders");

    manager.suspend().await.unwrap();

    let (status, body) = get(app(&manager), "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["checks"]["manager"], "suspended");

    manager.stop().await.unwrap();
}
