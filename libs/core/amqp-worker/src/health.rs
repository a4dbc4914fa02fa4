//! Health check handlers for AMQP consumers.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::broker::Broker;
use crate::manager::{ConsumerManager, ManagerStatus};
use crate::metrics;

/// Anything that can report a consumer status snapshot.
pub trait StatusSource: Send + Sync + 'static {
    fn status(&self) -> ManagerStatus;
}

impl<B: Broker> StatusSource for ConsumerManager<B> {
    fn status(&self) -> ManagerStatus {
        ConsumerManager::status(self)
    }
}

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Status source for readiness checks.
    pub source: Arc<dyn StatusSource>,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
}

impl HealthState {
    /// Create a new health state.
    pub fn new(
        source: Arc<dyn StatusSource>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            source,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: String,
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready once the manager is started, no reconnect is running and every
/// configured worker is consuming.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let status = state.source.status();
    let ready = status.is_ready();
    let body = json!({
        "status": if ready { "ready" } else { "not_ready" },
        "checks": {
            "manager": status.state,
            "connection": if status.connection_open { "ok" } else { "closed" },
            "reconnecting": status.reconnecting,
            "workers": {
                "configured": status.configured_workers,
                "started": status.started_workers,
            }
        },
        "queue": status.queue,
    });

    if ready {
        Ok((StatusCode::OK, Json(body)))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create a standard health router.
///
/// - `/health`, `/healthz` - Liveness probe
/// - `/ready`, `/readyz` - Readiness probe
/// - `/metrics` - Prometheus metrics
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerState;

    struct FixedStatus(ManagerStatus);

    impl StatusSource for FixedStatus {
        fn status(&self) -> ManagerStatus {
            self.0.clone()
        }
    }

    fn state(started_workers: Option<usize>, reconnecting: bool) -> HealthState {
        let status = ManagerStatus {
            state: ManagerState::Started,
            queue: "orders".to_string(),
            reconnecting,
            connection_open: true,
            configured_workers: 2,
            started_workers,
        };
        HealthState::new(Arc::new(FixedStatus(status)), "consumer", "1.0.0")
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            name: "test-consumer".to_string(),
            version: "1.0.0".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"name\":\"test-consumer\""));
    }

    #[tokio::test]
    async fn test_ready_when_all_workers_started() {
        let (code, Json(body)) = ready_handler(State(state(Some(2), false))).await.unwrap();
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["checks"]["manager"], "started");
    }

    #[tokio::test]
    async fn test_not_ready_while_reconnecting_or_partial() {
        let (code, Json(body)) = ready_handler(State(state(Some(2), true))).await.unwrap_err();
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_ready");

        let (code, _) = ready_handler(State(state(Some(1), false))).await.unwrap_err();
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);

        let (code, _) = ready_handler(State(state(None, false))).await.unwrap_err();
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    }
}
