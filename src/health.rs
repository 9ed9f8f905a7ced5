//! Health, status and metrics HTTP surface.
//!
//! Both services expose the same five routes: `/health` (aggregate plus
//! per-component map), `/health/live` (200 while the process runs),
//! `/health/ready` (200 only when every dependency is healthy),
//! `/status` (service-specific counter snapshot) and `/metrics`
//! (Prometheus exposition). Component states degrade independently so an
//! orchestrator only restarts on true unhealth.

use crate::metrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Per-component health states, updated by the owning service.
#[derive(Default)]
pub struct HealthRegistry {
    components: RwLock<HashMap<String, ComponentHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, component: &str, status: HealthStatus, detail: Option<String>) {
        self.components.write().unwrap().insert(
            component.to_string(),
            ComponentHealth {
                status,
                detail,
                checked_at: Utc::now(),
            },
        );
    }

    /// Worst component state wins; no components yet means healthy.
    pub fn aggregate(&self) -> HealthStatus {
        let components = self.components.read().unwrap();
        let mut aggregate = HealthStatus::Healthy;
        for component in components.values() {
            match component.status {
                HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
                HealthStatus::Degraded => aggregate = HealthStatus::Degraded,
                HealthStatus::Healthy => {}
            }
        }
        aggregate
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let components = self.components.read().unwrap();
        json!({
            "status": self.aggregate(),
            "components": *components,
        })
    }
}

/// Service-specific `/status` payload provider.
pub type StatusFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = serde_json::Value> + Send>> + Send + Sync,
>;

#[derive(Clone)]
struct AppState {
    health: Arc<HealthRegistry>,
    status: StatusFn,
}

pub fn router(health: Arc<HealthRegistry>, status: StatusFn) -> Router {
    let state = AppState { health, status };
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(live_handler))
        .route("/health/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve the HTTP surface until cancellation.
pub async fn serve(
    port: u16,
    health: Arc<HealthRegistry>,
    status: StatusFn,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port = port, "http surface listening");
    axum::serve(listener, router(health, status))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.snapshot())
}

async fn live_handler() -> &'static str {
    "ok"
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.health.aggregate() {
        HealthStatus::Healthy => (StatusCode::OK, "ready"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json((state.status)().await)
}

async fn metrics_handler() -> String {
    metrics::gather()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.aggregate(), HealthStatus::Healthy);
    }

    #[test]
    fn worst_component_wins() {
        let registry = HealthRegistry::new();
        registry.set("broker", HealthStatus::Healthy, None);
        registry.set("store", HealthStatus::Degraded, Some("slow".into()));
        assert_eq!(registry.aggregate(), HealthStatus::Degraded);

        registry.set("devices", HealthStatus::Unhealthy, Some("all offline".into()));
        assert_eq!(registry.aggregate(), HealthStatus::Unhealthy);

        registry.set("devices", HealthStatus::Healthy, None);
        assert_eq!(registry.aggregate(), HealthStatus::Degraded);
    }

    #[test]
    fn snapshot_carries_components() {
        let registry = HealthRegistry::new();
        registry.set("broker", HealthStatus::Healthy, None);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot["status"], "healthy");
        assert_eq!(snapshot["components"]["broker"]["status"], "healthy");
    }

    #[tokio::test]
    async fn routes_respond() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let registry = HealthRegistry::new();
        registry.set("broker", HealthStatus::Unhealthy, Some("down".into()));
        let status: StatusFn = Arc::new(|| Box::pin(async { json!({"ok": true}) }));
        let app = router(registry, status);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
