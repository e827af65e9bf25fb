//! Read-only health endpoints for consumer processes.
//!
//! - Liveness probe (`/health`)
//! - Readiness probe (`/ready`): coordination store reachable and no stuck
//!   channels
//! - Subscription status (`/status`)
//! - Prometheus metrics (`/metrics`)

use crate::coordination::CoordinationStore;
use crate::metrics;
use crate::registry::{ConsumerRegistry, SubscriptionStatus};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<ConsumerRegistry>,
    /// Checked by the readiness probe when the consumer coordinates through a store.
    pub store: Option<Arc<dyn CoordinationStore>>,
    pub app_name: String,
    pub app_version: String,
}

impl HealthState {
    pub fn new(
        registry: Arc<ConsumerRegistry>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store: None,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Always OK while the process serves requests.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let store_check = match &state.store {
        Some(store) => match store.ping().await {
            Ok(()) => Ok("ok".to_string()),
            Err(e) => Err(format!("error: {e}")),
        },
        None => Ok("not_configured".to_string()),
    };

    let stuck: Vec<Value> = state
        .registry
        .status()
        .into_iter()
        .filter(|s| !s.stuck_partitions.is_empty())
        .map(|s| json!({ "event_type": s.event_type, "partitions": s.stuck_partitions }))
        .collect();

    let ready = store_check.is_ok() && stuck.is_empty();
    let status = if ready { "ready" } else { "not_ready" };
    let coordination = match store_check {
        Ok(check) | Err(check) => check,
    };
    let body = Json(json!({
        "status": status,
        "checks": {
            "coordination": coordination,
            "stuck_channels": stuck,
        }
    }));

    if ready {
        Ok((StatusCode::OK, body))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, body))
    }
}

pub async fn status_handler(State(state): State<HealthState>) -> Json<Vec<SubscriptionStatus>> {
    Json(state.registry.status())
}

/// Prometheus metrics in text format.
pub async fn metrics_handler() -> impl IntoResponse {
    if !metrics::metrics_initialized() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call init_metrics() at startup.".to_string(),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        metrics::render_metrics(),
    )
        .into_response()
}

pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
