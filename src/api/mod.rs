//! HTTP surface
//!
//! - `GET /healthz` liveness
//! - `GET /debug/cluster` local view of the cluster
//! - `POST /upload` agent uploads, routed through the coordinator
//! - `GET /federate` local partitions for federation
//! - `GET /metrics` Prometheus exposition, when a registry is configured

pub mod metrics;
mod telemetry;

pub use telemetry::FORWARD_RESULT_ATTRIBUTE;

use crate::cluster::{ClusterCoordinator, DebugInfo};
use crate::telemetry::MetricsRegistry;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use opentelemetry::global;
use opentelemetry::metrics::Meter;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// HTTP server configuration
#[derive(Clone)]
pub struct ApiServerConfig {
    /// Maximum request body size
    pub max_body_size: usize,
    /// Meter for the request instruments
    pub meter: Meter,
    /// Registry served at `/metrics`; the route is absent without one
    pub metrics_registry: Option<MetricsRegistry>,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            max_body_size: 16 * 1024 * 1024, // 16MB
            meter: global::meter("telefed.api.http"),
            metrics_registry: None,
        }
    }
}

impl fmt::Debug for ApiServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiServerConfig")
            .field("max_body_size", &self.max_body_size)
            .field("metrics_registry", &self.metrics_registry)
            .finish_non_exhaustive()
    }
}

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<ClusterCoordinator>,
    pub(crate) http: Arc<telemetry::HttpMetrics>,
    metrics_registry: Option<MetricsRegistry>,
}

/// Build the HTTP API router
pub fn build_http_router(coordinator: Arc<ClusterCoordinator>, config: &ApiServerConfig) -> Router {
    let state = ApiState {
        coordinator,
        http: Arc::new(telemetry::HttpMetrics::new(&config.meter)),
        metrics_registry: config.metrics_registry.clone(),
    };

    let mut router = Router::new()
        .route("/healthz", get(health_check))
        .route("/debug/cluster", get(debug_cluster))
        .route("/upload", post(metrics::upload))
        .route("/federate", get(metrics::federate));
    if state.metrics_registry.is_some() {
        router = router.route("/metrics", get(prometheus_metrics));
    }

    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            telemetry::track_requests,
        ))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_size))
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Cluster debug snapshot; other methods get 405 from the router
async fn debug_cluster(State(state): State<ApiState>) -> Json<DebugInfo> {
    Json(state.coordinator.debug_info())
}

/// Prometheus text exposition of every instrument
async fn prometheus_metrics(State(state): State<ApiState>) -> Response {
    let Some(registry) = state.metrics_registry else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match registry.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, registry.content_type())], body).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
