//! HTTP surface of the exporter
//!
//! Serves the Prometheus exposition plus liveness and readiness probes.
//! `/metrics` is the scrape driver: every GET runs one collection pass
//! over the cgroup hierarchy.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use exporter_lib::{health::components, CgroupCollector, HealthRegistry};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// State shared by the probe and scrape handlers
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub collector: Arc<CgroupCollector>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, collector: Arc<CgroupCollector>) -> Self {
        Self {
            health_registry,
            collector,
        }
    }
}

/// Liveness probe. A degraded component still serves scrapes, so only a
/// hard component failure reports 503.
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = if health.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Readiness probe. Not ready until the manager descriptors are built
/// and no component has hard-failed.
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus scrape endpoint.
///
/// Every scrape drives one collection pass into a registry created for
/// that scrape, so the workload samples are a point-in-time snapshot.
/// The exporter's own process-global metrics ride along.
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let registry = Registry::new();
    if let Err(e) = state.collector.collect(&registry).await {
        error!(error = %e, "scrape failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let mut families = registry.gather();
    families.extend(prometheus::gather());

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!(error = %e, "metric encoding failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Wire the scrape and probe routes onto the shared state
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Bind the exporter's HTTP endpoint and serve until the process exits.
/// The http_server component goes healthy once the listener is up.
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    state
        .health_registry
        .set_healthy(components::HTTP_SERVER)
        .await;
    info!(%addr, "metrics endpoint listening");

    axum::serve(listener, router(state)).await?;

    Ok(())
}
