//! Compute exporter - per-workload cgroup metrics
//!
//! Runs on every compute host, introspecting the cgroup hierarchy of
//! the configured workload managers and serving Prometheus metrics
//! over HTTP.

use anyhow::Result;
use exporter_lib::{
    health::{components, HealthRegistry},
    CgroupCollector, ExporterMetrics,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = EXPORTER_VERSION, "Starting compute-exporter");

    // Load configuration
    let config = config::ExporterConfig::load()?;
    info!(hostname = %config.hostname, managers = %config.managers, "Exporter configured");

    // Build the collector: descriptors live for the process lifetime
    let collector = Arc::new(CgroupCollector::new(config.collector_config()?).await?);
    info!(mode = collector.mode().as_str(), "Cgroup collector ready");

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::COLLECTOR).await;
    health_registry.register(components::HTTP_SERVER).await;

    // Initialize exporter-internal metrics
    let _metrics = ExporterMetrics::new();

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), collector));

    // Mark exporter as ready after initialization
    health_registry.set_ready(true).await;

    // Start health and metrics server
    let _api_handle = tokio::spawn(api::serve(config.listen_port, app_state));

    // Wait for shutdown signal; an in-flight scrape finishes its batch
    // inside the handler before the process exits
    tokio::signal::ctrl_c().await?;
    info!("SIGINT received, shutting down");

    Ok(())
}
