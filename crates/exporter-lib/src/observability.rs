//! Observability infrastructure for the exporter itself
//!
//! Exporter-internal Prometheus metrics: scrape latency per collector,
//! units discovered, and collection error counts. These live in the
//! process-global registry and are served alongside the per-scrape
//! workload families.

use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;

/// Default histogram buckets for scrape latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ExporterMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct ExporterMetricsInner {
    scrape_latency_seconds: HistogramVec,
    units_discovered: IntGaugeVec,
    collect_errors: IntCounterVec,
}

impl ExporterMetricsInner {
    fn new() -> Self {
        Self {
            scrape_latency_seconds: register_histogram_vec!(
                "compute_exporter_scrape_latency_seconds",
                "Time spent walking and reading cgroups per collector",
                &["collector"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register scrape_latency_seconds"),

            units_discovered: register_int_gauge_vec!(
                "compute_exporter_units_discovered",
                "Number of workload cgroups found in the last scrape",
                &["collector"]
            )
            .expect("Failed to register units_discovered"),

            collect_errors: register_int_counter_vec!(
                "compute_exporter_collect_errors_total",
                "Total number of failed collector scrapes",
                &["collector"]
            )
            .expect("Failed to register collect_errors_total"),
        }
    }
}

/// Exporter metrics handle.
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ExporterMetrics {
    _private: (),
}

impl Default for ExporterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ExporterMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ExporterMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ExporterMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Record the wall time of one collector's scrape
    pub fn observe_scrape_latency(&self, collector: &str, duration_secs: f64) {
        self.inner()
            .scrape_latency_seconds
            .with_label_values(&[collector])
            .observe(duration_secs);
    }

    /// Update the discovered-unit count for a collector
    pub fn set_units_discovered(&self, collector: &str, count: i64) {
        self.inner()
            .units_discovered
            .with_label_values(&[collector])
            .set(count);
    }

    /// Count a failed collector scrape
    pub fn inc_collect_errors(&self, collector: &str) {
        self.inner()
            .collect_errors
            .with_label_values(&[collector])
            .inc();
    }
}
