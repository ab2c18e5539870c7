//! Library for the compute exporter
//!
//! This crate provides the core functionality for:
//! - Cgroup hierarchy detection and workload discovery
//! - Per-workload resource statistics under cgroup v1 and v2
//! - Prometheus sample emission
//! - Health checks and observability

pub mod collector;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;

pub use collector::{
    CgroupCollector, CgroupMode, CollectorConfig, EmitFlags, ForcedVersion, HostFacts, Manager,
    ManagerDescriptor,
};
pub use error::CollectError;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::ExporterMetrics;
