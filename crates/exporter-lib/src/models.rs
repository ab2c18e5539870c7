//! Core data models for the compute exporter

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A cgroup location, kept both as the canonical absolute path and as the
/// path relative to the manager's effective root. Both strings have systemd
/// `\xNN` escapes already decoded; `fs_path` keeps the raw on-disk spelling
/// so controller files can still be opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CgroupPath {
    pub abs: String,
    pub rel: String,
    pub fs_path: String,
}

/// A process observed inside a workload cgroup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub pid: i32,
    pub cmdline: String,
}

/// A workload root cgroup: one SLURM job, one libvirt VM instance or one
/// Kubernetes pod, together with the processes and step-level children
/// observed during the walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cgroup {
    /// Manager-assigned identifier (job number, instance name, pod UUID).
    pub id: String,
    /// User-facing identifier. Equals `id` unless an outer collector
    /// overrides it (libvirt maps instances to domain UUIDs).
    pub uuid: String,
    /// Virtual-host tag for multi-node SLURM layouts, empty otherwise.
    pub hostname: String,
    pub path: CgroupPath,
    /// Snapshot of live processes, ignore-filtered. Never cached across
    /// scrapes.
    pub procs: Vec<Process>,
    /// Relative paths of every matched directory belonging to this
    /// workload, the root itself included.
    pub children: Vec<String>,
}

/// Per-device block I/O counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIoStat {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_requests: u64,
    pub write_requests: u64,
}

/// Per-device RDMA counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdmaStat {
    pub hca_handles: u64,
    pub hca_objects: u64,
}

/// Normalized point-in-time resource snapshot for one workload.
///
/// Every field that depends on an individual controller file is optional:
/// a missing or unreadable file drops the sample, not the record. `err` is
/// set when the record is materially incomplete (cgroup vanished mid-scrape
/// or a controller file failed to parse) so the emitter can publish a
/// `collect_error` sample for the workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricRecord {
    pub uuid: String,
    pub hostname: String,
    pub cpu_user_secs: Option<f64>,
    pub cpu_system_secs: Option<f64>,
    pub cpu_total_secs: Option<f64>,
    /// Allocated CPU in milli-units.
    pub cpu_alloc_millis: Option<u64>,
    pub cpu_psi_secs: Option<f64>,
    pub memory_rss_bytes: Option<u64>,
    pub memory_cache_bytes: Option<u64>,
    pub memory_used_bytes: Option<u64>,
    pub memory_total_bytes: Option<u64>,
    pub memory_fail_count: Option<u64>,
    pub memsw_used_bytes: Option<u64>,
    pub memsw_total_bytes: Option<u64>,
    pub memsw_fail_count: Option<u64>,
    pub memory_psi_secs: Option<f64>,
    /// Keyed by resolved device name (or `major:minor` when unresolved).
    pub blkio: HashMap<String, BlockIoStat>,
    pub blkio_psi_secs: Option<f64>,
    /// Keyed by RDMA device name.
    pub rdma: HashMap<String, RdmaStat>,
    pub err: bool,
}

impl MetricRecord {
    /// An empty, flagged record for a workload whose cgroup could not be
    /// loaded at all.
    pub fn failed(uuid: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            hostname: hostname.into(),
            err: true,
            ..Self::default()
        }
    }
}
