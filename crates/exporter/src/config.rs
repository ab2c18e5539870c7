//! Exporter configuration

use anyhow::Result;
use exporter_lib::{CollectorConfig, EmitFlags, ForcedVersion, Manager};
use serde::Deserialize;
use std::path::PathBuf;

/// Exporter configuration, sourced from `EXPORTER_*` environment
/// variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Value of the `hostname` label on every sample
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// HTTP port for metrics/health endpoints
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Root of the cgroup filesystem
    #[serde(default = "default_cgroupfs_path")]
    pub cgroupfs_path: PathBuf,

    /// Root of procfs
    #[serde(default = "default_procfs_path")]
    pub procfs_path: PathBuf,

    /// Root of sysfs
    #[serde(default = "default_sysfs_path")]
    pub sysfs_path: PathBuf,

    /// Active cgroup v1 controller; aliases collapse onto the co-mounted
    /// name
    #[serde(default = "default_active_subsystem")]
    pub active_subsystem: String,

    /// Testing override for the detected cgroup version
    #[serde(default)]
    pub force_cgroup_version: Option<ForcedVersion>,

    /// Use the non-systemd (cgroupfs driver) path grammars
    #[serde(default)]
    pub no_systemd_mode: bool,

    /// Comma-separated workload managers to collect
    #[serde(default = "default_managers")]
    pub managers: String,

    #[serde(default)]
    pub enable_swap_stats: bool,

    #[serde(default)]
    pub enable_blkio_stats: bool,

    #[serde(default)]
    pub enable_psi_stats: bool,

    #[serde(default)]
    pub enable_rdma_stats: bool,
}

fn default_hostname() -> String {
    std::env::var("NODE_NAME")
        .or_else(|_| std::fs::read_to_string("/proc/sys/kernel/hostname"))
        .map(|h| h.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_listen_port() -> u16 {
    9010
}

fn default_cgroupfs_path() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_procfs_path() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_sysfs_path() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_active_subsystem() -> String {
    "cpuacct".to_string()
}

fn default_managers() -> String {
    "slurm".to_string()
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            listen_port: default_listen_port(),
            cgroupfs_path: default_cgroupfs_path(),
            procfs_path: default_procfs_path(),
            sysfs_path: default_sysfs_path(),
            active_subsystem: default_active_subsystem(),
            force_cgroup_version: None,
            no_systemd_mode: false,
            managers: default_managers(),
            enable_swap_stats: false,
            enable_blkio_stats: false,
            enable_psi_stats: false,
            enable_rdma_stats: false,
        }
    }
}

impl ExporterConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("EXPORTER"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    /// Translate into the collector's settings. An unknown manager name
    /// is fatal here, before anything starts serving.
    pub fn collector_config(&self) -> Result<CollectorConfig> {
        let mut managers = Vec::new();
        for name in self.managers.split(',') {
            if name.trim().is_empty() {
                continue;
            }
            managers.push(Manager::from_name(name)?);
        }

        Ok(CollectorConfig {
            cgroupfs_path: self.cgroupfs_path.clone(),
            procfs_path: self.procfs_path.clone(),
            sysfs_path: self.sysfs_path.clone(),
            active_subsystem: self.active_subsystem.clone(),
            force_cgroup_version: self.force_cgroup_version,
            no_systemd_mode: self.no_systemd_mode,
            managers,
            hostname: self.hostname.clone(),
            flags: EmitFlags {
                swap: self.enable_swap_stats,
                blkio: self.enable_blkio_stats,
                psi: self.enable_psi_stats,
                rdma: self.enable_rdma_stats,
            },
        })
    }
}
