//! Cgroup discovery and statistics collection
//!
//! The scrape pipeline: the mode detector picks the cgroup ABI, one
//! descriptor per enabled manager says where that manager's workloads
//! live, the discoverer walks the hierarchy, and the v1 or v2 reader
//! turns each workload into a normalized record that the emitter fans
//! out as labeled samples. Descriptors are built once at startup;
//! everything else happens per scrape.

pub mod cgroup_v1;
pub mod cgroup_v2;
pub mod cpu_budget;
pub mod discovery;
pub mod emitter;
pub mod fs;
pub mod manager;
pub mod mode;


pub use cgroup_v1::CgroupV1Reader;
pub use cgroup_v2::CgroupV2Reader;
pub use discovery::discover;
pub use emitter::{EmitFlags, UnitMetrics};
pub use fs::HostFacts;
pub use manager::{Manager, ManagerDescriptor};
pub use mode::{detect_cgroup_mode, CgroupMode, ForcedVersion};

use crate::error::CollectError;
use crate::models::{Cgroup, MetricRecord};
use crate::observability::ExporterMetrics;
use anyhow::Result;
use async_trait::async_trait;
use prometheus::{GaugeVec, Opts, Registry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// ABI-specific statistics reading seam. One implementation per cgroup
/// version; the collector picks one at startup.
#[async_trait]
pub trait UnitStatReader: Send + Sync {
    /// Materialize the resource snapshot for one workload. Trouble is
    /// reported inside the record, never as an error: a scrape either
    /// publishes a self-consistent snapshot or fails as a whole at the
    /// discovery stage.
    async fn read_unit(&self, cgroup: &Cgroup) -> MetricRecord;
}

/// Collector construction and scrape-time settings.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub cgroupfs_path: PathBuf,
    pub procfs_path: PathBuf,
    pub sysfs_path: PathBuf,
    /// v1 controller whose hierarchy is walked; aliases collapse onto
    /// the co-mounted name.
    pub active_subsystem: String,
    pub force_cgroup_version: Option<ForcedVersion>,
    /// Switch the libvirt and Kubernetes grammars to their non-systemd
    /// (cgroupfs driver) spellings.
    pub no_systemd_mode: bool,
    pub managers: Vec<Manager>,
    /// Value of the `hostname` label on every sample.
    pub hostname: String,
    pub flags: EmitFlags,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            cgroupfs_path: PathBuf::from("/sys/fs/cgroup"),
            procfs_path: PathBuf::from("/proc"),
            sysfs_path: PathBuf::from("/sys"),
            active_subsystem: "cpuacct".to_string(),
            force_cgroup_version: None,
            no_systemd_mode: false,
            managers: vec![Manager::Slurm],
            hostname: String::new(),
            flags: EmitFlags::default(),
        }
    }
}

/// The cgroup metrics collector. Built once at startup, then driven by
/// the HTTP scrape handler through [`CgroupCollector::collect`].
pub struct CgroupCollector {
    config: CollectorConfig,
    mode: CgroupMode,
    descriptors: Vec<ManagerDescriptor>,
    reader: Arc<dyn UnitStatReader>,
}

impl CgroupCollector {
    pub async fn new(config: CollectorConfig) -> Result<Self> {
        let mode =
            detect_cgroup_mode(&config.cgroupfs_path, config.force_cgroup_version).await;
        if mode == CgroupMode::Unknown {
            return Err(CollectError::UnknownHierarchy(config.cgroupfs_path.clone()).into());
        }
        info!(mode = mode.as_str(), "detected cgroup hierarchy");

        let facts = HostFacts::load(&config.procfs_path).await;

        let mut descriptors = Vec::with_capacity(config.managers.len());
        for manager in &config.managers {
            descriptors.push(
                ManagerDescriptor::build(
                    *manager,
                    mode,
                    &config.cgroupfs_path,
                    &config.active_subsystem,
                    !config.no_systemd_mode,
                )
                .await?,
            );
        }

        let reader: Arc<dyn UnitStatReader> = if mode.is_unified() {
            Arc::new(CgroupV2Reader::new(facts))
        } else {
            Arc::new(CgroupV1Reader::new(
                &config.cgroupfs_path,
                manager::resolve_controller(&config.active_subsystem),
                facts,
            ))
        };

        Ok(Self {
            config,
            mode,
            descriptors,
            reader,
        })
    }

    pub fn mode(&self) -> CgroupMode {
        self.mode
    }

    pub fn descriptors(&self) -> &[ManagerDescriptor] {
        &self.descriptors
    }

    /// Run one scrape into `registry`.
    ///
    /// Each manager succeeds or fails on its own: a failed walk turns
    /// into `ceems_scrape_collector_success=0` for that manager and the
    /// others continue. The duration/success pair for a manager is
    /// finalized only after all of its samples are in the registry.
    pub async fn collect(&self, registry: &Registry) -> Result<()> {
        let duration = GaugeVec::new(
            Opts::new(
                "ceems_scrape_collector_duration_seconds",
                "Time spent scraping one collector",
            ),
            &["collector"],
        )?;
        registry.register(Box::new(duration.clone()))?;
        let success = GaugeVec::new(
            Opts::new(
                "ceems_scrape_collector_success",
                "Whether the collector scrape succeeded",
            ),
            &["collector"],
        )?;
        registry.register(Box::new(success.clone()))?;

        let unit_metrics = UnitMetrics::register(registry, self.config.flags)?;

        let metrics = ExporterMetrics::new();
        for desc in &self.descriptors {
            let name = desc.manager.as_str();
            let start = Instant::now();
            let ok = match self.collect_manager(desc, &unit_metrics).await {
                Ok(units) => {
                    metrics.set_units_discovered(name, units as i64);
                    true
                }
                Err(e) => {
                    error!(manager = name, error = %e, "collector scrape failed");
                    metrics.inc_collect_errors(name);
                    false
                }
            };
            let elapsed = start.elapsed().as_secs_f64();
            metrics.observe_scrape_latency(name, elapsed);
            duration.with_label_values(&[name]).set(elapsed);
            success
                .with_label_values(&[name])
                .set(if ok { 1.0 } else { 0.0 });
        }
        Ok(())
    }

    /// Discover, read and emit one manager's workloads. Returns the
    /// number of units published.
    async fn collect_manager(
        &self,
        desc: &ManagerDescriptor,
        unit_metrics: &UnitMetrics,
    ) -> Result<usize> {
        let cgroups = discover(desc, &self.config.procfs_path).await?;

        // Identity of each slot, kept aside so a panicked worker still
        // yields an attributable error record.
        let metas: Vec<(String, String)> = cgroups
            .iter()
            .map(|cg| (cg.uuid.clone(), cg.hostname.clone()))
            .collect();

        // Per-workload work is independent; results land back at their
        // original index.
        let mut handles: Vec<JoinHandle<MetricRecord>> = Vec::with_capacity(cgroups.len());
        for cgroup in cgroups {
            let reader = Arc::clone(&self.reader);
            let desc = desc.clone();
            let cgroup_root = self.config.cgroupfs_path.clone();
            let systemd = !self.config.no_systemd_mode;
            handles.push(tokio::spawn(async move {
                let mut record = reader.read_unit(&cgroup).await;
                record.cpu_alloc_millis =
                    cpu_budget::allocated_millicpu(&desc, &cgroup_root, &cgroup, systemd).await;
                record
            }));
        }

        let mut records = Vec::with_capacity(handles.len());
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(record) => records.push(record),
                Err(e) => {
                    let (uuid, hostname) = &metas[i];
                    warn!(uuid = %uuid, error = %e, "stat worker failed");
                    records.push(MetricRecord::failed(uuid.clone(), hostname.clone()));
                }
            }
        }

        unit_metrics.emit(desc.manager.as_str(), &self.config.hostname, &records);
        Ok(records.len())
    }
}
