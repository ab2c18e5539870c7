//! Metric emission
//!
//! Fans batches of [`MetricRecord`]s out as labeled `ceems_compute_*`
//! samples. The metric families are registered once per scrape registry
//! and shared by every manager; the registry itself is created fresh for
//! each scrape, so counters seeded with `inc_by` carry the exact
//! kernel-reported cumulative values and the whole exposition is one
//! self-consistent snapshot.

use crate::models::MetricRecord;
use prometheus::{CounterVec, GaugeVec, Opts, Registry};
use serde::Deserialize;

/// Per-collector toggles for the optional stat families.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct EmitFlags {
    /// Swap usage, limit and fail count.
    pub swap: bool,
    /// Per-device block I/O bytes and requests.
    pub blkio: bool,
    /// CPU / memory / block pressure stall totals (v2 hierarchies only).
    pub psi: bool,
    /// Per-device RDMA HCA counters.
    pub rdma: bool,
}

const UNIT_LABELS: &[&str] = &["manager", "hostname", "cgrouphostname", "uuid"];
const DEVICE_LABELS: &[&str] = &["manager", "hostname", "cgrouphostname", "uuid", "device"];

fn gauge(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<GaugeVec> {
    let vec = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<CounterVec> {
    let vec = CounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

/// The per-scrape `ceems_compute_*` families. Register once on a fresh
/// registry, then emit every manager's records through it.
pub struct UnitMetrics {
    units: GaugeVec,
    cpu_user: CounterVec,
    cpu_system: CounterVec,
    cpus: GaugeVec,
    mem_rss: GaugeVec,
    mem_cache: GaugeVec,
    mem_used: GaugeVec,
    mem_total: GaugeVec,
    mem_fail: GaugeVec,
    collect_error: GaugeVec,
    swap: Option<SwapMetrics>,
    blkio: Option<BlkioMetrics>,
    psi: Option<PsiMetrics>,
    rdma: Option<RdmaMetrics>,
}

struct SwapMetrics {
    used: GaugeVec,
    total: GaugeVec,
    fail: GaugeVec,
}

struct BlkioMetrics {
    read_bytes: GaugeVec,
    write_bytes: GaugeVec,
    read_requests: GaugeVec,
    write_requests: GaugeVec,
}

struct PsiMetrics {
    cpu: GaugeVec,
    memory: GaugeVec,
    blkio: GaugeVec,
}

struct RdmaMetrics {
    handles: GaugeVec,
    objects: GaugeVec,
}

impl UnitMetrics {
    pub fn register(registry: &Registry, flags: EmitFlags) -> prometheus::Result<Self> {
        Ok(Self {
            units: gauge(
                registry,
                "ceems_compute_units",
                "Number of compute units on the host",
                &["manager", "hostname"],
            )?,
            cpu_user: counter(
                registry,
                "ceems_compute_unit_cpu_user_seconds_total",
                "Cumulative user CPU time of the compute unit",
                UNIT_LABELS,
            )?,
            cpu_system: counter(
                registry,
                "ceems_compute_unit_cpu_system_seconds_total",
                "Cumulative system CPU time of the compute unit",
                UNIT_LABELS,
            )?,
            cpus: gauge(
                registry,
                "ceems_compute_unit_cpus",
                "CPUs allocated to the compute unit",
                UNIT_LABELS,
            )?,
            mem_rss: gauge(
                registry,
                "ceems_compute_unit_memory_rss_bytes",
                "Resident memory of the compute unit",
                UNIT_LABELS,
            )?,
            mem_cache: gauge(
                registry,
                "ceems_compute_unit_memory_cache_bytes",
                "Page cache memory of the compute unit",
                UNIT_LABELS,
            )?,
            mem_used: gauge(
                registry,
                "ceems_compute_unit_memory_used_bytes",
                "Memory in use by the compute unit",
                UNIT_LABELS,
            )?,
            mem_total: gauge(
                registry,
                "ceems_compute_unit_memory_total_bytes",
                "Memory limit of the compute unit",
                UNIT_LABELS,
            )?,
            mem_fail: gauge(
                registry,
                "ceems_compute_unit_memory_fail_count",
                "Memory limit hit count of the compute unit",
                UNIT_LABELS,
            )?,
            collect_error: gauge(
                registry,
                "ceems_compute_unit_collect_error",
                "Set when statistics for the compute unit could not be fully collected",
                UNIT_LABELS,
            )?,
            swap: if flags.swap {
                Some(SwapMetrics {
                    used: gauge(
                        registry,
                        "ceems_compute_unit_memsw_used_bytes",
                        "Memory and swap in use by the compute unit",
                        UNIT_LABELS,
                    )?,
                    total: gauge(
                        registry,
                        "ceems_compute_unit_memsw_total_bytes",
                        "Memory and swap limit of the compute unit",
                        UNIT_LABELS,
                    )?,
                    fail: gauge(
                        registry,
                        "ceems_compute_unit_memsw_fail_count",
                        "Memory and swap limit hit count of the compute unit",
                        UNIT_LABELS,
                    )?,
                })
            } else {
                None
            },
            blkio: if flags.blkio {
                Some(BlkioMetrics {
                    read_bytes: gauge(
                        registry,
                        "ceems_compute_unit_blkio_read_total_bytes",
                        "Bytes read by the compute unit per block device",
                        DEVICE_LABELS,
                    )?,
                    write_bytes: gauge(
                        registry,
                        "ceems_compute_unit_blkio_write_total_bytes",
                        "Bytes written by the compute unit per block device",
                        DEVICE_LABELS,
                    )?,
                    read_requests: gauge(
                        registry,
                        "ceems_compute_unit_blkio_read_total_requests",
                        "Read requests issued by the compute unit per block device",
                        DEVICE_LABELS,
                    )?,
                    write_requests: gauge(
                        registry,
                        "ceems_compute_unit_blkio_write_total_requests",
                        "Write requests issued by the compute unit per block device",
                        DEVICE_LABELS,
                    )?,
                })
            } else {
                None
            },
            psi: if flags.psi {
                Some(PsiMetrics {
                    cpu: gauge(
                        registry,
                        "ceems_compute_unit_cpu_psi_seconds",
                        "Total time the compute unit stalled on CPU",
                        UNIT_LABELS,
                    )?,
                    memory: gauge(
                        registry,
                        "ceems_compute_unit_memory_psi_seconds",
                        "Total time the compute unit stalled on memory",
                        UNIT_LABELS,
                    )?,
                    blkio: gauge(
                        registry,
                        "ceems_compute_unit_blkio_psi_seconds",
                        "Total time the compute unit stalled on block I/O",
                        DEVICE_LABELS,
                    )?,
                })
            } else {
                None
            },
            rdma: if flags.rdma {
                Some(RdmaMetrics {
                    handles: gauge(
                        registry,
                        "ceems_compute_unit_rdma_hca_handles",
                        "RDMA HCA handles held by the compute unit per device",
                        DEVICE_LABELS,
                    )?,
                    objects: gauge(
                        registry,
                        "ceems_compute_unit_rdma_hca_objects",
                        "RDMA HCA objects held by the compute unit per device",
                        DEVICE_LABELS,
                    )?,
                })
            } else {
                None
            },
        })
    }

    /// Publish one manager's records.
    pub fn emit(&self, manager: &str, hostname: &str, records: &[MetricRecord]) {
        self.units
            .with_label_values(&[manager, hostname])
            .set(records.len() as f64);

        for rec in records {
            let labels = [manager, hostname, rec.hostname.as_str(), rec.uuid.as_str()];

            if let Some(v) = rec.cpu_user_secs {
                self.cpu_user.with_label_values(&labels).inc_by(v);
            }
            if let Some(v) = rec.cpu_system_secs {
                self.cpu_system.with_label_values(&labels).inc_by(v);
            }
            if let Some(millis) = rec.cpu_alloc_millis {
                self.cpus
                    .with_label_values(&labels)
                    .set(millis as f64 / 1000.0);
            }
            if let Some(v) = rec.memory_rss_bytes {
                self.mem_rss.with_label_values(&labels).set(v as f64);
            }
            if let Some(v) = rec.memory_cache_bytes {
                self.mem_cache.with_label_values(&labels).set(v as f64);
            }
            if let Some(v) = rec.memory_used_bytes {
                self.mem_used.with_label_values(&labels).set(v as f64);
            }
            if let Some(v) = rec.memory_total_bytes {
                self.mem_total.with_label_values(&labels).set(v as f64);
            }
            if let Some(v) = rec.memory_fail_count {
                self.mem_fail.with_label_values(&labels).set(v as f64);
            }

            if let Some(swap) = &self.swap {
                if let Some(v) = rec.memsw_used_bytes {
                    swap.used.with_label_values(&labels).set(v as f64);
                }
                if let Some(v) = rec.memsw_total_bytes {
                    swap.total.with_label_values(&labels).set(v as f64);
                }
                if let Some(v) = rec.memsw_fail_count {
                    swap.fail.with_label_values(&labels).set(v as f64);
                }
            }

            if let Some(blkio) = &self.blkio {
                for (device, stat) in &rec.blkio {
                    let labels = [
                        manager,
                        hostname,
                        rec.hostname.as_str(),
                        rec.uuid.as_str(),
                        device.as_str(),
                    ];
                    // Devices the unit never touched stay out of the exposition
                    if stat.read_bytes > 0 {
                        blkio
                            .read_bytes
                            .with_label_values(&labels)
                            .set(stat.read_bytes as f64);
                    }
                    if stat.write_bytes > 0 {
                        blkio
                            .write_bytes
                            .with_label_values(&labels)
                            .set(stat.write_bytes as f64);
                    }
                    if stat.read_requests > 0 {
                        blkio
                            .read_requests
                            .with_label_values(&labels)
                            .set(stat.read_requests as f64);
                    }
                    if stat.write_requests > 0 {
                        blkio
                            .write_requests
                            .with_label_values(&labels)
                            .set(stat.write_requests as f64);
                    }
                }
            }

            if let Some(psi) = &self.psi {
                if let Some(v) = rec.cpu_psi_secs {
                    psi.cpu.with_label_values(&labels).set(v);
                }
                if let Some(v) = rec.memory_psi_secs {
                    psi.memory.with_label_values(&labels).set(v);
                }
                if let Some(v) = rec.blkio_psi_secs {
                    // Stall time is accounted per cgroup, not per device
                    let labels = [
                        manager,
                        hostname,
                        rec.hostname.as_str(),
                        rec.uuid.as_str(),
                        "",
                    ];
                    psi.blkio.with_label_values(&labels).set(v);
                }
            }

            if let Some(rdma) = &self.rdma {
                for (device, stat) in &rec.rdma {
                    let labels = [
                        manager,
                        hostname,
                        rec.hostname.as_str(),
                        rec.uuid.as_str(),
                        device.as_str(),
                    ];
                    rdma.handles
                        .with_label_values(&labels)
                        .set(stat.hca_handles as f64);
                    rdma.objects
                        .with_label_values(&labels)
                        .set(stat.hca_objects as f64);
                }
            }

            if rec.err {
                self.collect_error.with_label_values(&labels).set(1.0);
            }
        }
    }

}
