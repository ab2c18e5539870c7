//! cgroup v1 statistics reading
//!
//! Materializes a [`MetricRecord`] from the legacy per-controller
//! hierarchies. Each workload's relative path is controller-agnostic, so
//! the reader re-roots it under every controller it needs:
//! - `cpu,cpuacct` for `cpuacct.usage` (total) and `cpuacct.usage_all`
//!   (per-cpu user/system split)
//! - `memory` for usage, limits, failcnt and the memsw mirrors
//! - `blkio` for the recursive throttle byte/request counters
//! - `rdma` for per-device HCA counters
//!
//! PSI is not exported under v1.

use super::UnitStatReader;
use crate::collector::cgroup_v2::CgroupV2Reader;
use crate::collector::fs::{parse_keyed, parse_uint, HostFacts};
use crate::models::{BlockIoStat, Cgroup, MetricRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const NANOS: f64 = 1_000_000_000.0;

/// Statistics reader for the legacy (v1) hierarchy.
pub struct CgroupV1Reader {
    /// Unshifted cgroup-fs root (`/sys/fs/cgroup`).
    cgroup_root: PathBuf,
    /// Alias-resolved active controller whose hierarchy the discoverer
    /// walked.
    active_controller: String,
    facts: HostFacts,
}

impl CgroupV1Reader {
    pub fn new(
        cgroup_root: impl Into<PathBuf>,
        active_controller: impl Into<String>,
        facts: HostFacts,
    ) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            active_controller: active_controller.into(),
            facts,
        }
    }

    /// Re-root a workload's path under another controller hierarchy.
    fn controller_path(&self, controller: &str, rel: &str) -> PathBuf {
        self.cgroup_root
            .join(controller)
            .join(rel.trim_start_matches('/'))
    }

    /// Controller-agnostic relative path of a discovered cgroup (its walk
    /// path was rooted in the active controller's hierarchy).
    fn workload_rel(&self, cgroup: &Cgroup) -> String {
        let shifted = self.cgroup_root.join(&self.active_controller);
        Path::new(&cgroup.path.fs_path)
            .strip_prefix(&shifted)
            .map(|rel| rel.to_string_lossy().into_owned())
            .unwrap_or_else(|_| cgroup.path.rel.trim_start_matches('/').to_string())
    }

    /// Sum the per-cpu rows of `cpuacct.usage_all` into (user, system)
    /// nanoseconds. The first line is the `cpu user system` header.
    pub fn parse_usage_all(content: &str) -> Option<(u64, u64)> {
        let mut user = 0u64;
        let mut system = 0u64;
        let mut rows = 0usize;
        for line in content.lines().skip(1) {
            let mut parts = line.split_whitespace();
            let _cpu = parts.next()?;
            user = user.checked_add(parts.next()?.parse().ok()?)?;
            system = system.checked_add(parts.next()?.parse().ok()?)?;
            rows += 1;
        }
        (rows > 0).then_some((user, system))
    }

    /// Parse the recursive blkio throttle files (`8:0 Read 1024` rows,
    /// trailing `Total` summary) into a per-device map of the chosen op.
    pub fn parse_throttle(content: &str) -> HashMap<String, (u64, u64)> {
        let mut devices: HashMap<String, (u64, u64)> = HashMap::new();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(device), Some(op), Some(value)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            let entry = devices.entry(device.to_string()).or_default();
            match op {
                "Read" => entry.0 = value,
                "Write" => entry.1 = value,
                _ => {}
            }
        }
        devices
    }

    async fn read_file(path: &Path) -> Option<String> {
        match fs::read_to_string(path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "controller file unreadable");
                None
            }
        }
    }

    async fn read_value(dir: &Path, name: &str, err: &mut bool) -> Option<u64> {
        let path = dir.join(name);
        let content = Self::read_file(&path).await?;
        match parse_uint(content.trim()) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "controller file malformed");
                *err = true;
                None
            }
        }
    }
}

#[async_trait]
impl UnitStatReader for CgroupV1Reader {
    async fn read_unit(&self, cgroup: &Cgroup) -> MetricRecord {
        let rel = self.workload_rel(cgroup);
        let cpu_dir = self.controller_path("cpu,cpuacct", &rel);
        let mem_dir = self.controller_path("memory", &rel);
        let blkio_dir = self.controller_path("blkio", &rel);
        let rdma_dir = self.controller_path("rdma", &rel);

        let mut rec = MetricRecord {
            uuid: cgroup.uuid.clone(),
            hostname: cgroup.hostname.clone(),
            ..MetricRecord::default()
        };

        if fs::metadata(&cpu_dir).await.is_err() && fs::metadata(&mem_dir).await.is_err() {
            debug!(cgroup = %cgroup.path.rel, "cgroup gone before stat read");
            rec.err = true;
            return rec;
        }

        rec.cpu_total_secs = Self::read_value(&cpu_dir, "cpuacct.usage", &mut rec.err)
            .await
            .map(|ns| ns as f64 / NANOS);
        if let Some(content) = Self::read_file(&cpu_dir.join("cpuacct.usage_all")).await {
            if let Some((user_ns, system_ns)) = Self::parse_usage_all(&content) {
                rec.cpu_user_secs = Some(user_ns as f64 / NANOS);
                rec.cpu_system_secs = Some(system_ns as f64 / NANOS);
            }
        }

        rec.memory_used_bytes =
            Self::read_value(&mem_dir, "memory.usage_in_bytes", &mut rec.err).await;
        rec.memory_total_bytes =
            Self::read_value(&mem_dir, "memory.limit_in_bytes", &mut rec.err)
                .await
                .map(|limit| self.facts.normalize_mem_limit(limit));
        rec.memory_fail_count =
            Self::read_value(&mem_dir, "memory.failcnt", &mut rec.err).await;
        if let Some(content) = Self::read_file(&mem_dir.join("memory.stat")).await {
            let stat = parse_keyed(&content);
            rec.memory_rss_bytes = stat.get("total_rss").copied();
            rec.memory_cache_bytes = stat.get("total_cache").copied();
        }

        rec.memsw_used_bytes =
            Self::read_value(&mem_dir, "memory.memsw.usage_in_bytes", &mut rec.err).await;
        rec.memsw_total_bytes =
            Self::read_value(&mem_dir, "memory.memsw.limit_in_bytes", &mut rec.err)
                .await
                .map(|limit| self.facts.normalize_swap_limit(limit));
        rec.memsw_fail_count =
            Self::read_value(&mem_dir, "memory.memsw.failcnt", &mut rec.err).await;

        let bytes = Self::read_file(&blkio_dir.join("blkio.throttle.io_service_bytes_recursive"))
            .await
            .map(|c| Self::parse_throttle(&c))
            .unwrap_or_default();
        let requests = Self::read_file(&blkio_dir.join("blkio.throttle.io_serviced_recursive"))
            .await
            .map(|c| Self::parse_throttle(&c))
            .unwrap_or_default();
        for (device, (read_bytes, write_bytes)) in bytes {
            let (read_requests, write_requests) =
                requests.get(&device).copied().unwrap_or_default();
            rec.blkio.insert(
                self.facts.device_name(&device),
                BlockIoStat {
                    read_bytes,
                    write_bytes,
                    read_requests,
                    write_requests,
                },
            );
        }

        if let Some(content) = Self::read_file(&rdma_dir.join("rdma.current")).await {
            rec.rdma = CgroupV2Reader::parse_rdma(&content);
        }

        rec
    }
}
