//! cgroup v2 statistics reading
//!
//! Materializes a [`MetricRecord`] from the unified hierarchy:
//! - `cpu.stat` for user/system/total CPU time
//! - `memory.current` / `memory.max` / `memory.stat` / `memory.events`
//! - `memory.swap.current` / `memory.swap.max`
//! - `io.stat` for per-device block I/O
//! - `rdma.current` for per-device HCA counters
//! - `cpu.pressure` / `memory.pressure` / `io.pressure` PSI totals
//!
//! Unlimited sentinels in `memory.max` and `memory.swap.max` are
//! normalized against host totals.

use super::UnitStatReader;
use crate::collector::fs::{parse_keyed, parse_uint, HostFacts};
use crate::models::{BlockIoStat, Cgroup, MetricRecord, RdmaStat};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const MICROS: f64 = 1_000_000.0;

/// Statistics reader for the unified (v2) hierarchy.
pub struct CgroupV2Reader {
    facts: HostFacts,
}

impl CgroupV2Reader {
    pub fn new(facts: HostFacts) -> Self {
        Self { facts }
    }

    /// Extract the `full ... total=<usec>` stall time from a pressure
    /// file, in seconds. Kernels without full PSI yield `None`.
    pub fn parse_pressure(content: &str) -> Option<f64> {
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            if parts.next() != Some("full") {
                continue;
            }
            for field in parts {
                if let Some(total) = field.strip_prefix("total=") {
                    return total.parse::<u64>().ok().map(|us| us as f64 / MICROS);
                }
            }
        }
        None
    }

    /// Parse `io.stat` into per-device counters, resolving device names
    /// through host facts.
    pub fn parse_io_stat(content: &str, facts: &HostFacts) -> HashMap<String, BlockIoStat> {
        let mut devices = HashMap::new();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let Some(major_minor) = parts.next() else {
                continue;
            };
            let mut stat = BlockIoStat::default();
            for field in parts {
                let Some((key, value)) = field.split_once('=') else {
                    continue;
                };
                let Ok(value) = value.parse::<u64>() else {
                    continue;
                };
                match key {
                    "rbytes" => stat.read_bytes = value,
                    "wbytes" => stat.write_bytes = value,
                    "rios" => stat.read_requests = value,
                    "wios" => stat.write_requests = value,
                    _ => {}
                }
            }
            devices.insert(facts.device_name(major_minor), stat);
        }
        devices
    }

    /// Parse `rdma.current` into per-device HCA counters. The handles and
    /// objects columns are kept apart so each family reports its own map.
    pub fn parse_rdma(content: &str) -> HashMap<String, RdmaStat> {
        let mut devices = HashMap::new();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let Some(device) = parts.next() else {
                continue;
            };
            let mut stat = RdmaStat::default();
            for field in parts {
                let Some((key, value)) = field.split_once('=') else {
                    continue;
                };
                let Ok(value) = parse_uint(value) else {
                    continue;
                };
                match key {
                    "hca_handle" => stat.hca_handles = value,
                    "hca_object" => stat.hca_objects = value,
                    _ => {}
                }
            }
            devices.insert(device.to_string(), stat);
        }
        devices
    }

    /// Read a file, treating absence as silence and other I/O trouble as
    /// a vanished-entry event.
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

    /// Read a single-integer controller file. Malformed content flags the
    /// record.
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
impl UnitStatReader for CgroupV2Reader {
    async fn read_unit(&self, cgroup: &Cgroup) -> MetricRecord {
        let dir = PathBuf::from(&cgroup.path.fs_path);
        let mut rec = MetricRecord {
            uuid: cgroup.uuid.clone(),
            hostname: cgroup.hostname.clone(),
            ..MetricRecord::default()
        };

        if fs::metadata(&dir).await.is_err() {
            debug!(cgroup = %cgroup.path.rel, "cgroup gone before stat read");
            rec.err = true;
            return rec;
        }

        if let Some(content) = Self::read_file(&dir.join("cpu.stat")).await {
            let stat = parse_keyed(&content);
            rec.cpu_user_secs = stat.get("user_usec").map(|v| *v as f64 / MICROS);
            rec.cpu_system_secs = stat.get("system_usec").map(|v| *v as f64 / MICROS);
            rec.cpu_total_secs = stat.get("usage_usec").map(|v| *v as f64 / MICROS);
        }
        if let Some(content) = Self::read_file(&dir.join("cpu.pressure")).await {
            rec.cpu_psi_secs = Self::parse_pressure(&content);
        }

        rec.memory_used_bytes = Self::read_value(&dir, "memory.current", &mut rec.err).await;
        rec.memory_total_bytes = Self::read_value(&dir, "memory.max", &mut rec.err)
            .await
            .map(|limit| self.facts.normalize_mem_limit(limit));
        if let Some(content) = Self::read_file(&dir.join("memory.stat")).await {
            let stat = parse_keyed(&content);
            rec.memory_rss_bytes = stat.get("anon").copied();
            rec.memory_cache_bytes = stat.get("file").copied();
        }
        if let Some(content) = Self::read_file(&dir.join("memory.events")).await {
            rec.memory_fail_count = parse_keyed(&content).get("oom").copied();
        }
        if let Some(content) = Self::read_file(&dir.join("memory.pressure")).await {
            rec.memory_psi_secs = Self::parse_pressure(&content);
        }

        rec.memsw_used_bytes = Self::read_value(&dir, "memory.swap.current", &mut rec.err).await;
        rec.memsw_total_bytes = Self::read_value(&dir, "memory.swap.max", &mut rec.err)
            .await
            .map(|limit| self.facts.normalize_swap_limit(limit));
        if let Some(content) = Self::read_file(&dir.join("memory.swap.events")).await {
            rec.memsw_fail_count = parse_keyed(&content).get("fail").copied();
        }

        if let Some(content) = Self::read_file(&dir.join("io.stat")).await {
            rec.blkio = Self::parse_io_stat(&content, &self.facts);
        }
        if let Some(content) = Self::read_file(&dir.join("io.pressure")).await {
            rec.blkio_psi_secs = Self::parse_pressure(&content);
        }

        if let Some(content) = Self::read_file(&dir.join("rdma.current")).await {
            rec.rdma = Self::parse_rdma(&content);
        }

        rec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::fs::UNLIMITED;
    use crate::models::CgroupPath;
    use tempfile::TempDir;

    fn cgroup_at(dir: &Path) -> Cgroup {
        Cgroup {
            id: "100".into(),
            uuid: "100".into(),
            hostname: String::new(),
            path: CgroupPath {
                abs: dir.to_string_lossy().into_owned(),
                rel: "/job_100".into(),
                fs_path: dir.to_string_lossy().into_owned(),
            },
            procs: Vec::new(),
            children: Vec::new(),
        }
    }

    #[test]
    fn test_parse_pressure() {
        let content = "some avg10=0.00 avg60=0.00 avg300=0.00 total=123456\n\
                       full avg10=0.00 avg60=0.00 avg300=0.00 total=1500000\n";
        assert_eq!(CgroupV2Reader::parse_pressure(content), Some(1.5));

        // Old kernels report only the `some` line
        let some_only = "some avg10=0.00 avg60=0.00 avg300=0.00 total=123456\n";
        assert_eq!(CgroupV2Reader::parse_pressure(some_only), None);
    }

    #[test]
    fn test_parse_io_stat() {
        let mut facts = HostFacts::default();
        facts.block_devices.insert("8:0".into(), "sda".into());

        let content = "8:0 rbytes=180224 wbytes=4096 rios=3 wios=1 dbytes=0 dios=0\n\
                       253:0 rbytes=0 wbytes=0 rios=0 wios=0 dbytes=0 dios=0\n";
        let devices = CgroupV2Reader::parse_io_stat(content, &facts);
        assert_eq!(devices["sda"].read_bytes, 180224);
        assert_eq!(devices["sda"].write_bytes, 4096);
        assert_eq!(devices["sda"].read_requests, 3);
        assert_eq!(devices["sda"].write_requests, 1);
        // Unresolvable device keeps the major:minor key
        assert!(devices.contains_key("253:0"));
    }

    #[test]
    fn test_parse_rdma() {
        let content = "mlx5_0 hca_handle=2 hca_object=2000\nmlx5_1 hca_handle=3 hca_object=max\n";
        let devices = CgroupV2Reader::parse_rdma(content);
        assert_eq!(devices["mlx5_0"].hca_handles, 2);
        assert_eq!(devices["mlx5_0"].hca_objects, 2000);
        assert_eq!(devices["mlx5_1"].hca_handles, 3);
        assert_eq!(devices["mlx5_1"].hca_objects, UNLIMITED);
    }

    #[tokio::test]
    async fn test_read_unit_full_record() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("job_100");
        fs::create_dir_all(&dir).await.unwrap();

        fs::write(
            dir.join("cpu.stat"),
            "usage_usec 5000000\nuser_usec 3000000\nsystem_usec 2000000\n",
        )
        .await
        .unwrap();
        fs::write(dir.join("memory.current"), "104857600\n").await.unwrap();
        fs::write(dir.join("memory.max"), "1073741824\n").await.unwrap();
        fs::write(dir.join("memory.stat"), "anon 52428800\nfile 26214400\n")
            .await
            .unwrap();
        fs::write(dir.join("memory.events"), "low 0\noom 2\noom_kill 1\n")
            .await
            .unwrap();
        fs::write(dir.join("memory.swap.current"), "0\n").await.unwrap();
        fs::write(dir.join("memory.swap.max"), "max\n").await.unwrap();
        fs::write(
            dir.join("memory.pressure"),
            "some avg10=0.00 avg60=0.00 avg300=0.00 total=100000\n\
             full avg10=0.00 avg60=0.00 avg300=0.00 total=50000\n",
        )
        .await
        .unwrap();

        let facts = HostFacts {
            mem_total_bytes: 64 << 30,
            swap_total_bytes: 8 << 30,
            block_devices: HashMap::new(),
        };
        let reader = CgroupV2Reader::new(facts);
        let rec = reader.read_unit(&cgroup_at(&dir)).await;

        assert!(!rec.err);
        assert_eq!(rec.cpu_user_secs, Some(3.0));
        assert_eq!(rec.cpu_system_secs, Some(2.0));
        assert_eq!(rec.cpu_total_secs, Some(5.0));
        assert_eq!(rec.memory_used_bytes, Some(104857600));
        assert_eq!(rec.memory_total_bytes, Some(1073741824));
        assert_eq!(rec.memory_rss_bytes, Some(52428800));
        assert_eq!(rec.memory_cache_bytes, Some(26214400));
        assert_eq!(rec.memory_fail_count, Some(2));
        assert_eq!(rec.memsw_used_bytes, Some(0));
        // Unlimited swap limit falls back to the host swap total
        assert_eq!(rec.memsw_total_bytes, Some(8 << 30));
        assert_eq!(rec.memory_psi_secs, Some(0.05));
        // No cpu.pressure file present
        assert_eq!(rec.cpu_psi_secs, None);
    }

    #[tokio::test]
    async fn test_read_unit_sentinel_substitution() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("job_100");
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join("memory.max"), "max\n").await.unwrap();

        let facts = HostFacts {
            mem_total_bytes: 64 << 30,
            ..HostFacts::default()
        };
        let rec = CgroupV2Reader::new(facts).read_unit(&cgroup_at(&dir)).await;
        assert_eq!(rec.memory_total_bytes, Some(64 << 30));

        // Without host facts the sentinel passes through
        let rec = CgroupV2Reader::new(HostFacts::default())
            .read_unit(&cgroup_at(&dir))
            .await;
        assert_eq!(rec.memory_total_bytes, Some(UNLIMITED));
    }

    #[tokio::test]
    async fn test_read_unit_vanished_cgroup_flags_record() {
        let reader = CgroupV2Reader::new(HostFacts::default());
        let rec = reader
            .read_unit(&cgroup_at(Path::new("/nonexistent/job_1")))
            .await;
        assert!(rec.err);
        assert_eq!(rec.uuid, "100");
        assert_eq!(rec.cpu_user_secs, None);
    }

    #[tokio::test]
    async fn test_read_unit_malformed_value_flags_record() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("job_100");
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join("memory.current"), "not-a-number\n")
            .await
            .unwrap();

        let rec = CgroupV2Reader::new(HostFacts::default())
            .read_unit(&cgroup_at(&dir))
            .await;
        assert!(rec.err);
        assert_eq!(rec.memory_used_bytes, None);
    }
}
