//! Allocated-CPU derivation
//!
//! Each manager records its CPU grant differently:
//! - SLURM pins jobs to cpusets, so the budget is the size of the
//!   effective cpuset.
//! - libvirt gives each virtual CPU its own child cgroup, so the budget
//!   is the vcpu directory count.
//! - Kubernetes expresses requests as cpu shares (v1) or the cpu.weight
//!   remapping of them (v2), which convert back to milli-CPUs.

use crate::collector::manager::{Manager, ManagerDescriptor};
use crate::collector::fs::parse_range;
use crate::models::Cgroup;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const MIN_SHARES: u64 = 2;
const MAX_SHARES: u64 = 262_144;
const SHARES_PER_CPU: u64 = 1024;

/// Invert the kernel's shares→weight mapping. weight 1 maps to the
/// 2-share floor, weight 10000 to the 262144-share ceiling.
pub fn weight_to_shares(weight: u64) -> u64 {
    let shares = weight
        .saturating_sub(1)
        .saturating_mul(MAX_SHARES - MIN_SHARES)
        / 9999
        + MIN_SHARES;
    shares.clamp(MIN_SHARES, MAX_SHARES)
}

/// Milli-CPUs a share grant corresponds to.
pub fn shares_to_millicpu(shares: u64) -> u64 {
    shares.clamp(MIN_SHARES, MAX_SHARES) * 1000 / SHARES_PER_CPU
}

/// Derive the allocated milli-CPUs for one workload. `None` when the
/// source file or directory is missing or malformed; the sample is
/// simply not emitted then.
pub async fn allocated_millicpu(
    desc: &ManagerDescriptor,
    cgroup_root: &Path,
    cgroup: &Cgroup,
    systemd: bool,
) -> Option<u64> {
    let fs_path = PathBuf::from(&cgroup.path.fs_path);
    let unified = desc.mode.is_unified();

    match desc.manager {
        Manager::Slurm => {
            let cpuset_file = if unified {
                fs_path.join("cpuset.cpus.effective")
            } else {
                // cpuset lives in its own v1 hierarchy
                let rel = fs_path.strip_prefix(&desc.root).ok()?;
                cgroup_root.join("cpuset").join(rel).join("cpuset.cpus")
            };
            let content = read_or_none(&cpuset_file).await?;
            match parse_range(content.trim()) {
                Ok(cpus) => Some(cpus.len() as u64 * 1000),
                Err(e) => {
                    debug!(path = %cpuset_file.display(), error = %e, "malformed cpuset range");
                    None
                }
            }
        }
        Manager::Libvirt => {
            let vcpu_parent = if unified && systemd {
                fs_path.join("libvirt")
            } else {
                fs_path
            };
            let count = count_vcpu_dirs(&vcpu_parent).await?;
            Some(count * 1000)
        }
        Manager::K8s => {
            let shares = if unified {
                let content = read_or_none(&fs_path.join("cpu.weight")).await?;
                weight_to_shares(content.trim().parse().ok()?)
            } else {
                let rel = fs_path.strip_prefix(&desc.root).ok()?;
                let shares_file = cgroup_root.join("cpu,cpuacct").join(rel).join("cpu.shares");
                let content = read_or_none(&shares_file).await?;
                content.trim().parse().ok()?
            };
            Some(shares_to_millicpu(shares))
        }
    }
}

async fn read_or_none(path: &Path) -> Option<String> {
    match fs::read_to_string(path).await {
        Ok(content) => Some(content),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "cpu budget source unreadable");
            None
        }
    }
}

async fn count_vcpu_dirs(parent: &Path) -> Option<u64> {
    let mut entries = fs::read_dir(parent).await.ok()?;
    let mut count = 0u64;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with("vcpu")
            && entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false)
        {
            count += 1;
        }
    }
    Some(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::manager::ManagerDescriptor;
    use crate::collector::mode::CgroupMode;
    use crate::models::CgroupPath;
    use tempfile::TempDir;

    fn cgroup_at(fs_path: &Path, rel: &str) -> Cgroup {
        Cgroup {
            id: "x".into(),
            uuid: "x".into(),
            hostname: String::new(),
            path: CgroupPath {
                abs: fs_path.to_string_lossy().into_owned(),
                rel: rel.to_string(),
                fs_path: fs_path.to_string_lossy().into_owned(),
            },
            procs: Vec::new(),
            children: Vec::new(),
        }
    }

    #[test]
    fn test_weight_to_shares_bounds() {
        assert_eq!(weight_to_shares(1), 2);
        assert_eq!(weight_to_shares(10000), 262144);
        // Monotone across the range
        let mut last = 0;
        for weight in [1, 2, 10, 100, 1000, 5000, 10000] {
            let shares = weight_to_shares(weight);
            assert!(shares >= last);
            last = shares;
        }
        // Clamped past the ceiling
        assert_eq!(weight_to_shares(20000), 262144);
    }

    #[test]
    fn test_weight_100_is_roughly_two_and_a_half_cpus() {
        let shares = weight_to_shares(100);
        assert_eq!(shares, 2597);
        assert_eq!(shares_to_millicpu(shares), 2536);
    }

    #[test]
    fn test_shares_to_millicpu() {
        assert_eq!(shares_to_millicpu(1024), 1000);
        assert_eq!(shares_to_millicpu(2048), 2000);
        // Floor and ceiling respected
        assert_eq!(shares_to_millicpu(0), MIN_SHARES * 1000 / 1024);
        assert_eq!(shares_to_millicpu(u64::MAX), 256000);
    }

    #[tokio::test]
    async fn test_slurm_cpuset_budget() {
        let temp = TempDir::new().unwrap();
        let job = temp.path().join("system.slice/slurmstepd.scope/job_100");
        fs::create_dir_all(&job).await.unwrap();
        fs::write(job.join("cpuset.cpus.effective"), "0-1\n").await.unwrap();

        let desc = ManagerDescriptor::build(
            Manager::Slurm,
            CgroupMode::Unified,
            temp.path(),
            "",
            true,
        )
        .await
        .unwrap();

        let millis = allocated_millicpu(
            &desc,
            temp.path(),
            &cgroup_at(&job, "/system.slice/slurmstepd.scope/job_100"),
            true,
        )
        .await;
        assert_eq!(millis, Some(2000));
    }

    #[tokio::test]
    async fn test_libvirt_vcpu_budget() {
        let temp = TempDir::new().unwrap();
        let scope = temp
            .path()
            .join("machine.slice/machine-qemu-1-instance-0000000a.scope");
        for vcpu in ["vcpu0", "vcpu1", "vcpu2"] {
            fs::create_dir_all(scope.join("libvirt").join(vcpu))
                .await
                .unwrap();
        }
        fs::create_dir_all(scope.join("libvirt/emulator")).await.unwrap();

        let desc = ManagerDescriptor::build(
            Manager::Libvirt,
            CgroupMode::Unified,
            temp.path(),
            "",
            true,
        )
        .await
        .unwrap();

        let millis = allocated_millicpu(
            &desc,
            temp.path(),
            &cgroup_at(
                &scope,
                "/machine.slice/machine-qemu-1-instance-0000000a.scope",
            ),
            true,
        )
        .await;
        assert_eq!(millis, Some(3000));
    }

    #[tokio::test]
    async fn test_k8s_weight_budget() {
        let temp = TempDir::new().unwrap();
        let pod = temp.path().join(
            "kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod2fc932ce_fdcc_454b_97bd_aadfdeb4c340.slice",
        );
        fs::create_dir_all(&pod).await.unwrap();
        fs::write(pod.join("cpu.weight"), "100\n").await.unwrap();

        let desc = ManagerDescriptor::build(
            Manager::K8s,
            CgroupMode::Unified,
            temp.path(),
            "",
            true,
        )
        .await
        .unwrap();

        let millis = allocated_millicpu(
            &desc,
            temp.path(),
            &cgroup_at(&pod, "/kubepods.slice/..."),
            true,
        )
        .await;
        assert_eq!(millis, Some(2536));
    }

    #[tokio::test]
    async fn test_missing_budget_source_is_none() {
        let temp = TempDir::new().unwrap();
        let desc = ManagerDescriptor::build(
            Manager::Slurm,
            CgroupMode::Unified,
            temp.path(),
            "",
            true,
        )
        .await
        .unwrap();
        let job = temp.path().join("system.slice/slurmstepd.scope/job_1");
        let millis =
            allocated_millicpu(&desc, temp.path(), &cgroup_at(&job, "/job_1"), true).await;
        assert_eq!(millis, None);
    }
}
