//! Workload-manager descriptors
//!
//! A [`ManagerDescriptor`] captures everything the discoverer and the
//! statistics readers need to know about one workload manager on one
//! host: where its cgroups mount, how workload IDs are spelled in paths,
//! which directories are step-level children, and which processes are
//! manager plumbing rather than user work. Descriptors are built once at
//! startup and are immutable afterwards; the walk and the readers stay
//! fully manager-agnostic.

use crate::collector::fs::unescape_systemd;
use crate::collector::mode::CgroupMode;
use crate::error::CollectError;
use anyhow::Result;
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Supported workload managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Manager {
    Slurm,
    Libvirt,
    K8s,
}

impl Manager {
    /// Short name used as the `manager` metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Manager::Slurm => "slurm",
            Manager::Libvirt => "libvirt",
            Manager::K8s => "k8s",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, CollectError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "slurm" => Ok(Manager::Slurm),
            "libvirt" => Ok(Manager::Libvirt),
            "k8s" | "kubernetes" => Ok(Manager::K8s),
            other => Err(CollectError::UnknownManager(other.to_string())),
        }
    }
}

/// Collapse v1 controller aliases onto the co-mounted directory name.
pub fn resolve_controller(name: &str) -> String {
    match name {
        "cpu" | "cpuacct" | "cpu,cpuacct" => "cpu,cpuacct".to_string(),
        "net_cls" | "net_prio" | "net_cls,net_prio" => "net_cls,net_prio".to_string(),
        other => other.to_string(),
    }
}

/// A workload-ID match extracted from a cgroup path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadMatch {
    pub id: String,
    /// Virtual-host tag, empty when the layout is single-node.
    pub host: String,
}

/// Immutable per-manager discovery recipe. See module docs.
#[derive(Debug, Clone)]
pub struct ManagerDescriptor {
    pub manager: Manager,
    pub mode: CgroupMode,
    /// Effective cgroup-fs root. Shifted to include the active controller
    /// segment on v1 so relative paths are controller-agnostic.
    pub root: PathBuf,
    /// Directories the discoverer walks.
    pub mount_points: Vec<PathBuf>,
    /// Active v1 controller (alias-resolved); empty on v2.
    pub controller: String,
    pub slices: Vec<String>,
    /// v2 only (e.g. `slurmstepd.scope`, `node0_slurmstepd.scope`).
    pub scopes: Vec<String>,
    id_regex: Regex,
    ignore_regex: Option<Regex>,
}

impl ManagerDescriptor {
    /// Build the descriptor for `manager` under the given hierarchy.
    ///
    /// `active_subsystem` only matters on v1; `systemd` switches the
    /// libvirt and Kubernetes path grammars between the systemd and
    /// cgroupfs drivers.
    pub async fn build(
        manager: Manager,
        mode: CgroupMode,
        cgroup_root: &Path,
        active_subsystem: &str,
        systemd: bool,
    ) -> Result<Self> {
        let unified = mode.is_unified();
        let controller = if unified {
            String::new()
        } else {
            resolve_controller(active_subsystem)
        };
        let root = if unified {
            cgroup_root.to_path_buf()
        } else {
            cgroup_root.join(&controller)
        };

        let mut slices = Vec::new();
        let mut scopes = Vec::new();
        let mut mount_points = Vec::new();

        match manager {
            Manager::Slurm => {
                if unified {
                    let system_slice = root.join("system.slice");
                    for name in list_dir_names(&system_slice).await {
                        if name == "slurmstepd.scope" || name.ends_with("_slurmstepd.scope") {
                            mount_points.push(system_slice.join(&name));
                            scopes.push(name);
                        }
                    }
                    slices.push("system.slice".to_string());
                } else {
                    for name in list_dir_names(&root).await {
                        if name == "slurm" || name.starts_with("slurm_") {
                            mount_points.push(root.join(&name));
                            slices.push(name);
                        }
                    }
                }
            }
            Manager::Libvirt => {
                let slice = if systemd { "machine.slice" } else { "machine" };
                slices.push(slice.to_string());
                mount_points.push(root.join(slice));
            }
            Manager::K8s => {
                for slice in ["kubepods", "kubepods.slice"] {
                    if fs::metadata(root.join(slice)).await.is_ok() {
                        mount_points.push(root.join(slice));
                        slices.push(slice.to_string());
                    }
                }
                if slices.len() > 1 {
                    warn!(
                        slices = ?slices,
                        "both kubepods and kubepods.slice exist, mixed cgroup drivers in use"
                    );
                }
            }
        }

        debug!(
            manager = manager.as_str(),
            mode = mode.as_str(),
            root = %root.display(),
            mounts = mount_points.len(),
            "built manager descriptor"
        );

        Ok(Self {
            manager,
            mode,
            root,
            mount_points,
            controller,
            slices,
            scopes,
            id_regex: id_regex(manager, unified, systemd)?,
            ignore_regex: ignore_regex(manager)?,
        })
    }

    /// Match an unescaped root-relative path against the manager's
    /// workload grammar. Kubernetes pod IDs have systemd-escape
    /// underscores folded back to hyphens.
    pub fn match_workload(&self, rel_path: &str) -> Option<WorkloadMatch> {
        let caps = self.id_regex.captures(rel_path)?;
        let raw = caps.name("id")?.as_str().trim();
        if raw.is_empty() {
            return None;
        }
        let id = match self.manager {
            Manager::K8s => raw.replace('_', "-"),
            _ => raw.to_string(),
        };
        let host = caps
            .name("host")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        Some(WorkloadMatch { id, host })
    }

    /// Whether a matched directory is a step-level child rather than the
    /// workload root.
    pub fn is_child(&self, rel_path: &str) -> bool {
        match self.manager {
            Manager::Slurm => rel_path.contains("/step_"),
            Manager::Libvirt => {
                rel_path.contains("/libvirt")
                    || rel_path.contains("/emulator")
                    || rel_path.contains("/vcpu")
            }
            Manager::K8s => {
                if rel_path.contains("/cri-containerd") {
                    return true;
                }
                let basename = rel_path.rsplit('/').next().unwrap_or("");
                !basename.contains("pod")
            }
        }
    }

    /// Whether a process belongs to the manager's own plumbing and must
    /// be dropped from the workload's process snapshot.
    pub fn ignore_process(&self, cmdline: &str) -> bool {
        self.ignore_regex
            .as_ref()
            .map(|re| re.is_match(cmdline))
            .unwrap_or(false)
    }

    /// Unescape a walked absolute path and express it relative to the
    /// effective root, `/`-prefixed. Returns `None` for paths outside
    /// the root.
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(format!("/{}", unescape_systemd(&rel.to_string_lossy())))
    }
}

fn id_regex(manager: Manager, unified: bool, systemd: bool) -> Result<Regex> {
    let pattern = match (manager, unified, systemd) {
        (Manager::Slurm, true, _) => {
            r"^/system\.slice/(?:(?P<host>[^/]+)_)?slurmstepd\.scope/job_(?P<id>[0-9]+)(?:/.*)?$"
        }
        (Manager::Slurm, false, _) => {
            r"^/slurm(?:_(?P<host>[^/]+))?(?:/.*?)?/job_(?P<id>[0-9]+)(?:/.*)?$"
        }
        (Manager::Libvirt, _, true) => {
            r"^/machine\.slice/machine-qemu-[0-9]+-(?P<id>instance-[0-9a-f]+)\.scope(?:/.*)?$"
        }
        (Manager::Libvirt, _, false) => {
            r"^/machine/qemu-[0-9]+-(?P<id>instance-[0-9a-f]+)[^/]*(?:/.*)?$"
        }
        (Manager::K8s, _, _) => {
            r"^/kubepods(?:\.slice)?(?:/.*?)?pod(?P<id>[0-9a-f]{8}[-_][0-9a-f]{4}[-_][0-9a-f]{4}[-_][0-9a-f]{4}[-_][0-9a-f]{12})(?:\.slice)?(?:/.*)?$"
        }
    };
    Ok(Regex::new(pattern)?)
}

fn ignore_regex(manager: Manager) -> Result<Option<Regex>> {
    match manager {
        Manager::Slurm => Ok(Some(Regex::new(
            r"^(?:slurmstepd:.*|sleep [0-9]+|/bin/bash\s+.*slurm_script.*)$",
        )?)),
        Manager::Libvirt | Manager::K8s => Ok(None),
    }
}

/// First-level directory names under `path`, empty when the directory is
/// absent or unreadable.
async fn list_dir_names(path: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let mut entries = match fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(_) => return names,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn slurm_v2() -> ManagerDescriptor {
        ManagerDescriptor::build(
            Manager::Slurm,
            CgroupMode::Unified,
            Path::new("/sys/fs/cgroup"),
            "",
            true,
        )
        .await
        .unwrap()
    }

    async fn slurm_v1() -> ManagerDescriptor {
        ManagerDescriptor::build(
            Manager::Slurm,
            CgroupMode::Legacy,
            Path::new("/sys/fs/cgroup"),
            "cpuacct",
            true,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_slurm_v2_id_extraction() {
        let desc = slurm_v2().await;

        let m = desc
            .match_workload("/system.slice/slurmstepd.scope/job_100")
            .unwrap();
        assert_eq!(m.id, "100");
        assert_eq!(m.host, "");

        let m = desc
            .match_workload("/system.slice/node0_slurmstepd.scope/job_200")
            .unwrap();
        assert_eq!(m.id, "200");
        assert_eq!(m.host, "node0");

        // Step directories still resolve to the owning job
        let m = desc
            .match_workload("/system.slice/slurmstepd.scope/job_101/step_extern")
            .unwrap();
        assert_eq!(m.id, "101");

        assert!(desc.match_workload("/system.slice/sshd.service").is_none());
        assert!(desc.match_workload("/user.slice/user-1000.slice").is_none());
    }

    #[tokio::test]
    async fn test_slurm_v1_id_extraction() {
        let desc = slurm_v1().await;
        assert_eq!(desc.controller, "cpu,cpuacct");

        let m = desc.match_workload("/slurm/uid_1000/job_211").unwrap();
        assert_eq!(m.id, "211");
        assert_eq!(m.host, "");

        let m = desc.match_workload("/slurm_node1/uid_1000/job_300").unwrap();
        assert_eq!(m.id, "300");
        assert_eq!(m.host, "node1");

        assert!(desc.match_workload("/slurm/uid_1000").is_none());
    }

    #[tokio::test]
    async fn test_libvirt_id_extraction() {
        let desc = ManagerDescriptor::build(
            Manager::Libvirt,
            CgroupMode::Unified,
            Path::new("/sys/fs/cgroup"),
            "",
            true,
        )
        .await
        .unwrap();

        let m = desc
            .match_workload("/machine.slice/machine-qemu-1-instance-0000000a.scope")
            .unwrap();
        assert_eq!(m.id, "instance-0000000a");

        assert!(desc
            .match_workload("/machine.slice/machine-lxc-1-web.scope")
            .is_none());

        let nosystemd = ManagerDescriptor::build(
            Manager::Libvirt,
            CgroupMode::Unified,
            Path::new("/sys/fs/cgroup"),
            "",
            false,
        )
        .await
        .unwrap();

        let m = nosystemd
            .match_workload("/machine/qemu-2-instance-000000ff.libvirt-qemu")
            .unwrap();
        assert_eq!(m.id, "instance-000000ff");
    }

    #[tokio::test]
    async fn test_k8s_id_normalization() {
        let desc = ManagerDescriptor::build(
            Manager::K8s,
            CgroupMode::Unified,
            Path::new("/sys/fs/cgroup"),
            "",
            true,
        )
        .await
        .unwrap();

        // systemd driver escapes hyphens to underscores; they fold back
        let m = desc
            .match_workload(
                "/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod2fc932ce_fdcc_454b_97bd_aadfdeb4c340.slice",
            )
            .unwrap();
        assert_eq!(m.id, "2fc932ce-fdcc-454b-97bd-aadfdeb4c340");

        // cgroupfs driver keeps hyphens
        let m = desc
            .match_workload("/kubepods/burstable/pod2fc932ce-fdcc-454b-97bd-aadfdeb4c340")
            .unwrap();
        assert_eq!(m.id, "2fc932ce-fdcc-454b-97bd-aadfdeb4c340");

        assert!(desc.match_workload("/kubepods.slice/kubepods-burstable.slice").is_none());
    }

    #[tokio::test]
    async fn test_child_classification() {
        let slurm = slurm_v2().await;
        assert!(slurm.is_child("/system.slice/slurmstepd.scope/job_101/step_extern"));
        assert!(!slurm.is_child("/system.slice/slurmstepd.scope/job_211"));

        let libvirt = ManagerDescriptor::build(
            Manager::Libvirt,
            CgroupMode::Unified,
            Path::new("/sys/fs/cgroup"),
            "",
            true,
        )
        .await
        .unwrap();
        let scope = "/machine.slice/machine-qemu-1-instance-0000000a.scope";
        assert!(!libvirt.is_child(scope));
        assert!(libvirt.is_child(&format!("{scope}/libvirt/vcpu0")));
        assert!(libvirt.is_child(&format!("{scope}/libvirt/emulator")));

        let k8s = ManagerDescriptor::build(
            Manager::K8s,
            CgroupMode::Unified,
            Path::new("/sys/fs/cgroup"),
            "",
            true,
        )
        .await
        .unwrap();
        let pod = "/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod2fc932ce_fdcc_454b_97bd_aadfdeb4c340.slice";
        assert!(!k8s.is_child(pod));
        assert!(k8s.is_child(&format!(
            "{pod}/cri-containerd-8f1a41a32c8b0d32f1e7a06a3b0f3fb2ad909e2bbccf83aa3b4a38f6e0a1c2d3.scope"
        )));
        assert!(k8s.is_child(
            "/kubepods/burstable/pod2fc932ce-fdcc-454b-97bd-aadfdeb4c340/8f1a41a32c8b0d32f1e7a06a3b0f3fb2ad909e2bbccf83aa3b4a38f6e0a1c2d3"
        ));
    }

    #[tokio::test]
    async fn test_process_ignore_filter() {
        let desc = slurm_v2().await;
        assert!(desc.ignore_process("slurmstepd: [123.0]"));
        assert!(desc.ignore_process("sleep 100000000"));
        assert!(desc.ignore_process("/bin/bash /var/spool/slurmd/job0001/slurm_script"));
        assert!(!desc.ignore_process("python train.py"));
        assert!(!desc.ignore_process("sleep forever"));

        let k8s = ManagerDescriptor::build(
            Manager::K8s,
            CgroupMode::Unified,
            Path::new("/sys/fs/cgroup"),
            "",
            true,
        )
        .await
        .unwrap();
        assert!(!k8s.ignore_process("slurmstepd: [123.0]"));
    }

    #[tokio::test]
    async fn test_controller_alias_resolution() {
        assert_eq!(resolve_controller("cpu"), "cpu,cpuacct");
        assert_eq!(resolve_controller("cpuacct"), "cpu,cpuacct");
        assert_eq!(resolve_controller("net_cls"), "net_cls,net_prio");
        assert_eq!(resolve_controller("net_prio"), "net_cls,net_prio");
        assert_eq!(resolve_controller("memory"), "memory");
    }

    #[tokio::test]
    async fn test_manager_names() {
        assert_eq!(Manager::from_name("slurm").unwrap(), Manager::Slurm);
        assert_eq!(Manager::from_name("K8S").unwrap(), Manager::K8s);
        assert_eq!(Manager::from_name("kubernetes").unwrap(), Manager::K8s);
        assert!(matches!(
            Manager::from_name("mesos"),
            Err(CollectError::UnknownManager(_))
        ));
    }

    #[tokio::test]
    async fn test_slurm_v2_scope_enumeration() {
        use tempfile::TempDir;
        let temp = TempDir::new().unwrap();
        let system_slice = temp.path().join("system.slice");
        fs::create_dir_all(system_slice.join("slurmstepd.scope"))
            .await
            .unwrap();
        fs::create_dir_all(system_slice.join("node0_slurmstepd.scope"))
            .await
            .unwrap();
        fs::create_dir_all(system_slice.join("sshd.service"))
            .await
            .unwrap();

        let desc = ManagerDescriptor::build(
            Manager::Slurm,
            CgroupMode::Unified,
            temp.path(),
            "",
            true,
        )
        .await
        .unwrap();

        assert_eq!(
            desc.scopes,
            vec!["node0_slurmstepd.scope", "slurmstepd.scope"]
        );
        assert_eq!(desc.mount_points.len(), 2);
    }

    #[tokio::test]
    async fn test_v1_root_is_controller_shifted() {
        use tempfile::TempDir;
        let temp = TempDir::new().unwrap();
        let controller_root = temp.path().join("cpu,cpuacct");
        fs::create_dir_all(controller_root.join("slurm")).await.unwrap();

        let desc = ManagerDescriptor::build(
            Manager::Slurm,
            CgroupMode::Legacy,
            temp.path(),
            "cpuacct",
            true,
        )
        .await
        .unwrap();

        assert_eq!(desc.root, controller_root);
        assert_eq!(desc.slices, vec!["slurm"]);
        assert_eq!(desc.mount_points, vec![controller_root.join("slurm")]);

        // Relative paths come out controller-agnostic
        let rel = desc
            .relative_path(&controller_root.join("slurm/uid_1000/job_42"))
            .unwrap();
        assert_eq!(rel, "/slurm/uid_1000/job_42");
    }
}
