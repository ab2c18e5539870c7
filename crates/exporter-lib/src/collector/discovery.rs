//! Workload discovery
//!
//! Walks a manager's mount points, matches directories against the
//! manager's workload grammar and snapshots the processes found in each
//! matched cgroup. Everything produced here is ephemeral: the walk runs
//! afresh on every scrape and nothing is cached across scrapes.
//!
//! Failure handling follows the hierarchy's churn model: an unreadable
//! mount-point root fails the whole manager scrape, while errors on
//! individual entries usually mean a cgroup vanished mid-walk and are
//! logged at debug and skipped.

use crate::collector::fs::unescape_systemd;
use crate::collector::manager::ManagerDescriptor;
use crate::error::CollectError;
use crate::models::{Cgroup, CgroupPath, Process};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

#[derive(Default)]
struct WalkState {
    roots: Vec<Cgroup>,
    procs: HashMap<String, Vec<Process>>,
    children: HashMap<String, Vec<String>>,
}

/// Enumerate the live workload cgroups described by `desc`.
///
/// Output order is the walk order: stable within a run, unspecified
/// across runs. Absent mount points yield an empty workload set.
pub async fn discover(
    desc: &ManagerDescriptor,
    procfs: &Path,
) -> Result<Vec<Cgroup>, CollectError> {
    let walker = Walker { desc, procfs };
    let mut state = WalkState::default();

    for mount in &desc.mount_points {
        if fs::metadata(mount).await.is_err() {
            debug!(mount = %mount.display(), "mount point absent, skipping");
            continue;
        }
        walker.walk_mount(mount, &mut state).await?;
    }

    let mut cgroups = state.roots;
    for cgroup in &mut cgroups {
        if let Some(procs) = state.procs.remove(&cgroup.id) {
            cgroup.procs = procs;
        }
        if let Some(children) = state.children.remove(&cgroup.id) {
            cgroup.children = children;
        }
    }
    Ok(cgroups)
}

struct Walker<'a> {
    desc: &'a ManagerDescriptor,
    procfs: &'a Path,
}

impl Walker<'_> {
    /// Walk one mount point. Failing to read the mount root itself is
    /// fatal for the scrape.
    async fn walk_mount(&self, mount: &Path, state: &mut WalkState) -> Result<(), CollectError> {
        self.inspect(mount, state).await;

        let mut entries = fs::read_dir(mount).await.map_err(|source| CollectError::Walk {
            path: mount.to_path_buf(),
            source,
        })?;
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                        self.visit(entry.path(), state).await;
                    }
                }
                Ok(None) => break,
                Err(source) => {
                    return Err(CollectError::Walk {
                        path: mount.to_path_buf(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    /// Visit one directory below the mount root. Entries that disappear
    /// under us are skipped.
    async fn visit(&self, dir: PathBuf, state: &mut WalkState) {
        self.inspect(&dir, state).await;

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "cgroup vanished mid-walk");
                return;
            }
        };
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                        Box::pin(self.visit(entry.path(), state)).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "directory listing interrupted");
                    break;
                }
            }
        }
    }

    /// Match, snapshot processes and classify a single directory.
    async fn inspect(&self, dir: &Path, state: &mut WalkState) {
        let Some(rel) = self.desc.relative_path(dir) else {
            return;
        };
        let Some(matched) = self.desc.match_workload(&rel) else {
            return;
        };

        let procs = self.read_procs(dir).await;
        if !procs.is_empty() {
            state
                .procs
                .entry(matched.id.clone())
                .or_default()
                .extend(procs);
        }

        state
            .children
            .entry(matched.id.clone())
            .or_default()
            .push(rel.clone());

        if !self.desc.is_child(&rel) {
            let abs = unescape_systemd(&dir.to_string_lossy());
            state.roots.push(Cgroup {
                uuid: matched.id.clone(),
                id: matched.id,
                hostname: matched.host,
                path: CgroupPath {
                    abs,
                    rel,
                    fs_path: dir.to_string_lossy().to_string(),
                },
                procs: Vec::new(),
                children: Vec::new(),
            });
        }
    }

    /// Snapshot `cgroup.procs`, resolving each pid's cmdline and dropping
    /// manager plumbing. Pids that exit between the list and the cmdline
    /// read simply drop out.
    async fn read_procs(&self, dir: &Path) -> Vec<Process> {
        let path = dir.join("cgroup.procs");
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "could not read cgroup.procs");
                return Vec::new();
            }
        };

        let mut procs = Vec::new();
        for line in content.lines() {
            let Ok(pid) = line.trim().parse::<i32>() else {
                continue;
            };
            let Some(cmdline) = self.read_cmdline(pid).await else {
                continue;
            };
            if self.desc.ignore_process(&cmdline) {
                continue;
            }
            procs.push(Process { pid, cmdline });
        }
        procs
    }

    async fn read_cmdline(&self, pid: i32) -> Option<String> {
        let path = self.procfs.join(pid.to_string()).join("cmdline");
        match fs::read(&path).await {
            Ok(raw) => Some(
                raw.split(|b| *b == 0)
                    .filter(|part| !part.is_empty())
                    .map(String::from_utf8_lossy)
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            Err(e) => {
                debug!(pid, error = %e, "process exited before cmdline read");
                None
            }
        }
    }
}
