//! Error taxonomy for the cgroup collector
//!
//! Per-workload trouble never surfaces here: a workload that cannot be
//! read in full is published with `collect_error=1` instead. These
//! variants cover the failures that abort a whole manager scrape or the
//! exporter's construction.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectError {
    /// Fatal at construction time; the caller cannot proceed.
    #[error("unknown workload manager {0:?} (expected slurm, libvirt or k8s)")]
    UnknownManager(String),

    /// Walking the root of a mount point failed; the scrape for this
    /// manager fails. An absent mount point is an empty workload set,
    /// not this error.
    #[error("failed to walk mount point {path}")]
    Walk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The cgroup filesystem layout could not be classified at all.
    #[error("cannot detect cgroup hierarchy under {0}")]
    UnknownHierarchy(PathBuf),
}
