//! Cgroup hierarchy classification
//!
//! Decides whether the host runs the unified (v2), legacy (v1) or hybrid
//! cgroup layout by probing the filesystem, with an optional forced
//! version for tests.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::info;

/// Cgroup hierarchy layout in use on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupMode {
    /// v1 only
    Legacy,
    /// v1 controllers with a mounted v2 hierarchy alongside
    Hybrid,
    /// v2 only
    Unified,
    Unknown,
}

impl CgroupMode {
    /// Whether v2 file semantics apply. Hybrid hosts keep their
    /// controllers on v1, so v1 code paths apply there.
    pub fn is_unified(&self) -> bool {
        matches!(self, CgroupMode::Unified)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CgroupMode::Legacy => "legacy",
            CgroupMode::Hybrid => "hybrid",
            CgroupMode::Unified => "unified",
            CgroupMode::Unknown => "unknown",
        }
    }
}

/// Testing override for the detected cgroup version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForcedVersion {
    V1,
    V2,
}

/// Classify the hierarchy rooted at `cgroup_root`.
///
/// A forced version short-circuits detection. Otherwise the presence of
/// `cgroup.controllers` at the root means unified; a nested `unified`
/// mount next to per-controller directories means hybrid; bare
/// per-controller directories mean legacy.
pub async fn detect_cgroup_mode(cgroup_root: &Path, force: Option<ForcedVersion>) -> CgroupMode {
    match force {
        Some(ForcedVersion::V2) => {
            info!("cgroup version forced to v2");
            return CgroupMode::Unified;
        }
        Some(ForcedVersion::V1) => {
            info!("cgroup version forced to v1");
            return CgroupMode::Legacy;
        }
        None => {}
    }

    if fs::metadata(cgroup_root.join("cgroup.controllers"))
        .await
        .is_ok()
    {
        return CgroupMode::Unified;
    }

    let has_v1_controllers = fs::metadata(cgroup_root.join("cpu")).await.is_ok()
        || fs::metadata(cgroup_root.join("memory")).await.is_ok()
        || fs::metadata(cgroup_root.join("cpuacct")).await.is_ok()
        || fs::metadata(cgroup_root.join("cpu,cpuacct")).await.is_ok();

    if has_v1_controllers {
        if fs::metadata(cgroup_root.join("unified/cgroup.controllers"))
            .await
            .is_ok()
        {
            return CgroupMode::Hybrid;
        }
        return CgroupMode::Legacy;
    }

    CgroupMode::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_detect_unified() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("cgroup.controllers"), "cpu memory io\n")
            .await
            .unwrap();

        let mode = detect_cgroup_mode(temp.path(), None).await;
        assert_eq!(mode, CgroupMode::Unified);
        assert!(mode.is_unified());
    }

    #[tokio::test]
    async fn test_detect_legacy() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("cpu,cpuacct")).await.unwrap();
        fs::create_dir_all(temp.path().join("memory")).await.unwrap();

        let mode = detect_cgroup_mode(temp.path(), None).await;
        assert_eq!(mode, CgroupMode::Legacy);
        assert!(!mode.is_unified());
    }

    #[tokio::test]
    async fn test_detect_hybrid() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("memory")).await.unwrap();
        fs::create_dir_all(temp.path().join("unified")).await.unwrap();
        fs::write(
            temp.path().join("unified/cgroup.controllers"),
            "\n",
        )
        .await
        .unwrap();

        let mode = detect_cgroup_mode(temp.path(), None).await;
        assert_eq!(mode, CgroupMode::Hybrid);
        // Hybrid keeps controllers on v1
        assert!(!mode.is_unified());
    }

    #[tokio::test]
    async fn test_detect_unknown() {
        let mode = detect_cgroup_mode(Path::new("/nonexistent/path"), None).await;
        assert_eq!(mode, CgroupMode::Unknown);
    }

    #[tokio::test]
    async fn test_force_overrides_detection() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("cgroup.controllers"), "cpu\n")
            .await
            .unwrap();

        let mode = detect_cgroup_mode(temp.path(), Some(ForcedVersion::V1)).await;
        assert_eq!(mode, CgroupMode::Legacy);

        let mode = detect_cgroup_mode(Path::new("/nonexistent"), Some(ForcedVersion::V2)).await;
        assert_eq!(mode, CgroupMode::Unified);
    }
}
