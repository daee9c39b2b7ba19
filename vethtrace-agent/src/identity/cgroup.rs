//! Process to pod UID resolution through `/proc/<pid>/cgroup`
//!
//! Kubernetes places every pod container under a per-pod cgroup. Depending on
//! the cgroup driver the pod segment looks like:
//! - systemd: `kubepods-{qos}-pod{uid}.slice` (UID with `_` separators)
//! - cgroupfs: `kubepods/{qos}/pod{uid}` (UID with `-` separators)

use super::ProcessResolver;
use crate::error::LookupError;
use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};

const PROC_ROOT: &str = "/proc";

/// Resolves pids to pod UIDs by reading their cgroup membership
pub struct CgroupProcessResolver {
    proc_root: PathBuf,
}

impl CgroupProcessResolver {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from(PROC_ROOT),
        }
    }

    /// Create a resolver with a custom procfs root (for testing)
    pub fn with_root(proc_root: impl AsRef<Path>) -> Self {
        Self {
            proc_root: proc_root.as_ref().to_path_buf(),
        }
    }
}

impl Default for CgroupProcessResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessResolver for CgroupProcessResolver {
    async fn pod_uid(&self, pid: u32) -> Result<String, LookupError> {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        let content =
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| LookupError::Process {
                    pid,
                    reason: format!("{}: {}", path.display(), e),
                })?;

        // hierarchy-ID:controller-list:cgroup-path
        let uid = content
            .lines()
            .filter_map(|line| line.splitn(3, ':').nth(2))
            .find_map(extract_pod_uid)
            .ok_or_else(|| LookupError::Process {
                pid,
                reason: "not in a kubepods cgroup".to_string(),
            })?;

        debug!("Resolved pid {} to pod UID {}", pid, uid);
        Ok(uid)
    }
}

/// Extract the raw pod UID from a cgroup path
fn extract_pod_uid(cgroup_path: &str) -> Option<String> {
    let mut under_kubepods = false;

    for segment in cgroup_path.split('/') {
        if segment.starts_with("kubepods") {
            under_kubepods = true;

            // systemd: kubepods-pod{uid}.slice or kubepods-{qos}-pod{uid}.slice
            if let Some(uid) = segment
                .strip_suffix(".slice")
                .and_then(|s| s.find("-pod").map(|start| &s[start + 4..]))
            {
                if !uid.is_empty() {
                    return Some(uid.to_string());
                }
            }
            continue;
        }

        // cgroupfs: kubepods/{qos}/pod{uid}
        if under_kubepods {
            if let Some(uid) = segment.strip_prefix("pod") {
                if !uid.is_empty() {
                    return Some(uid.to_string());
                }
            }
        }
    }

    None
}
