//! Process and pod identity lookups
//!
//! Traffic records only carry the originating pid. The pid is resolved to a
//! pod UID through its cgroup, and the UID to the pod object through a cache
//! kept in sync with the Kubernetes API.

pub mod cgroup;
pub mod pod_cache;
#[cfg(target_os = "linux")]
pub mod watcher;

pub use cgroup::CgroupProcessResolver;
pub use pod_cache::{PodCache, PodIdentity};

use crate::error::LookupError;
use async_trait::async_trait;

/// Resolves a process id to the UID of the pod that owns it.
///
/// The UID is returned in its raw, probe-side form and may use `_` as
/// separator; see [`normalize_pod_uid`].
#[async_trait]
pub trait ProcessResolver: Send + Sync {
    async fn pod_uid(&self, pid: u32) -> Result<String, LookupError>;
}

/// Resolves a pod UID to the pod object
#[async_trait]
pub trait PodLookup: Send + Sync {
    async fn pod_by_uid(&self, uid: &str) -> Result<PodIdentity, LookupError>;
}

/// Convert a probe-side pod UID to the API form (`_` -> `-`)
pub fn normalize_pod_uid(uid: &str) -> String {
    uid.replace('_', "-")
}
