//! Pod metadata cache keyed by pod UID
//!
//! Maintained by the pod watcher and queried by the correlation pipeline.

use super::PodLookup;
use crate::error::LookupError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The parts of a pod object needed to stamp identity onto traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodIdentity {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub host_ip: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// Thread-safe cache mapping pod UIDs to pod identity
#[derive(Clone, Default)]
pub struct PodCache {
    inner: Arc<DashMap<String, PodIdentity>>,
}

impl PodCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a pod
    pub fn insert(&self, pod: PodIdentity) {
        self.inner.insert(pod.uid.clone(), pod);
    }

    pub fn get(&self, uid: &str) -> Option<PodIdentity> {
        self.inner.get(uid).map(|r| r.clone())
    }

    pub fn remove(&self, uid: &str) -> Option<PodIdentity> {
        self.inner.remove(uid).map(|(_, v)| v)
    }

    /// Drop every pod not in `keep` (used after a full resync)
    pub fn retain_uids(&self, keep: &[String]) {
        self.inner.retain(|uid, _| keep.contains(uid));
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl PodLookup for PodCache {
    async fn pod_by_uid(&self, uid: &str) -> Result<PodIdentity, LookupError> {
        self.get(uid)
            .ok_or_else(|| LookupError::PodNotFound(uid.to_string()))
    }
}
