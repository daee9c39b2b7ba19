//! Kubernetes pod watcher for tracking pod lifecycle events
//!
//! Watches the pods scheduled on this node and keeps the UID -> pod cache in
//! sync.

use super::{PodCache, PodIdentity};
use crate::error::LookupError;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    runtime::watcher::{self, Event},
    Client,
};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

impl PodIdentity {
    /// Extract identity from a pod object; pods without a UID are skipped
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let metadata = &pod.metadata;
        let uid = metadata.uid.clone().filter(|uid| !uid.is_empty())?;

        Some(Self {
            uid,
            name: metadata.name.clone().unwrap_or_default(),
            namespace: metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            host_ip: pod
                .status
                .as_ref()
                .and_then(|s| s.host_ip.clone())
                .filter(|ip| !ip.is_empty()),
            labels: metadata.labels.clone().unwrap_or_default(),
        })
    }
}

/// Kubernetes pod watcher that updates the pod cache
pub struct PodWatcher {
    client: Client,
    cache: PodCache,
    node_name: Option<String>,
}

impl PodWatcher {
    /// Create a watcher; with a node name only that node's pods are tracked
    pub async fn new(cache: PodCache, node_name: Option<String>) -> Result<Self, LookupError> {
        let client = Client::try_default().await.map_err(|e| {
            LookupError::Kubernetes(format!("Failed to create Kubernetes client: {}", e))
        })?;

        Ok(Self {
            client,
            cache,
            node_name,
        })
    }

    fn field_selector(&self) -> Option<String> {
        self.node_name
            .as_ref()
            .map(|node| format!("spec.nodeName={}", node))
    }

    /// Watch pods and update the cache until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Starting Kubernetes pod watcher (node: {})",
            self.node_name.as_deref().unwrap_or("all")
        );

        let pods: Api<Pod> = Api::all(self.client.clone());

        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(30);

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.watch_pods(&pods) => result,
            };

            match result {
                Ok(_) => {
                    warn!("Pod watch stream ended, reconnecting...");
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    error!("Pod watch failed: {}, reconnecting in {:?}", e, backoff);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, max_backoff);
                }
            }

            // Resync all pods after reconnection
            if let Err(e) = self.resync_all(&pods).await {
                error!("Failed to resync pods: {}", e);
            }
        }

        info!("Pod watcher stopped");
    }

    async fn watch_pods(&self, pods: &Api<Pod>) -> Result<(), LookupError> {
        let mut config = watcher::Config::default();
        if let Some(selector) = self.field_selector() {
            config = config.fields(&selector);
        }
        let mut stream = watcher::watcher(pods.clone(), config).boxed();

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| LookupError::Kubernetes(e.to_string()))?
        {
            match event {
                Event::Apply(pod) | Event::InitApply(pod) => {
                    self.handle_pod_apply(&pod);
                }
                Event::Delete(pod) => self.handle_pod_delete(&pod),
                Event::Init => debug!("Pod watcher initialized"),
                Event::InitDone => info!(
                    "Pod watcher initial sync complete. Tracking {} pods",
                    self.cache.len()
                ),
            }
        }

        Ok(())
    }

    async fn resync_all(&self, pods: &Api<Pod>) -> Result<(), LookupError> {
        info!("Resyncing all pods...");

        let mut params = ListParams::default();
        if let Some(selector) = self.field_selector() {
            params = params.fields(&selector);
        }
        let pod_list = pods
            .list(&params)
            .await
            .map_err(|e| LookupError::Kubernetes(format!("Failed to list pods: {}", e)))?;

        let mut seen = Vec::new();
        for pod in pod_list {
            if let Some(uid) = self.handle_pod_apply(&pod) {
                seen.push(uid);
            }
        }
        self.cache.retain_uids(&seen);

        info!("Resync complete. Tracking {} pods", self.cache.len());
        Ok(())
    }

    fn handle_pod_apply(&self, pod: &Pod) -> Option<String> {
        let identity = PodIdentity::from_pod(pod)?;
        let uid = identity.uid.clone();
        debug!(
            "Tracking pod {}/{} ({})",
            identity.namespace, identity.name, uid
        );
        self.cache.insert(identity);
        Some(uid)
    }

    fn handle_pod_delete(&self, pod: &Pod) {
        if let Some(uid) = pod.metadata.uid.as_deref() {
            if let Some(removed) = self.cache.remove(uid) {
                debug!("Removed pod {}/{} from cache", removed.namespace, removed.name);
            }
        }
    }
}
