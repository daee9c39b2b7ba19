//! Tracked link set and refresh cycle
//!
//! A refresh enumerates without holding any lock, computes the diff under
//! the read lock, applies it under the write lock, and only then delivers
//! change events. Delivery awaits every subscriber in turn: a slow
//! subscriber holds back the refresh cadence instead of losing events.

use super::{discover_links, LinkChangeEvent, LinkChangeKind, LinkSource, NeighborBinding};
use crate::error::{AgentError, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Result of one diff computation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkDiff {
    pub added: Vec<NeighborBinding>,
    pub removed: Vec<NeighborBinding>,
}

impl LinkDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Events in delivery order: every addition before any removal
    pub fn events(&self) -> impl Iterator<Item = LinkChangeEvent> + '_ {
        let added = self.added.iter().map(|b| LinkChangeEvent {
            kind: LinkChangeKind::Added,
            binding: b.clone(),
        });
        let removed = self.removed.iter().map(|b| LinkChangeEvent {
            kind: LinkChangeKind::Removed,
            binding: b.clone(),
        });
        added.chain(removed)
    }
}

/// Classify `current` against `tracked` by interface index.
pub fn compute_diff(
    current: &[NeighborBinding],
    tracked: &HashMap<u32, NeighborBinding>,
) -> LinkDiff {
    let mut remaining = tracked.clone();
    let mut added = Vec::new();

    for binding in current {
        remaining.remove(&binding.index());
        if !tracked.contains_key(&binding.index()) {
            added.push(binding.clone());
        }
    }

    let mut removed: Vec<_> = remaining.into_values().collect();
    removed.sort_by_key(|b| b.index());

    LinkDiff { added, removed }
}

/// Owner of the tracked link set and its subscribers
pub struct LinkTracker<S> {
    source: S,
    tracked: RwLock<HashMap<u32, NeighborBinding>>,
    listeners: Mutex<Vec<mpsc::Sender<LinkChangeEvent>>>,
}

impl<S: LinkSource> LinkTracker<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            tracked: RwLock::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber channel
    pub async fn subscribe(&self, capacity: usize) -> mpsc::Receiver<LinkChangeEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.listeners.lock().await.push(tx);
        rx
    }

    /// Copy of the currently tracked bindings
    pub async fn snapshot(&self) -> HashMap<u32, NeighborBinding> {
        self.tracked.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.tracked.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tracked.read().await.is_empty()
    }

    /// Run one diff cycle: enumerate, diff, apply, notify.
    ///
    /// An enumeration error leaves the tracked set untouched.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<LinkDiff> {
        let current = discover_links(&self.source).await?;

        let diff = {
            let tracked = self.tracked.read().await;
            compute_diff(&current, &tracked)
        };

        if !diff.is_empty() {
            let mut tracked = self.tracked.write().await;
            for binding in &diff.added {
                tracked.insert(binding.index(), binding.clone());
            }
            for binding in &diff.removed {
                tracked.remove(&binding.index());
            }
        }

        for binding in &diff.added {
            info!(
                "Link added: {} (index {}) neighbor {}",
                binding.link.name,
                binding.index(),
                binding.hardware_address
            );
        }
        for binding in &diff.removed {
            info!(
                "Link removed: {} (index {})",
                binding.link.name,
                binding.index()
            );
        }

        self.notify(&diff, cancel).await?;
        Ok(diff)
    }

    async fn notify(&self, diff: &LinkDiff, cancel: &CancellationToken) -> Result<()> {
        if diff.is_empty() {
            return Ok(());
        }

        let listeners = self.listeners.lock().await.clone();
        let mut closed = false;

        for event in diff.events() {
            for tx in &listeners {
                if tx.is_closed() {
                    closed = true;
                    continue;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                    sent = tx.send(event.clone()) => {
                        if sent.is_err() {
                            closed = true;
                        }
                    }
                }
            }
        }

        if closed {
            let mut listeners = self.listeners.lock().await;
            let before = listeners.len();
            listeners.retain(|tx| !tx.is_closed());
            debug!("Pruned {} closed link subscribers", before - listeners.len());
        }

        Ok(())
    }

    /// Refresh on every tick until cancelled. Enumeration errors are retried
    /// on the next tick.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.refresh(&cancel).await {
                Ok(diff) => debug!(
                    "Link refresh: {} added, {} removed",
                    diff.added.len(),
                    diff.removed.len()
                ),
                Err(AgentError::Cancelled) => break,
                Err(e) => warn!("Link refresh failed, retrying next tick: {}", e),
            }
        }

        info!("Link tracker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::testing::*;
    use crate::links::{LinkEndpoint, LinkKind};

    fn binding(index: u32, name: &str, mac: &str) -> NeighborBinding {
        NeighborBinding::new(
            LinkEndpoint::new(index, name, LinkKind::Veth),
            &neighbor(mac, [10, 0, 0, index as u8]),
        )
    }

    fn tracked_of(bindings: &[NeighborBinding]) -> HashMap<u32, NeighborBinding> {
        bindings.iter().map(|b| (b.index(), b.clone())).collect()
    }

    fn apply(tracked: &mut HashMap<u32, NeighborBinding>, diff: &LinkDiff) {
        for b in &diff.added {
            tracked.insert(b.index(), b.clone());
        }
        for b in &diff.removed {
            tracked.remove(&b.index());
        }
    }

    #[test]
    fn test_diff_added_and_removed() {
        let a = binding(1, "veth1", "0a:00:00:00:00:01");
        let b = binding(2, "veth2", "0a:00:00:00:00:02");
        let c = binding(3, "veth3", "0a:00:00:00:00:03");

        let tracked = tracked_of(&[a.clone(), b.clone()]);
        let current = vec![b.clone(), c.clone()];

        let diff = compute_diff(&current, &tracked);
        assert_eq!(diff.added, vec![c.clone()]);
        assert_eq!(diff.removed, vec![a]);

        let mut applied = tracked.clone();
        apply(&mut applied, &diff);
        assert_eq!(applied, tracked_of(&current));
    }

    #[test]
    fn test_diff_against_self_is_empty() {
        let bindings = vec![
            binding(1, "veth1", "0a:00:00:00:00:01"),
            binding(2, "veth2", "0a:00:00:00:00:02"),
        ];
        let diff = compute_diff(&bindings, &tracked_of(&bindings));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_diff_is_keyed_by_index_not_value() {
        let old = binding(5, "veth5", "0a:00:00:00:00:05");
        let replaced = binding(5, "vethnew", "0a:00:00:00:00:99");

        let diff = compute_diff(&[replaced], &tracked_of(&[old]));
        assert!(diff.is_empty());
    }

    fn scenario_source() -> StaticLinkSource {
        let source = StaticLinkSource::default();
        let mut state = StaticState {
            links: vec![
                LinkEndpoint::new(2, "eth0", LinkKind::Bridge),
                LinkEndpoint::new(111, "veth111", LinkKind::Veth),
            ],
            ..Default::default()
        };
        state
            .ipv4
            .insert(111, vec![neighbor("0a:58:0a:f4:00:05", [10, 244, 0, 5])]);
        source.set(state);
        source
    }

    #[tokio::test]
    async fn test_refresh_scenario() {
        let tracker = LinkTracker::new(scenario_source());
        let cancel = CancellationToken::new();

        let diff = tracker.refresh(&cancel).await.unwrap();
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].link.name, "veth111");
        assert!(diff.removed.is_empty());

        let snapshot = tracker.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&111));

        let diff = tracker.refresh(&cancel).await.unwrap();
        assert!(diff.is_empty());
        assert_eq!(tracker.len().await, 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_preserves_state() {
        let tracker = LinkTracker::new(scenario_source());
        let cancel = CancellationToken::new();
        tracker.refresh(&cancel).await.unwrap();

        tracker.source.set(StaticState {
            fail_links: true,
            ..Default::default()
        });
        assert!(tracker.refresh(&cancel).await.is_err());
        assert_eq!(tracker.len().await, 1);
    }

    #[tokio::test]
    async fn test_added_events_precede_removed() {
        let source = StaticLinkSource::default();
        let mut state = StaticState {
            links: vec![
                LinkEndpoint::new(1, "veth1", LinkKind::Veth),
                LinkEndpoint::new(2, "veth2", LinkKind::Veth),
            ],
            ..Default::default()
        };
        state.ipv4.insert(1, vec![neighbor("0a:00:00:00:00:01", [10, 0, 0, 1])]);
        state.ipv4.insert(2, vec![neighbor("0a:00:00:00:00:02", [10, 0, 0, 2])]);
        source.set(state);

        let tracker = LinkTracker::new(source);
        let mut first = tracker.subscribe(16).await;
        let mut second = tracker.subscribe(16).await;
        let cancel = CancellationToken::new();
        tracker.refresh(&cancel).await.unwrap();

        let mut state = StaticState {
            links: vec![
                LinkEndpoint::new(3, "veth3", LinkKind::Veth),
                LinkEndpoint::new(4, "veth4", LinkKind::Veth),
            ],
            ..Default::default()
        };
        state.ipv4.insert(3, vec![neighbor("0a:00:00:00:00:03", [10, 0, 0, 3])]);
        state.ipv4.insert(4, vec![neighbor("0a:00:00:00:00:04", [10, 0, 0, 4])]);
        tracker.source.set(state);
        tracker.refresh(&cancel).await.unwrap();

        for rx in [&mut first, &mut second] {
            let mut kinds = Vec::new();
            while let Ok(event) = rx.try_recv() {
                kinds.push(event.kind);
            }
            assert_eq!(
                kinds,
                vec![
                    LinkChangeKind::Added,
                    LinkChangeKind::Added,
                    LinkChangeKind::Added,
                    LinkChangeKind::Added,
                    LinkChangeKind::Removed,
                    LinkChangeKind::Removed,
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let tracker = LinkTracker::new(scenario_source());
        let dropped = tracker.subscribe(1).await;
        let mut kept = tracker.subscribe(4).await;
        drop(dropped);

        tracker.refresh(&CancellationToken::new()).await.unwrap();

        assert_eq!(tracker.listeners.lock().await.len(), 1);
        assert_eq!(kept.recv().await.unwrap().kind, LinkChangeKind::Added);
    }

    #[tokio::test]
    async fn test_full_subscriber_blocks_until_cancelled() {
        let tracker = LinkTracker::new(scenario_source());
        let _stalled = tracker.subscribe(1).await;
        let cancel = CancellationToken::new();

        // Fill the only slot so the next delivery has to wait
        tracker.listeners.lock().await[0]
            .send(LinkChangeEvent {
                kind: LinkChangeKind::Removed,
                binding: binding(9, "veth9", "0a:00:00:00:00:09"),
            })
            .await
            .unwrap();

        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            child.cancel();
        });

        assert!(matches!(
            tracker.refresh(&cancel).await,
            Err(AgentError::Cancelled)
        ));
        // Mutation is applied before delivery starts
        assert_eq!(tracker.len().await, 1);
    }
}
