//! Identity correlation pipeline
//!
//! One producer task per monitored link pushes decoded records into a shared
//! bounded channel. A single consumer resolves each record's pid to its pod
//! and forwards the enriched metric to the agent-wide fan-in.

use crate::error::LookupError;
use crate::identity::{normalize_pod_uid, PodLookup, ProcessResolver};
use crate::links::{LinkChangeEvent, LinkChangeKind, LinkEndpoint};
use crate::metric::EnrichedMetric;
use crate::probe::ProbeFeed;
use crate::record::{decode_record, TrafficRecord};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Why a producer stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Error(String),
    LinkRemoved,
    FeedClosed,
    Shutdown,
}

/// Lifecycle of the producer attached to one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    ProbeAttached,
    Streaming,
    Terminated(TerminationReason),
}

impl ProducerState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, ProducerState::Terminated(_))
    }
}

/// Counters shared by the consumer and the stats reporter
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    emitted: AtomicU64,
    dropped_process: AtomicU64,
    dropped_pod: AtomicU64,
}

impl PipelineStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Records dropped because the pid could not be resolved to a pod UID
    pub fn dropped_process(&self) -> u64 {
        self.dropped_process.load(Ordering::Relaxed)
    }

    /// Records dropped because the pod could not be found or was incomplete
    pub fn dropped_pod(&self) -> u64 {
        self.dropped_pod.load(Ordering::Relaxed)
    }
}

/// Stamps pod identity onto traffic records
pub struct Correlator {
    processes: Arc<dyn ProcessResolver>,
    pods: Arc<dyn PodLookup>,
    service_label: String,
    stats: Arc<PipelineStats>,
}

impl Correlator {
    pub fn new(
        processes: Arc<dyn ProcessResolver>,
        pods: Arc<dyn PodLookup>,
        service_label: impl Into<String>,
    ) -> Self {
        Self {
            processes,
            pods,
            service_label: service_label.into(),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Resolve the record's owner and stamp its identity.
    ///
    /// Returns `None` when either lookup fails; there is no retry.
    pub async fn enrich(&self, record: TrafficRecord) -> Option<EnrichedMetric> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let raw_uid = match self.processes.pod_uid(record.process_id).await {
            Ok(uid) => uid,
            Err(e) => {
                debug!("Dropping record: {}", e);
                self.stats.dropped_process.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let uid = normalize_pod_uid(&raw_uid);
        let pod = match self.pods.pod_by_uid(&uid).await {
            Ok(pod) => pod,
            Err(e) => {
                warn!("Dropping record from pid {}: {}", record.process_id, e);
                self.stats.dropped_pod.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let node_address = match pod.host_ip.clone() {
            Some(ip) if !pod.name.is_empty() => ip,
            host_ip => {
                let field = if host_ip.is_none() { "host_ip" } else { "name" };
                warn!("Dropping record: {}", LookupError::IncompletePod { uid, field });
                self.stats.dropped_pod.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let service_name = pod
            .labels
            .get(&self.service_label)
            .filter(|name| !name.is_empty())
            .cloned()
            .unwrap_or_else(|| pod.name.clone());

        self.stats.emitted.fetch_add(1, Ordering::Relaxed);
        Some(EnrichedMetric {
            record,
            pod_name: pod.name,
            node_address,
            namespace: pod.namespace,
            service_name,
        })
    }

    /// Drain the shared record channel into the metric sink until cancelled
    pub async fn run(
        &self,
        mut records: mpsc::Receiver<TrafficRecord>,
        sink: mpsc::Sender<EnrichedMetric>,
        cancel: CancellationToken,
    ) {
        info!("Correlator started");

        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => break,
                next = records.recv() => match next {
                    Some(record) => record,
                    None => break,
                },
            };

            let enriched = tokio::select! {
                _ = cancel.cancelled() => break,
                enriched = self.enrich(record) => enriched,
            };
            let Some(metric) = enriched else {
                continue;
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = sink.send(metric) => {
                    if sent.is_err() {
                        warn!("Metric sink closed, stopping correlator");
                        break;
                    }
                }
            }
        }

        info!(
            "Correlator stopped (received: {}, emitted: {})",
            self.stats.received(),
            self.stats.emitted()
        );
    }
}

struct Producer {
    cancel: CancellationToken,
    state: Arc<watch::Sender<ProducerState>>,
}

/// Per-link producer tasks feeding the shared record channel
pub struct ProducerSet {
    feed: Arc<dyn ProbeFeed>,
    prefixes: Vec<String>,
    records: mpsc::Sender<TrafficRecord>,
    producers: DashMap<u32, Producer>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ProducerSet {
    /// Producers run on `tracker` and are cancelled with `cancel`
    pub fn new(
        feed: Arc<dyn ProbeFeed>,
        prefixes: Vec<String>,
        records: mpsc::Sender<TrafficRecord>,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            feed,
            prefixes,
            records,
            producers: DashMap::new(),
            tracker,
            cancel,
        }
    }

    /// Whether the link follows the container-side naming convention
    pub fn is_eligible(&self, link: &LinkEndpoint) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| link.name.starts_with(prefix.as_str()))
    }

    /// Spawn a producer for `link`.
    ///
    /// Returns false if one is already running for that index. Entries of
    /// producers that terminated on their own are dropped here.
    pub fn start(&self, link: LinkEndpoint) -> bool {
        if let Some(existing) = self.producers.get(&link.index) {
            if !existing.state.borrow().is_terminated() {
                debug!("Producer for {} already running", link.name);
                return false;
            }
        }
        self.producers.retain(|_, producer| !producer.state.borrow().is_terminated());

        let cancel = self.cancel.child_token();
        let (state, _) = watch::channel(ProducerState::Idle);
        let state = Arc::new(state);
        self.producers.insert(
            link.index,
            Producer {
                cancel: cancel.clone(),
                state: state.clone(),
            },
        );

        info!("Starting producer for {} (index {})", link.name, link.index);
        self.tracker.spawn(produce(
            self.feed.clone(),
            link,
            self.records.clone(),
            state,
            cancel,
        ));
        true
    }

    /// Stop and forget the producer for a removed link. Existing state
    /// watchers still observe the final state.
    pub fn stop(&self, index: u32) -> bool {
        let Some((_, producer)) = self.producers.remove(&index) else {
            return false;
        };
        transition(
            &producer.state,
            ProducerState::Terminated(TerminationReason::LinkRemoved),
        );
        producer.cancel.cancel();
        true
    }

    pub fn handle_event(&self, event: &LinkChangeEvent) {
        let link = &event.binding.link;
        match event.kind {
            LinkChangeKind::Added if self.is_eligible(link) => {
                self.start(link.clone());
            }
            LinkChangeKind::Added => debug!("Ignoring ineligible link {}", link.name),
            LinkChangeKind::Removed => {
                if self.stop(link.index) {
                    info!("Stopped producer for removed link {}", link.name);
                }
            }
        }
    }

    /// Re-provision producers from link change events until cancelled
    pub async fn follow(&self, mut events: mpsc::Receiver<LinkChangeEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = events.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(&event);
        }
        debug!("Stopped following link changes");
    }

    pub fn state(&self, index: u32) -> Option<ProducerState> {
        self.producers
            .get(&index)
            .map(|producer| producer.state.borrow().clone())
    }

    /// Observe state changes of the producer for `index`
    pub fn watch_state(&self, index: u32) -> Option<watch::Receiver<ProducerState>> {
        self.producers
            .get(&index)
            .map(|producer| producer.state.subscribe())
    }

    /// Number of producer entries, terminated ones not yet pruned included
    pub fn tracked(&self) -> usize {
        self.producers.len()
    }

    /// Number of producers that have not terminated
    pub fn active(&self) -> usize {
        self.producers
            .iter()
            .filter(|producer| !producer.state.borrow().is_terminated())
            .count()
    }
}

/// Terminated is final; later transitions are ignored
fn transition(state: &watch::Sender<ProducerState>, next: ProducerState) {
    state.send_if_modified(|current| {
        if current.is_terminated() {
            return false;
        }
        *current = next;
        true
    });
}

async fn produce(
    feed: Arc<dyn ProbeFeed>,
    link: LinkEndpoint,
    records: mpsc::Sender<TrafficRecord>,
    state: Arc<watch::Sender<ProducerState>>,
    cancel: CancellationToken,
) {
    let reason = tokio::select! {
        _ = cancel.cancelled() => TerminationReason::Shutdown,
        reason = stream_records(feed.as_ref(), &link, &records, &state) => reason,
    };

    match &reason {
        TerminationReason::Error(e) => warn!("Producer for {} failed: {}", link.name, e),
        reason => info!("Producer for {} stopped: {:?}", link.name, reason),
    }
    transition(&state, ProducerState::Terminated(reason));
}

async fn stream_records(
    feed: &dyn ProbeFeed,
    link: &LinkEndpoint,
    records: &mpsc::Sender<TrafficRecord>,
    state: &watch::Sender<ProducerState>,
) -> TerminationReason {
    let mut session = match feed.attach(link).await {
        Ok(session) => session,
        Err(e) => return TerminationReason::Error(e.to_string()),
    };
    transition(state, ProducerState::ProbeAttached);

    loop {
        let buf = match session.next_buffer().await {
            Ok(Some(buf)) => buf,
            Ok(None) => return TerminationReason::FeedClosed,
            Err(e) => return TerminationReason::Error(e.to_string()),
        };
        transition(state, ProducerState::Streaming);

        let record = match decode_record(&buf) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping record from {}: {}", link.name, e);
                continue;
            }
        };

        if records.send(record).await.is_err() {
            return TerminationReason::Error("record channel closed".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{PodCache, PodIdentity};
    use crate::links::{LinkKind, MacAddr, NeighborBinding};
    use crate::probe::testing::ChannelFeed;
    use crate::record::testing::RecordBuilder;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubResolver(Option<&'static str>);

    #[async_trait]
    impl ProcessResolver for StubResolver {
        async fn pod_uid(&self, pid: u32) -> Result<String, LookupError> {
            self.0.map(str::to_string).ok_or(LookupError::Process {
                pid,
                reason: "no such process".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingLookup {
        cache: PodCache,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PodLookup for RecordingLookup {
        async fn pod_by_uid(&self, uid: &str) -> Result<PodIdentity, LookupError> {
            self.calls.lock().unwrap().push(uid.to_string());
            self.cache.pod_by_uid(uid).await
        }
    }

    fn checkout_pod(host_ip: Option<&str>, labels: &[(&str, &str)]) -> PodIdentity {
        PodIdentity {
            uid: "abc-123".to_string(),
            name: "checkout-7d9f".to_string(),
            namespace: "shop".to_string(),
            host_ip: host_ip.map(str::to_string),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn build_correlator(
        uid: Option<&'static str>,
        pod: Option<PodIdentity>,
    ) -> (Correlator, Arc<RecordingLookup>) {
        let lookup = Arc::new(RecordingLookup::default());
        if let Some(pod) = pod {
            lookup.cache.insert(pod);
        }
        let correlator = Correlator::new(
            Arc::new(StubResolver(uid)),
            lookup.clone(),
            "app.kubernetes.io/name",
        );
        (correlator, lookup)
    }

    fn record() -> TrafficRecord {
        decode_record(&RecordBuilder::new().pid(4242).build()).unwrap()
    }

    #[tokio::test]
    async fn test_process_lookup_failure_drops_record() {
        let pod = checkout_pod(Some("192.168.1.10"), &[]);
        let (correlator, lookup) = build_correlator(None, Some(pod));

        assert!(correlator.enrich(record()).await.is_none());
        assert!(lookup.calls.lock().unwrap().is_empty());

        let stats = correlator.stats();
        assert_eq!(stats.received(), 1);
        assert_eq!(stats.dropped_process(), 1);
        assert_eq!(stats.emitted(), 0);
    }

    #[tokio::test]
    async fn test_pod_lookup_failure_drops_record() {
        let (correlator, _) = build_correlator(Some("unknown_pod"), None);

        assert!(correlator.enrich(record()).await.is_none());
        assert_eq!(correlator.stats().dropped_pod(), 1);
        assert_eq!(correlator.stats().emitted(), 0);
    }

    #[tokio::test]
    async fn test_uid_is_normalized_before_pod_lookup() {
        let pod = checkout_pod(Some("192.168.1.10"), &[("app.kubernetes.io/name", "checkout")]);
        let (correlator, lookup) = build_correlator(Some("abc_123"), Some(pod));

        let metric = correlator.enrich(record()).await.expect("Should enrich");
        assert_eq!(*lookup.calls.lock().unwrap(), vec!["abc-123".to_string()]);

        assert_eq!(metric.record.process_id, 4242);
        assert_eq!(metric.record.path, "");
        assert_eq!(metric.pod_name, "checkout-7d9f");
        assert_eq!(metric.node_address, "192.168.1.10");
        assert_eq!(metric.namespace, "shop");
        assert_eq!(metric.service_name, "checkout");
        assert_eq!(correlator.stats().emitted(), 1);
    }

    #[tokio::test]
    async fn test_missing_service_label_falls_back_to_pod_name() {
        let pod = checkout_pod(Some("192.168.1.10"), &[]);
        let (correlator, _) = build_correlator(Some("abc-123"), Some(pod));

        let metric = correlator.enrich(record()).await.expect("Should enrich");
        assert_eq!(metric.service_name, "checkout-7d9f");
    }

    #[tokio::test]
    async fn test_pod_without_host_ip_is_dropped() {
        let (correlator, _) = build_correlator(Some("abc-123"), Some(checkout_pod(None, &[])));

        assert!(correlator.enrich(record()).await.is_none());
        assert_eq!(correlator.stats().dropped_pod(), 1);
    }

    #[tokio::test]
    async fn test_run_forwards_only_enriched_records() {
        let pod = checkout_pod(Some("192.168.1.10"), &[]);
        let (correlator, _) = build_correlator(Some("abc_123"), Some(pod));
        let (record_tx, record_rx) = mpsc::channel(4);
        let (metric_tx, mut metric_rx) = mpsc::channel(4);

        record_tx.send(record()).await.unwrap();
        drop(record_tx);
        correlator
            .run(record_rx, metric_tx, CancellationToken::new())
            .await;

        let metric = metric_rx.recv().await.expect("One metric");
        assert_eq!(metric.namespace, "shop");
        assert!(metric_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (correlator, _) = build_correlator(None, None);
        let (_record_tx, record_rx) = mpsc::channel(4);
        let (metric_tx, _metric_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(
            Duration::from_secs(1),
            correlator.run(record_rx, metric_tx, cancel),
        )
        .await
        .expect("Correlator should stop");
    }

    struct Harness {
        feed: Arc<ChannelFeed>,
        set: ProducerSet,
        records: mpsc::Receiver<TrafficRecord>,
        cancel: CancellationToken,
    }

    fn harness() -> Harness {
        let feed = Arc::new(ChannelFeed::default());
        let (tx, records) = mpsc::channel(100);
        let cancel = CancellationToken::new();
        let set = ProducerSet::new(
            feed.clone(),
            vec!["veth".to_string(), "cali".to_string()],
            tx,
            TaskTracker::new(),
            cancel.clone(),
        );
        Harness {
            feed,
            set,
            records,
            cancel,
        }
    }

    fn veth(index: u32, name: &str) -> LinkEndpoint {
        LinkEndpoint::new(index, name, LinkKind::Veth)
    }

    fn event(kind: LinkChangeKind, link: LinkEndpoint) -> LinkChangeEvent {
        LinkChangeEvent {
            kind,
            binding: NeighborBinding {
                link,
                hardware_address: MacAddr([0x02, 0, 0, 0, 0, 0x01]),
                ip_address: Some(Ipv4Addr::new(10, 244, 0, 5)),
            },
        }
    }

    async fn wait_for_state(set: &ProducerSet, index: u32, expected: ProducerState) {
        let mut rx = set.watch_state(index).expect("Producer should exist");
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == expected))
            .await
            .expect("Timed out waiting for producer state")
            .expect("State channel closed");
    }

    #[test]
    fn test_eligibility_by_name_prefix() {
        let h = harness();
        assert!(h.set.is_eligible(&veth(4, "veth111")));
        assert!(h.set.is_eligible(&veth(5, "cali0a1b2c")));
        assert!(!h.set.is_eligible(&LinkEndpoint::new(2, "eth0", LinkKind::Other)));
        assert!(!h.set.is_eligible(&LinkEndpoint::new(3, "docker0", LinkKind::Bridge)));
    }

    #[tokio::test]
    async fn test_producer_lifecycle() {
        let mut h = harness();
        let buffers = h.feed.prepare("veth111");

        assert!(h.set.start(veth(4, "veth111")));
        wait_for_state(&h.set, 4, ProducerState::ProbeAttached).await;
        assert!(!h.set.start(veth(4, "veth111")));

        buffers.send(RecordBuilder::new().pid(7).build()).await.unwrap();
        let record = h.records.recv().await.unwrap();
        assert_eq!(record.process_id, 7);
        assert_eq!(h.set.state(4), Some(ProducerState::Streaming));
        assert_eq!(h.set.active(), 1);

        drop(buffers);
        wait_for_state(
            &h.set,
            4,
            ProducerState::Terminated(TerminationReason::FeedClosed),
        )
        .await;
        assert_eq!(h.set.active(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_buffer_is_skipped() {
        let mut h = harness();
        let buffers = h.feed.prepare("veth111");
        h.set.start(veth(4, "veth111"));

        buffers.send(vec![0u8; 10]).await.unwrap();
        buffers.send(RecordBuilder::new().pid(8).build()).await.unwrap();

        let record = h.records.recv().await.unwrap();
        assert_eq!(record.process_id, 8);
    }

    #[tokio::test]
    async fn test_attach_failure_terminates_with_error() {
        let h = harness();
        h.set.start(veth(9, "veth999"));

        let mut rx = h.set.watch_state(9).unwrap();
        let state = tokio::time::timeout(
            Duration::from_secs(1),
            rx.wait_for(ProducerState::is_terminated),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert!(matches!(
            state,
            ProducerState::Terminated(TerminationReason::Error(msg)) if msg.contains("veth999")
        ));
    }

    #[tokio::test]
    async fn test_removed_event_stops_producer() {
        let h = harness();
        let _buffers = h.feed.prepare("veth111");

        h.set.handle_event(&event(LinkChangeKind::Added, veth(4, "veth111")));
        wait_for_state(&h.set, 4, ProducerState::ProbeAttached).await;

        let state = h.set.watch_state(4).unwrap();
        h.set.handle_event(&event(LinkChangeKind::Removed, veth(4, "veth111")));
        assert_eq!(
            *state.borrow(),
            ProducerState::Terminated(TerminationReason::LinkRemoved)
        );
        assert!(h.set.state(4).is_none());

        // A terminated producer can be restarted for a recreated link
        let _buffers = h.feed.prepare("veth111");
        assert!(h.set.start(veth(4, "veth111")));
        wait_for_state(&h.set, 4, ProducerState::ProbeAttached).await;
    }

    #[tokio::test]
    async fn test_producer_entries_stay_bounded() {
        let h = harness();
        for index in 100..1100 {
            assert!(h.set.start(veth(index, "veth-churn")));
            assert!(h.set.stop(index));
        }
        assert_eq!(h.set.tracked(), 0);
        assert_eq!(h.set.active(), 0);

        // A producer that fails on its own is pruned by the next start
        h.set.start(veth(9, "veth999"));
        let mut rx = h.set.watch_state(9).unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(ProducerState::is_terminated))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h.set.tracked(), 1);

        let _buffers = h.feed.prepare("veth111");
        h.set.start(veth(4, "veth111"));
        assert_eq!(h.set.tracked(), 1);
        assert!(h.set.state(9).is_none());
    }

    #[tokio::test]
    async fn test_ineligible_link_is_ignored() {
        let h = harness();
        let eth0 = LinkEndpoint::new(2, "eth0", LinkKind::Other);
        h.set.handle_event(&event(LinkChangeKind::Added, eth0));
        assert!(h.set.state(2).is_none());
        assert!(!h.set.stop(2));
    }

    #[tokio::test]
    async fn test_follow_and_shutdown() {
        let Harness {
            feed, set, cancel, ..
        } = harness();
        let set = Arc::new(set);
        let _buffers = feed.prepare("veth111");
        let (events_tx, events_rx) = mpsc::channel(4);

        let follower = tokio::spawn({
            let set = set.clone();
            async move { set.follow(events_rx).await }
        });

        events_tx
            .send(event(LinkChangeKind::Added, veth(4, "veth111")))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while set.watch_state(4).is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("Producer should be started");
        wait_for_state(&set, 4, ProducerState::ProbeAttached).await;

        cancel.cancel();
        wait_for_state(
            &set,
            4,
            ProducerState::Terminated(TerminationReason::Shutdown),
        )
        .await;
        tokio::time::timeout(Duration::from_secs(1), follower)
            .await
            .expect("Follower should stop")
            .unwrap();
    }
}
