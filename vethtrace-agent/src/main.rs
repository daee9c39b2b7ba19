//! vethtrace-agent - per-pod HTTP traffic telemetry
//!
//! The agent runs on each Kubernetes node and:
//! - Refreshes the container link table periodically
//! - Attaches a traffic probe to each new veth link
//! - Enriches probe records with pod identity
//! - Writes traffic metrics to stdout as JSON lines

use anyhow::Result;

#[cfg(not(target_os = "linux"))]
fn main() -> Result<()> {
    eprintln!("Error: vethtrace-agent requires Linux to attach traffic probes");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<()> {
    use anyhow::Context;
    use clap::Parser;
    use log::{error, info, warn};
    use std::sync::Arc;
    use tokio::signal;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;
    use vethtrace_agent::config::AgentConfig;
    use vethtrace_agent::identity::{watcher::PodWatcher, CgroupProcessResolver, PodCache};
    use vethtrace_agent::links::{netlink::NetlinkLinkSource, LinkTracker};
    use vethtrace_agent::metric::{ship_metrics, MetricFilter};
    use vethtrace_agent::pipeline::{Correlator, ProducerSet};
    use vethtrace_agent::probe::loader::{raise_memlock_limit, run_preflight_checks, AyaProbeFeed};

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AgentConfig::parse();
    config.validate().context("Invalid configuration")?;

    info!("vethtrace-agent starting...");

    if let Err(e) = raise_memlock_limit() {
        error!("{}", e);
        std::process::exit(1);
    }
    run_preflight_checks();

    let node_name = config.node_name.clone().or_else(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
    });

    let cancel = CancellationToken::new();
    let tasks = TaskTracker::new();

    // Link tracking
    let link_source = NetlinkLinkSource::connect().context("Failed to open link source")?;
    let tracker = Arc::new(LinkTracker::new(link_source));
    let link_events = tracker.subscribe(config.subscriber_capacity).await;

    // Pod identity
    let pod_cache = PodCache::new();
    match PodWatcher::new(pod_cache.clone(), node_name.clone()).await {
        Ok(watcher) => {
            let cancel = cancel.clone();
            tasks.spawn(async move { watcher.run(cancel).await });
        }
        Err(e) => warn!("{}. Running without pod enrichment.", e),
    }

    // Correlation pipeline
    let (record_tx, record_rx) = mpsc::channel(config.record_capacity);
    let (metric_tx, metric_rx) = mpsc::channel(config.metric_capacity);

    let correlator = Arc::new(Correlator::new(
        Arc::new(CgroupProcessResolver::with_root(&config.proc_root)),
        Arc::new(pod_cache.clone()),
        config.service_label.clone(),
    ));
    let stats = correlator.stats();

    let producers = Arc::new(ProducerSet::new(
        Arc::new(AyaProbeFeed::new(&config.probe_object, &config.probe_program)),
        config.link_prefixes.clone(),
        record_tx,
        tasks.clone(),
        cancel.clone(),
    ));

    tasks.spawn({
        let correlator = correlator.clone();
        let cancel = cancel.clone();
        async move { correlator.run(record_rx, metric_tx, cancel).await }
    });
    tasks.spawn({
        let producers = producers.clone();
        async move { producers.follow(link_events).await }
    });
    tasks.spawn({
        let filter = MetricFilter::new(config.metric_prefixes.clone());
        let cancel = cancel.clone();
        async move { ship_metrics(metric_rx, filter, std::io::stdout(), cancel).await }
    });
    tasks.spawn({
        let tracker = tracker.clone();
        let cancel = cancel.clone();
        let interval = config.refresh_interval();
        async move { tracker.run(interval, cancel).await }
    });

    // Periodic stats
    tasks.spawn({
        let cancel = cancel.clone();
        let tracker = tracker.clone();
        let producers = producers.clone();
        let pod_cache = pod_cache.clone();
        let mut ticker = tokio::time::interval(config.stats_interval());
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        info!(
                            "Stats: links={}, producers={}, pods={}, records={}, metrics={}, dropped_process={}, dropped_pod={}",
                            tracker.len().await,
                            producers.active(),
                            pod_cache.len(),
                            stats.received(),
                            stats.emitted(),
                            stats.dropped_process(),
                            stats.dropped_pod(),
                        );
                    }
                }
            }
        }
    });

    info!(
        "vethtrace-agent running on node {}. Press Ctrl+C to exit.",
        node_name.as_deref().unwrap_or("unknown")
    );

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    cancel.cancel();
    tasks.close();
    tasks.wait().await;

    info!("vethtrace-agent stopped");
    Ok(())
}
