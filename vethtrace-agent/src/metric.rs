//! Enriched traffic metrics and the agent-wide metric fan-in

use crate::record::TrafficRecord;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Measurement name of traffic metrics
pub const TRAFFIC_MEASUREMENT: &str = "traffic";

/// A traffic record stamped with the identity of the pod that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedMetric {
    pub record: TrafficRecord,
    pub pod_name: String,
    pub node_address: String,
    pub namespace: String,
    pub service_name: String,
}

impl EnrichedMetric {
    /// Convert into the generic metric shipped downstream
    pub fn to_metric(&self) -> Metric {
        let r = &self.record;
        let mut metric = Metric::new(TRAFFIC_MEASUREMENT);

        metric.add_tag("podname", &self.pod_name);
        metric.add_tag("nodename", &self.node_address);
        metric.add_tag("namespace", &self.namespace);
        metric.add_tag("servicename", &self.service_name);
        metric.add_tag("dstip", r.destination_address.to_string());
        metric.add_tag("dstport", r.destination_port.to_string());
        metric.add_tag("srcip", r.source_address.to_string());
        metric.add_tag("srcport", r.source_port.to_string());

        metric.add_field("phase", r.phase);
        metric.add_field("seq", r.sequence);
        metric.add_field("duration", r.duration_ticks);
        metric.add_field("pid", r.process_id);
        metric.add_field("path", r.path.as_str());
        metric.add_field("status", r.status.as_str());
        metric
    }
}

impl fmt::Display for EnrichedMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.record;
        write!(
            f,
            "phase: {}, dstip: {}, dstport: {}, srcip: {}, srcport: {}, seq: {}",
            r.phase,
            r.destination_address,
            r.destination_port,
            r.source_address,
            r.source_port,
            r.sequence
        )
    }
}

/// Generic tagged metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: String,
    pub timestamp_ns: u64,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl Metric {
    pub fn new(name: impl Into<String>) -> Self {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        Self {
            name: name.into(),
            timestamp_ns,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.fields.insert(key.into(), value.into());
    }
}

/// Name-prefix filter applied before shipping
#[derive(Debug, Clone, Default)]
pub struct MetricFilter {
    prefixes: Vec<String>,
}

impl MetricFilter {
    /// An empty prefix list forwards everything
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    pub fn allows(&self, name: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }
}

/// Drain the metric fan-in and write every allowed metric as one JSON line.
///
/// Returns the number of metrics written.
pub async fn ship_metrics<W: Write>(
    mut metrics: mpsc::Receiver<EnrichedMetric>,
    filter: MetricFilter,
    mut out: W,
    cancel: CancellationToken,
) -> u64 {
    let mut shipped = 0;

    loop {
        let enriched = tokio::select! {
            _ = cancel.cancelled() => break,
            next = metrics.recv() => match next {
                Some(m) => m,
                None => break,
            },
        };

        debug!("traffic metric: {}", enriched);
        let metric = enriched.to_metric();
        if !filter.allows(&metric.name) {
            continue;
        }

        let written = serde_json::to_writer(&mut out, &metric)
            .map_err(std::io::Error::from)
            .and_then(|_| writeln!(out))
            .and_then(|_| out.flush());
        match written {
            Ok(()) => shipped += 1,
            Err(e) => warn!("Failed to ship metric: {}", e),
        }
    }

    info!("Metric shipping stopped after {} metrics", shipped);
    shipped
}
