//! Agent configuration from command-line flags and environment

use crate::error::AgentError;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "vethtrace-agent")]
#[command(about = "Per-pod HTTP traffic telemetry from container veth links", long_about = None)]
#[command(version)]
pub struct AgentConfig {
    /// Seconds between link table refreshes
    #[arg(long, env = "VETHTRACE_REFRESH_INTERVAL_SECS", default_value_t = 10)]
    pub refresh_interval_secs: u64,

    /// Capacity of the channel shared by all producers
    #[arg(long, env = "VETHTRACE_RECORD_CAPACITY", default_value_t = 100)]
    pub record_capacity: usize,

    /// Capacity of the agent-wide metric channel
    #[arg(long, env = "VETHTRACE_METRIC_CAPACITY", default_value_t = 1000)]
    pub metric_capacity: usize,

    /// Capacity of each link change subscription
    #[arg(long, env = "VETHTRACE_SUBSCRIBER_CAPACITY", default_value_t = 64)]
    pub subscriber_capacity: usize,

    /// Name prefixes of links to attach probes to
    #[arg(
        long = "link-prefix",
        env = "VETHTRACE_LINK_PREFIXES",
        value_delimiter = ',',
        default_values_t = ["veth".to_string(), "cali".to_string()]
    )]
    pub link_prefixes: Vec<String>,

    /// Compiled traffic probe object
    #[arg(
        long,
        env = "VETHTRACE_PROBE_OBJECT",
        default_value = "/usr/lib/vethtrace/traffic_probe.o"
    )]
    pub probe_object: PathBuf,

    /// TC classifier program inside the probe object
    #[arg(long, env = "VETHTRACE_PROBE_PROGRAM", default_value = "traffic_probe")]
    pub probe_program: String,

    /// Pod label holding the service name
    #[arg(
        long,
        env = "VETHTRACE_SERVICE_LABEL",
        default_value = "app.kubernetes.io/name"
    )]
    pub service_label: String,

    /// Node whose pods are tracked (defaults to the hostname)
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    #[arg(long, env = "VETHTRACE_PROC_ROOT", default_value = "/proc")]
    pub proc_root: PathBuf,

    /// Only ship metrics whose name starts with one of these prefixes
    #[arg(long = "metric-prefix", env = "VETHTRACE_METRIC_PREFIXES", value_delimiter = ',')]
    pub metric_prefixes: Vec<String>,

    /// Seconds between pipeline statistics log lines
    #[arg(long, env = "VETHTRACE_STATS_INTERVAL_SECS", default_value_t = 60)]
    pub stats_interval_secs: u64,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        let sizes = [
            ("record-capacity", self.record_capacity),
            ("metric-capacity", self.metric_capacity),
            ("subscriber-capacity", self.subscriber_capacity),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(AgentError::Config(format!("--{} must be positive", name)));
        }

        let intervals = [
            ("refresh-interval-secs", self.refresh_interval_secs),
            ("stats-interval-secs", self.stats_interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(AgentError::Config(format!("--{} must be positive", name)));
        }

        if self.link_prefixes.iter().all(|p| p.is_empty()) {
            return Err(AgentError::Config(
                "at least one non-empty --link-prefix is required".to_string(),
            ));
        }

        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
