use thiserror::Error;

/// Failures while enumerating links or neighbor tables
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Failed to open netlink socket: {0}")]
    Connect(#[source] std::io::Error),

    #[error("Failed to list links: {0}")]
    ListLinks(String),

    #[error("Failed to list neighbors of {name}: {reason}")]
    Neighbors { name: String, reason: String },
}

/// Failures while decoding a raw probe buffer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Record is {len} bytes, expected at least {min}")]
    Truncated { len: usize, min: usize },

    #[error("Header decompression failed: {0}")]
    Header(String),
}

/// Failures of the external identity lookups
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("No pod UID for pid {pid}: {reason}")]
    Process { pid: u32, reason: String },

    #[error("Pod with UID {0} not found")]
    PodNotFound(String),

    #[error("Pod {uid} has no {field}")]
    IncompletePod { uid: String, field: &'static str },

    #[error("Kubernetes error: {0}")]
    Kubernetes(String),
}

/// Failures while attaching to or reading from a traffic probe
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to load probe object: {0}")]
    Load(String),

    #[error("Failed to attach probe to {link}: {reason}")]
    Attach { link: String, reason: String },

    #[error("Probe map error: {0}")]
    Map(String),

    #[error("Probe IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("Failed to raise RLIMIT_MEMLOCK: {0}")]
    Memlock(#[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, AgentError>;
