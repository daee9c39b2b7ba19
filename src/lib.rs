//! vethtrace - per-pod HTTP traffic telemetry for Kubernetes
//!
//! Facade over the workspace crates:
//! - [`common`]: the traffic record layout shared with the kernel probe
//! - [`agent`]: the node agent (link tracking, record decoding, pod correlation)

#[cfg(feature = "common")]
pub use vethtrace_common as common;

#[cfg(feature = "agent")]
pub use vethtrace_agent as agent;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
