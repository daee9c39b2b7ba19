//! Node agent for vethtrace (DaemonSet)
//!
//! Responsibilities:
//! - Track container veth links and their neighbors
//! - Attach a traffic probe to every eligible link
//! - Decode probe records and decompress their headers
//! - Map process ids to pods through cgroups and the Kubernetes API
//! - Ship enriched traffic metrics

pub mod config;
pub mod error;
pub mod identity;
pub mod links;
pub mod metric;
pub mod pipeline;
pub mod probe;
pub mod record;
