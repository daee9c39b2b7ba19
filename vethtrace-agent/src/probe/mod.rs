//! Traffic probe feeds
//!
//! A feed attaches a kernel probe to one interface and hands out the raw
//! record buffers it produces.

#[cfg(target_os = "linux")]
pub mod loader;

use crate::error::ProbeError;
use crate::links::LinkEndpoint;
use async_trait::async_trait;

/// Attaches traffic probes to links
#[async_trait]
pub trait ProbeFeed: Send + Sync {
    async fn attach(&self, link: &LinkEndpoint) -> Result<Box<dyn ProbeSession>, ProbeError>;
}

/// Raw buffers produced by one attached probe
#[async_trait]
pub trait ProbeSession: Send {
    /// Wait for the next buffer; `None` once the feed is closed.
    ///
    /// Must be cancel-safe: dropping the future loses no buffer.
    async fn next_buffer(&mut self) -> Result<Option<Vec<u8>>, ProbeError>;
}
