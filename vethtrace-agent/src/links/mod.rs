//! Virtual link discovery and change tracking
//!
//! Bridges and veths are enumerated together with their IPv4 neighbor
//! entries. A veth with a single neighbor is bound to it directly; for every
//! other neighbor the owning veth is found through the bridge forwarding
//! database (bridge-family neighbor entries) by hardware address.
//!
//! Interface indices are the identity key across refresh cycles. The kernel
//! may reuse an index after a delete/create cycle, so a link replaced between
//! two refreshes is indistinguishable from one that persisted.

#[cfg(target_os = "linux")]
pub mod netlink;
pub mod tracker;

pub use tracker::{compute_diff, LinkDiff, LinkTracker};

use crate::error::LinkError;
use async_trait::async_trait;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Bridge,
    Veth,
    Other,
}

/// One observed host interface
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkEndpoint {
    pub index: u32,
    pub name: String,
    pub kind: LinkKind,
}

impl LinkEndpoint {
    pub fn new(index: u32, name: impl Into<String>, kind: LinkKind) -> Self {
        Self {
            index,
            name: name.into(),
            kind,
        }
    }
}

/// 48-bit link-layer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("hardware address too short: {}", s))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|e| format!("invalid hardware address {}: {}", s, e))?;
        }
        if parts.next().is_some() {
            return Err(format!("hardware address too long: {}", s));
        }
        Ok(MacAddr(bytes))
    }
}

/// A raw neighbor-table row as reported by a [`LinkSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub hardware_address: MacAddr,
    pub ip_address: Option<Ipv4Addr>,
}

/// A monitored link together with the neighbor it is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborBinding {
    pub link: LinkEndpoint,
    pub hardware_address: MacAddr,
    pub ip_address: Option<Ipv4Addr>,
}

impl NeighborBinding {
    pub fn new(link: LinkEndpoint, neighbor: &NeighborEntry) -> Self {
        Self {
            link,
            hardware_address: neighbor.hardware_address,
            ip_address: neighbor.ip_address,
        }
    }

    pub fn index(&self) -> u32 {
        self.link.index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkChangeKind {
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkChangeEvent {
    pub kind: LinkChangeKind,
    pub binding: NeighborBinding,
}

/// Host link enumeration capability
#[async_trait]
pub trait LinkSource: Send + Sync {
    /// List every host link
    async fn links(&self) -> Result<Vec<LinkEndpoint>, LinkError>;

    /// IPv4 neighbor-table entries on `link`
    async fn ipv4_neighbors(&self, link: &LinkEndpoint) -> Result<Vec<NeighborEntry>, LinkError>;

    /// Bridge-family (FDB) entries learned on `link` as a bridge port
    async fn bridge_neighbors(
        &self,
        link: &LinkEndpoint,
    ) -> Result<Vec<NeighborEntry>, LinkError>;
}

/// Enumerate the current set of neighbor bindings.
///
/// Any failure to list links or IPv4 neighbors aborts the enumeration. A veth
/// whose bridge-family entries cannot be read is skipped as a candidate.
pub async fn discover_links<S: LinkSource + ?Sized>(
    source: &S,
) -> Result<Vec<NeighborBinding>, LinkError> {
    let links = source.links().await?;

    // FDB entries per veth, read at most once per cycle
    let mut veth_fdb: Option<Vec<(&LinkEndpoint, Vec<NeighborEntry>)>> = None;
    let mut bindings = Vec::new();

    for link in links
        .iter()
        .filter(|l| matches!(l.kind, LinkKind::Bridge | LinkKind::Veth))
    {
        let neighbors = source.ipv4_neighbors(link).await?;

        if link.kind == LinkKind::Veth && neighbors.len() == 1 {
            bindings.push(NeighborBinding::new(link.clone(), &neighbors[0]));
            continue;
        }

        if neighbors.is_empty() {
            continue;
        }

        if veth_fdb.is_none() {
            veth_fdb = Some(bridge_ports(source, &links).await);
        }
        let fdb = veth_fdb.as_deref().unwrap_or_default();

        for neighbor in &neighbors {
            for (veth, entries) in fdb {
                if entries
                    .iter()
                    .any(|e| e.hardware_address == neighbor.hardware_address)
                {
                    bindings.push(NeighborBinding::new((*veth).clone(), neighbor));
                }
            }
        }
    }

    Ok(bindings)
}

async fn bridge_ports<'a, S: LinkSource + ?Sized>(
    source: &S,
    links: &'a [LinkEndpoint],
) -> Vec<(&'a LinkEndpoint, Vec<NeighborEntry>)> {
    let mut ports = Vec::new();
    for link in links.iter().filter(|l| l.kind == LinkKind::Veth) {
        match source.bridge_neighbors(link).await {
            Ok(entries) => ports.push((link, entries)),
            Err(e) => log::debug!("Skipping {} as bridge port candidate: {}", link.name, e),
        }
    }
    ports
}
