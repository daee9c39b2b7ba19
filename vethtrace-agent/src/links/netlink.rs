//! Route netlink link source
//!
//! Links are classified by the kind the kernel reports in `IFLA_LINKINFO`.
//! Neighbor tables are dumped per address family and filtered by interface
//! index here, the same way for IPv4 entries and bridge forwarding entries.

use super::{LinkEndpoint, LinkKind, LinkSource, MacAddr, NeighborEntry};
use crate::error::LinkError;
use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage};
use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use rtnetlink::Handle;

/// [`LinkSource`] backed by an rtnetlink socket
pub struct NetlinkLinkSource {
    handle: Handle,
}

impl NetlinkLinkSource {
    /// Open the socket and spawn its connection task on the current runtime.
    pub fn connect() -> Result<Self, LinkError> {
        let (connection, handle, _) = rtnetlink::new_connection().map_err(LinkError::Connect)?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    async fn dump(&self, request: RouteNetlinkMessage) -> Result<Vec<RouteNetlinkMessage>, String> {
        let mut message = NetlinkMessage::from(request);
        message.header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut handle = self.handle.clone();
        let mut responses = Box::pin(handle.request(message).map_err(|e| e.to_string())?);

        let mut replies = Vec::new();
        while let Some(response) = responses.next().await {
            match response.payload {
                NetlinkPayload::InnerMessage(inner) => replies.push(inner),
                NetlinkPayload::Error(err) => return Err(format!("{:?}", err)),
                _ => {}
            }
        }
        Ok(replies)
    }

    async fn neighbors(
        &self,
        link: &LinkEndpoint,
        family: AddressFamily,
    ) -> Result<Vec<NeighborEntry>, LinkError> {
        let mut request = NeighbourMessage::default();
        request.header.family = family;

        let replies = self
            .dump(RouteNetlinkMessage::GetNeighbour(request))
            .await
            .map_err(|reason| LinkError::Neighbors {
                name: link.name.clone(),
                reason,
            })?;

        Ok(replies
            .into_iter()
            .filter_map(|reply| match reply {
                RouteNetlinkMessage::NewNeighbour(n) if n.header.ifindex == link.index => {
                    neighbor_entry(&n)
                }
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl LinkSource for NetlinkLinkSource {
    async fn links(&self) -> Result<Vec<LinkEndpoint>, LinkError> {
        let replies = self
            .dump(RouteNetlinkMessage::GetLink(LinkMessage::default()))
            .await
            .map_err(LinkError::ListLinks)?;

        let links: Vec<_> = replies
            .into_iter()
            .filter_map(|reply| match reply {
                RouteNetlinkMessage::NewLink(link) => link_endpoint(&link),
                _ => None,
            })
            .collect();

        debug!("Listed {} links", links.len());
        Ok(links)
    }

    async fn ipv4_neighbors(&self, link: &LinkEndpoint) -> Result<Vec<NeighborEntry>, LinkError> {
        self.neighbors(link, AddressFamily::Inet).await
    }

    async fn bridge_neighbors(
        &self,
        link: &LinkEndpoint,
    ) -> Result<Vec<NeighborEntry>, LinkError> {
        self.neighbors(link, AddressFamily::Bridge).await
    }
}

/// Endpoint for a link message; links without a name are skipped.
pub(crate) fn link_endpoint(message: &LinkMessage) -> Option<LinkEndpoint> {
    let mut name = None;
    let mut kind = LinkKind::Other;

    for attr in &message.attributes {
        match attr {
            LinkAttribute::IfName(ifname) => name = Some(ifname.clone()),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    if let LinkInfo::Kind(info_kind) = info {
                        kind = match info_kind {
                            InfoKind::Veth => LinkKind::Veth,
                            InfoKind::Bridge => LinkKind::Bridge,
                            _ => LinkKind::Other,
                        };
                    }
                }
            }
            _ => {}
        }
    }

    name.map(|name| LinkEndpoint::new(message.header.index, name, kind))
}

/// Neighbor entry for a neighbour message. Entries without a 48-bit
/// link-layer address (incomplete or failed resolution) are skipped.
pub(crate) fn neighbor_entry(message: &NeighbourMessage) -> Option<NeighborEntry> {
    let mut hardware_address = None;
    let mut ip_address = None;

    for attr in &message.attributes {
        match attr {
            NeighbourAttribute::LinkLocalAddress(lladdr) => {
                hardware_address = <[u8; 6]>::try_from(lladdr.as_slice()).ok().map(MacAddr);
            }
            NeighbourAttribute::Destination(NeighbourAddress::Inet(ip)) => {
                ip_address = Some(*ip);
            }
            _ => {}
        }
    }

    hardware_address.map(|hardware_address| NeighborEntry {
        hardware_address,
        ip_address,
    })
}
