//! Multi-interface UDP transport management.
//!
//! One UDP endpoint is bound per configured listening address. Outbound
//! unicast picks the endpoint whose interface is most likely routable to
//! the destination: precise subnet membership when per-address network
//! masks were configured, otherwise a private-network heuristic, with the
//! first non-wildcard endpoint as the final fallback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::ControllerConfig;
use crate::errors::Error;

type Result<T> = std::result::Result<T, Error>;

/// An IPv4 subnet parsed from a CIDR (`/24`) or dotted (`255.255.255.0`)
/// network mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Subnet {
    network: u32,
    mask: u32,
}

impl Subnet {
    pub(crate) fn parse(address: Ipv4Addr, mask: &str) -> Option<Self> {
        let mask_bits = if let Some(prefix) = mask.strip_prefix('/') {
            let prefix: u32 = prefix.parse().ok().filter(|p| *p <= 32)?;
            if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
        } else {
            let dotted: Ipv4Addr = mask.parse().ok()?;
            let bits = u32::from(dotted);
            // Dotted masks must be contiguous ones followed by zeros.
            if bits != 0 && bits.leading_ones() + bits.trailing_zeros() != 32 {
                return None;
            }
            bits
        };
        Some(Subnet {
            network: u32::from(address) & mask_bits,
            mask: mask_bits,
        })
    }

    pub(crate) fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask == self.network
    }
}

/// Selection-relevant metadata of one endpoint, separated from the socket
/// so routing decisions stay a pure function.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EndpointMeta {
    pub(crate) local: Ipv4Addr,
    pub(crate) subnet: Option<Subnet>,
}

/// Pick the endpoint index to use for `destination`.
///
/// With one endpoint there is nothing to decide. With several, precise
/// subnet matching applies when masks were configured (wildcard-bound and
/// invalid-mask endpoints are skipped), otherwise the private-network
/// heuristic. IPv6 destinations are never matched and take the fallback.
pub(crate) fn select_endpoint(
    metas: &[EndpointMeta],
    masks_configured: bool,
    destination: IpAddr,
) -> usize {
    if metas.len() <= 1 {
        return 0;
    }
    let IpAddr::V4(destination) = destination else {
        return fallback_endpoint(metas);
    };

    if masks_configured {
        for (index, meta) in metas.iter().enumerate() {
            if meta.local.is_unspecified() {
                continue;
            }
            let Some(subnet) = meta.subnet else {
                // Mask failed to parse at bind time; skipped here.
                continue;
            };
            if subnet.contains(destination) {
                return index;
            }
        }
    } else {
        for (index, meta) in metas.iter().enumerate() {
            if meta.local.is_unspecified() {
                continue;
            }
            if same_network_heuristic(meta.local, destination) {
                return index;
            }
        }
    }
    fallback_endpoint(metas)
}

fn fallback_endpoint(metas: &[EndpointMeta]) -> usize {
    metas
        .iter()
        .position(|meta| !meta.local.is_unspecified())
        .unwrap_or(0)
}

/// Approximate same-network test used when no masks are configured: same
/// /24, same 192.168.x, or both in 10.x. Documented fallback only; the
/// precise-mask path is the primary mechanism.
fn same_network_heuristic(local: Ipv4Addr, destination: Ipv4Addr) -> bool {
    let l = local.octets();
    let d = destination.octets();
    if l[..3] == d[..3] {
        return true;
    }
    if l[0] == 192 && l[1] == 168 && d[0] == 192 && d[1] == 168 {
        return true;
    }
    if l[0] == 10 && d[0] == 10 {
        return true;
    }
    false
}

struct Endpoint {
    socket: Arc<UdpSocket>,
    meta: EndpointMeta,
    multicast_group: Option<Ipv4Addr>,
}

/// Owns the bound UDP endpoints and routes outbound datagrams.
pub(crate) struct TransportManager {
    endpoints: Vec<Endpoint>,
    masks_configured: bool,
    broadcast_target: SocketAddrV4,
}

impl TransportManager {
    /// Bind one endpoint per configured listening address. Multicast
    /// groups are joined here and left again in [`Self::shutdown`].
    pub(crate) async fn bind(config: &ControllerConfig) -> Result<Self> {
        let masks_configured = config.network_masks.is_some();
        let mut endpoints = Vec::with_capacity(config.listening_addresses.len());

        for (index, &address) in config.listening_addresses.iter().enumerate() {
            let subnet = config
                .network_masks
                .as_ref()
                .and_then(|masks| masks.get(index))
                .and_then(|mask| {
                    let parsed = Subnet::parse(address, mask);
                    if parsed.is_none() {
                        warn!("Invalid network mask {mask:?} for {address}; interface skipped during subnet matching");
                    }
                    parsed
                });

            let socket = bind_socket(address, config.listening_port, config.broadcast_address)?;
            debug!("Bound endpoint on {address}:{}", config.listening_port);

            endpoints.push(Endpoint {
                socket: Arc::new(socket),
                meta: EndpointMeta {
                    local: address,
                    subnet,
                },
                multicast_group: config
                    .broadcast_address
                    .is_multicast()
                    .then_some(config.broadcast_address),
            });
        }

        Ok(TransportManager {
            endpoints,
            masks_configured,
            broadcast_target: SocketAddrV4::new(config.broadcast_address, config.broadcast_port),
        })
    }

    /// Send `payload` to the discovery target from every endpoint.
    pub(crate) async fn broadcast(&self, payload: &[u8]) {
        for endpoint in &self.endpoints {
            if let Err(err) = endpoint.socket.send_to(payload, self.broadcast_target).await {
                warn!("Broadcast from {} failed: {err}", endpoint.meta.local);
            }
        }
    }

    /// Send `payload` to a single destination from the best-matching
    /// endpoint.
    pub(crate) async fn send_to(&self, payload: &[u8], ip: IpAddr, port: u16) {
        let metas: Vec<EndpointMeta> = self.endpoints.iter().map(|e| e.meta).collect();
        let index = select_endpoint(&metas, self.masks_configured, ip);
        let Some(endpoint) = self.endpoints.get(index) else {
            return;
        };
        if let Err(err) = endpoint.socket.send_to(payload, SocketAddr::new(ip, port)).await {
            warn!("Send to {ip}:{port} failed: {err}");
        }
    }

    /// Sockets for the inbound receive loops.
    pub(crate) fn sockets(&self) -> Vec<Arc<UdpSocket>> {
        self.endpoints
            .iter()
            .map(|endpoint| Arc::clone(&endpoint.socket))
            .collect()
    }

    /// Leave joined multicast groups. Sockets close when the manager is
    /// dropped.
    pub(crate) fn shutdown(&self) {
        for endpoint in &self.endpoints {
            if let Some(group) = endpoint.multicast_group
                && let Err(err) = endpoint
                    .socket
                    .leave_multicast_v4(group, endpoint.meta.local)
            {
                debug!("Leaving multicast group {group} failed: {err}");
            }
        }
    }
}

fn bind_socket(
    address: Ipv4Addr,
    port: u16,
    broadcast_address: Ipv4Addr,
) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::socket("create", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::socket("set_reuse_address", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::socket("set_nonblocking", e))?;
    socket
        .bind(&SocketAddrV4::new(address, port).into())
        .map_err(|e| Error::socket("bind", e))?;

    if broadcast_address.is_multicast() {
        socket
            .set_multicast_ttl_v4(2)
            .map_err(|e| Error::socket("set_multicast_ttl", e))?;
        socket
            .set_multicast_if_v4(&address)
            .map_err(|e| Error::socket("set_multicast_if", e))?;
        socket
            .join_multicast_v4(&broadcast_address, &address)
            .map_err(|e| Error::socket("join_multicast", e))?;
    }

    let socket = UdpSocket::from_std(socket.into()).map_err(|e| Error::socket("register", e))?;
    socket
        .set_broadcast(true)
        .map_err(|e| Error::socket("set_broadcast", e))?;
    Ok(socket)
}
