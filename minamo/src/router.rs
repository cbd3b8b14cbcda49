//! Upstream route selection for UDP sessions.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use minamo_proto::socks5::Address;
use tracing::trace;

use crate::relay::{ClientPacker, ClientUnpacker};

/// Everything the router may key a routing decision on.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    pub server: String,
    pub username: String,
    pub source: SocketAddr,
    pub target: Address,
}

/// Properties of a routed upstream client.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub name: String,
    /// Largest packet the upstream path accepts; sizes downlink buffers.
    pub max_packet_size: usize,
    pub fwmark: u32,
}

/// An upstream UDP client: hands out per-session framing adapters.
pub trait UdpClient: Send + Sync {
    fn new_session(&self) -> Result<(ClientInfo, Box<dyn ClientPacker>, Box<dyn ClientUnpacker>)>;
}

/// Picks an upstream client per request.
pub struct Router {
    udp_client: Arc<dyn UdpClient>,
}

impl Router {
    pub fn new(udp_client: Arc<dyn UdpClient>) -> Router {
        Router { udp_client }
    }

    pub fn get_udp_client(&self, request: &RequestInfo) -> Result<Arc<dyn UdpClient>> {
        trace!(
            server = %request.server,
            username = %request.username,
            source = %request.source,
            target = %request.target,
            "routing UDP session"
        );
        Ok(self.udp_client.clone())
    }
}
