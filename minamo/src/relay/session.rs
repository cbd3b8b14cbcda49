//! Per-session state for the UDP relay.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::packet::{QueuedPacket, ServerUnpacker};

/// The client address information the downlink worker needs to address
/// replies: the most recently observed source address and the pktinfo
/// control-message bytes of the interface the request arrived on.
#[derive(Debug, PartialEq, Eq)]
pub struct ClientAddrInfo {
    pub addr: SocketAddr,
    pub pktinfo: Bytes,
}

/// State shared between the ingress loop, the session workers, and the
/// shutdown coordinator.
pub struct SessionShared {
    /// Init/shutdown interlock. Three observable values: `None`
    /// (uninitialized), the upstream socket (live), or the listener socket
    /// standing in as the shutdown sentinel. The initializer and the
    /// shutdown coordinator both swap; whoever sees the other's value in
    /// the prior state backs off and releases its resources.
    pub state: ArcSwapOption<UdpSocket>,
    /// Published by ingress with release ordering, read by the downlink
    /// worker with acquire ordering.
    pub client_addr_info: ArcSwapOption<ClientAddrInfo>,
    /// Unblocks the downlink worker at shutdown.
    pub cancel: CancellationToken,
    /// Idle-eviction deadline; refreshed by the uplink worker after every
    /// upstream write.
    pub deadline: Mutex<Instant>,
}

impl SessionShared {
    pub fn new(nat_timeout: Duration) -> SessionShared {
        SessionShared {
            state: ArcSwapOption::const_empty(),
            client_addr_info: ArcSwapOption::const_empty(),
            cancel: CancellationToken::new(),
            deadline: Mutex::new(Instant::now() + nat_timeout),
        }
    }

    pub fn refresh_deadline(&self, nat_timeout: Duration) {
        *self.deadline.lock() = Instant::now() + nat_timeout;
    }
}

/// A session as the table sees it. The cache fields belong to the ingress
/// loop alone and are only touched under the table lock; everything the
/// uplink and downlink workers own moves into their tasks instead.
pub struct SessionEntry {
    pub shared: Arc<SessionShared>,
    pub sender: mpsc::Sender<QueuedPacket>,
    pub unpacker: Box<dyn ServerUnpacker>,
    pub username: String,
    pub client_addr_cache: Option<SocketAddr>,
    pub client_pktinfo_cache: Bytes,
}

impl SessionEntry {
    /// Compares the observed client address and pktinfo bytes against the
    /// ingress-owned caches; on any change, updates the caches and publishes
    /// a fresh [`ClientAddrInfo`] for the downlink worker. Returns the
    /// published record when one was produced.
    pub fn refresh_client_info(
        &mut self,
        client_addr: SocketAddr,
        pktinfo: &Bytes,
    ) -> Option<Arc<ClientAddrInfo>> {
        let update_addr = self.client_addr_cache != Some(client_addr);
        let update_pktinfo = &self.client_pktinfo_cache != pktinfo;
        if !update_addr && !update_pktinfo {
            return None;
        }

        if update_addr {
            self.client_addr_cache = Some(client_addr);
        }
        if update_pktinfo {
            self.client_pktinfo_cache = pktinfo.clone();
        }

        let info = Arc::new(ClientAddrInfo {
            addr: client_addr,
            pktinfo: self.client_pktinfo_cache.clone(),
        });
        self.shared.client_addr_info.store(Some(info.clone()));
        Some(info)
    }
}

/// Concurrent mapping from client session ID to per-session state. Guarded
/// by one mutex, shared with the server codec that extracts session IDs.
pub type SessionTable = HashMap<u64, SessionEntry>;
