//! Zero-copy packet framing contracts.
//!
//! Packers and unpackers rewrite a packet buffer in place and report slice
//! windows, so payloads move through the relay without copying. Buffers
//! reserve front and rear headroom so framing layers can prepend and append
//! without shifting the payload.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use minamo_proto::socks5::Address;
use parking_lot::Mutex;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const UDP_HEADER_LEN: usize = 8;

/// Reserved space around a packet payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Headroom {
    /// Bytes reserved in front of the payload.
    pub front: usize,
    /// Bytes reserved behind the payload.
    pub rear: usize,
}

/// Extra buffer headroom a relay direction needs: what the packer wants to
/// add, minus what stripping the unpacked header already frees up.
pub fn relay_headroom(packer: Headroom, unpacker: Headroom) -> Headroom {
    Headroom {
        front: packer.front.saturating_sub(unpacker.front),
        rear: packer.rear.saturating_sub(unpacker.rear),
    }
}

/// Largest UDP payload that fits in one IP packet toward `ip` at the given
/// MTU.
pub fn max_packet_size_for_addr(mtu: usize, ip: IpAddr) -> usize {
    let ip_header = if ip.is_ipv4() {
        IPV4_HEADER_LEN
    } else {
        IPV6_HEADER_LEN
    };
    mtu - ip_header - UDP_HEADER_LEN
}

/// Static properties of a session server codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct ServerInfo {
    pub unpacker_headroom: Headroom,
}

/// Server-side cipher context: extracts session identity from raw datagrams
/// and builds per-session unpackers.
///
/// The relay calls these while holding the session-table lock.
pub trait UdpSessionServer: Send + Sync {
    /// Extracts the 64-bit client session ID from a raw datagram.
    fn session_info(&self, packet: &[u8]) -> Result<u64>;

    /// Builds the per-session unpacker, returning the attributed username
    /// (empty when the codec carries no identity).
    fn new_unpacker(&self, packet: &[u8], session_id: u64)
        -> Result<(Box<dyn ServerUnpacker>, String)>;

    fn info(&self) -> ServerInfo;
}

/// Decodes client datagrams in place.
pub trait ServerUnpacker: Send {
    /// Rewrites `buf` in place, returning the target address and the
    /// `(start, len)` window of the decoded payload.
    fn unpack_in_place(
        &mut self,
        buf: &mut [u8],
        client_addr: SocketAddr,
        front_headroom: usize,
        recv_len: usize,
    ) -> Result<(Address, usize, usize)>;

    /// Builds the paired packer for the reply direction.
    fn new_packer(&self) -> Result<Box<dyn ServerPacker>>;
}

/// Encodes reply datagrams toward the client in place.
pub trait ServerPacker: Send {
    /// Frames `buf[payload_start..payload_start + payload_len]` toward the
    /// client, capped at `max_packet_len`, returning the packet window.
    fn pack_in_place(
        &mut self,
        buf: &mut [u8],
        source: &Address,
        payload_start: usize,
        payload_len: usize,
        max_packet_len: usize,
    ) -> Result<(usize, usize)>;

    fn headroom(&self) -> Headroom;
}

/// Encodes datagrams toward the upstream network in place.
pub trait ClientPacker: Send {
    /// Frames the payload for `target`, returning the upstream destination
    /// and the packet window. May use the buffer's reserved headroom.
    fn pack_in_place(
        &mut self,
        buf: &mut [u8],
        target: &Address,
        payload_start: usize,
        payload_len: usize,
    ) -> Result<(SocketAddr, usize, usize)>;
}

/// Decodes datagrams received from the upstream network in place.
pub trait ClientUnpacker: Send {
    /// Rewrites `buf` in place, returning the payload source address and
    /// the payload window.
    fn unpack_in_place(
        &mut self,
        buf: &mut [u8],
        source: SocketAddr,
        front_headroom: usize,
        recv_len: usize,
    ) -> Result<(Address, usize, usize)>;

    fn headroom(&self) -> Headroom;
}

/// A pooled packet buffer with its payload window and routing metadata.
#[derive(Debug)]
pub struct QueuedPacket {
    pub buf: Vec<u8>,
    pub start: usize,
    pub len: usize,
    pub target: Address,
    pub client_addr: SocketAddr,
}

/// Free list of fixed-capacity packet buffers.
///
/// Buffers come back on every exit path; `outstanding` counts the ones
/// currently borrowed.
#[derive(Debug)]
pub struct PacketPool {
    buf_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl PacketPool {
    pub fn new(buf_size: usize) -> PacketPool {
        PacketPool {
            buf_size,
            free: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get(&self) -> QueuedPacket {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size]);
        QueuedPacket {
            buf,
            start: 0,
            len: 0,
            target: Address::unspecified(),
            client_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }

    pub fn put(&self, packet: QueuedPacket) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(packet.buf);
    }

    /// Number of buffers currently borrowed from the pool.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}
