//! Built-in cipherless session framing.
//!
//! Datagrams carry `session_id(8, big-endian) | SOCKS address | payload` in
//! both directions: the address is the target on the way in and the payload
//! source on the way out. The session ID groups packets into a logical flow
//! exactly like an encrypted codec would, without the cipher.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::{bail, Context, Result};
use minamo_proto::socks5::{Address, MAX_ADDR_LEN};
use rand::RngCore;

use super::packet::{
    max_packet_size_for_addr, ClientPacker, ClientUnpacker, Headroom, ServerInfo, ServerPacker,
    ServerUnpacker, UdpSessionServer, IPV4_HEADER_LEN, UDP_HEADER_LEN,
};
use crate::router::{ClientInfo, UdpClient};

pub const SESSION_ID_LEN: usize = 8;

/// Headroom a plain framing layer may prepend: the session ID plus a
/// worst-case SOCKS address.
const PLAIN_HEADROOM: Headroom = Headroom {
    front: SESSION_ID_LEN + MAX_ADDR_LEN,
    rear: 0,
};

fn read_session_id(packet: &[u8]) -> Result<u64> {
    if packet.len() < SESSION_ID_LEN {
        bail!("packet too short for a session ID: {} bytes", packet.len());
    }
    let mut id = [0u8; SESSION_ID_LEN];
    id.copy_from_slice(&packet[..SESSION_ID_LEN]);
    Ok(u64::from_be_bytes(id))
}

fn new_session_id() -> u64 {
    let mut id = [0u8; SESSION_ID_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    u64::from_be_bytes(id)
}

/// Writes `session_id | address` immediately before `payload_start` and
/// returns the start of the written header.
fn prepend_header(
    buf: &mut [u8],
    session_id: u64,
    addr: &Address,
    payload_start: usize,
) -> Result<usize> {
    let header_len = SESSION_ID_LEN + addr.serialized_len();
    if payload_start < header_len {
        bail!(
            "insufficient front headroom: need {header_len} bytes, have {payload_start}"
        );
    }
    let start = payload_start - header_len;
    buf[start..start + SESSION_ID_LEN].copy_from_slice(&session_id.to_be_bytes());
    addr.write_to_buf(&mut &mut buf[start + SESSION_ID_LEN..payload_start]);
    Ok(start)
}

/// Parses `session_id | address` at `start`, returning the session ID, the
/// address, and the offset of the byte after the header.
fn strip_header(buf: &[u8], start: usize, len: usize) -> Result<(u64, Address, usize)> {
    let packet = &buf[start..start + len];
    let session_id = read_session_id(packet)?;
    let (addr, consumed) = Address::from_slice(&packet[SESSION_ID_LEN..])
        .context("malformed address in packet header")?;
    Ok((session_id, addr, start + SESSION_ID_LEN + consumed))
}

/// Server-side context for the plain framing.
#[derive(Debug, Default)]
pub struct PlainSessionServer;

impl PlainSessionServer {
    pub fn new() -> PlainSessionServer {
        PlainSessionServer
    }
}

impl UdpSessionServer for PlainSessionServer {
    fn session_info(&self, packet: &[u8]) -> Result<u64> {
        read_session_id(packet)
    }

    fn new_unpacker(
        &self,
        _packet: &[u8],
        session_id: u64,
    ) -> Result<(Box<dyn ServerUnpacker>, String)> {
        // The plain framing carries no identity.
        Ok((Box::new(PlainServerUnpacker { session_id }), String::new()))
    }

    fn info(&self) -> ServerInfo {
        ServerInfo {
            unpacker_headroom: Headroom::default(),
        }
    }
}

struct PlainServerUnpacker {
    session_id: u64,
}

impl ServerUnpacker for PlainServerUnpacker {
    fn unpack_in_place(
        &mut self,
        buf: &mut [u8],
        _client_addr: SocketAddr,
        front_headroom: usize,
        recv_len: usize,
    ) -> Result<(Address, usize, usize)> {
        let (session_id, target, payload_start) = strip_header(buf, front_headroom, recv_len)?;
        if session_id != self.session_id {
            bail!(
                "session ID mismatch: packet {session_id:#018x}, session {:#018x}",
                self.session_id
            );
        }
        let payload_len = front_headroom + recv_len - payload_start;
        Ok((target, payload_start, payload_len))
    }

    fn new_packer(&self) -> Result<Box<dyn ServerPacker>> {
        Ok(Box::new(PlainServerPacker {
            session_id: self.session_id,
        }))
    }
}

struct PlainServerPacker {
    session_id: u64,
}

impl ServerPacker for PlainServerPacker {
    fn pack_in_place(
        &mut self,
        buf: &mut [u8],
        source: &Address,
        payload_start: usize,
        payload_len: usize,
        max_packet_len: usize,
    ) -> Result<(usize, usize)> {
        let start = prepend_header(buf, self.session_id, source, payload_start)?;
        let packet_len = payload_start - start + payload_len;
        if packet_len > max_packet_len {
            bail!("packet of {packet_len} bytes exceeds the client path limit {max_packet_len}");
        }
        Ok((start, packet_len))
    }

    fn headroom(&self) -> Headroom {
        PLAIN_HEADROOM
    }
}

/// Upstream client that forwards raw payloads straight to the target.
pub struct DirectClient {
    name: String,
    mtu: usize,
    fwmark: u32,
}

impl DirectClient {
    pub fn new(name: String, mtu: usize, fwmark: u32) -> DirectClient {
        DirectClient { name, mtu, fwmark }
    }
}

impl UdpClient for DirectClient {
    fn new_session(&self) -> Result<(ClientInfo, Box<dyn ClientPacker>, Box<dyn ClientUnpacker>)> {
        let info = ClientInfo {
            name: self.name.clone(),
            max_packet_size: self.mtu - IPV4_HEADER_LEN - UDP_HEADER_LEN,
            fwmark: self.fwmark,
        };
        Ok((
            info,
            Box::new(DirectPacker {
                resolved: HashMap::new(),
            }),
            Box::new(DirectUnpacker),
        ))
    }
}

struct DirectPacker {
    // Per-session resolution cache keeps repeat lookups off the packet path.
    resolved: HashMap<(String, u16), SocketAddr>,
}

impl ClientPacker for DirectPacker {
    fn pack_in_place(
        &mut self,
        _buf: &mut [u8],
        target: &Address,
        payload_start: usize,
        payload_len: usize,
    ) -> Result<(SocketAddr, usize, usize)> {
        let dest = match target {
            Address::Ip(sa) => *sa,
            Address::Domain(host, port) => {
                let key = (host.clone(), *port);
                match self.resolved.get(&key) {
                    Some(sa) => *sa,
                    None => {
                        let sa = (host.as_str(), *port)
                            .to_socket_addrs()
                            .with_context(|| format!("resolving {host}:{port}"))?
                            .next()
                            .with_context(|| format!("no addresses for {host}:{port}"))?;
                        self.resolved.insert(key, sa);
                        sa
                    }
                }
            }
        };
        Ok((dest, payload_start, payload_len))
    }
}

struct DirectUnpacker;

impl ClientUnpacker for DirectUnpacker {
    fn unpack_in_place(
        &mut self,
        _buf: &mut [u8],
        source: SocketAddr,
        front_headroom: usize,
        recv_len: usize,
    ) -> Result<(Address, usize, usize)> {
        Ok((Address::Ip(source), front_headroom, recv_len))
    }

    fn headroom(&self) -> Headroom {
        Headroom::default()
    }
}

/// Upstream client that re-frames payloads with the plain session framing
/// and forwards them to a fixed next-hop relay.
pub struct PlainTunnelClient {
    name: String,
    server_addr: SocketAddr,
    mtu: usize,
    fwmark: u32,
}

impl PlainTunnelClient {
    pub fn new(name: String, server_addr: SocketAddr, mtu: usize, fwmark: u32) -> PlainTunnelClient {
        PlainTunnelClient {
            name,
            server_addr,
            mtu,
            fwmark,
        }
    }
}

impl UdpClient for PlainTunnelClient {
    fn new_session(&self) -> Result<(ClientInfo, Box<dyn ClientPacker>, Box<dyn ClientUnpacker>)> {
        let session_id = new_session_id();
        let info = ClientInfo {
            name: self.name.clone(),
            max_packet_size: max_packet_size_for_addr(self.mtu, self.server_addr.ip()),
            fwmark: self.fwmark,
        };
        Ok((
            info,
            Box::new(PlainTunnelPacker {
                session_id,
                server_addr: self.server_addr,
            }),
            Box::new(PlainTunnelUnpacker { session_id }),
        ))
    }
}

struct PlainTunnelPacker {
    session_id: u64,
    server_addr: SocketAddr,
}

impl ClientPacker for PlainTunnelPacker {
    fn pack_in_place(
        &mut self,
        buf: &mut [u8],
        target: &Address,
        payload_start: usize,
        payload_len: usize,
    ) -> Result<(SocketAddr, usize, usize)> {
        let start = prepend_header(buf, self.session_id, target, payload_start)?;
        Ok((self.server_addr, start, payload_start - start + payload_len))
    }
}

struct PlainTunnelUnpacker {
    session_id: u64,
}

impl ClientUnpacker for PlainTunnelUnpacker {
    fn unpack_in_place(
        &mut self,
        buf: &mut [u8],
        _source: SocketAddr,
        front_headroom: usize,
        recv_len: usize,
    ) -> Result<(Address, usize, usize)> {
        let (session_id, source, payload_start) = strip_header(buf, front_headroom, recv_len)?;
        if session_id != self.session_id {
            bail!(
                "session ID mismatch: packet {session_id:#018x}, session {:#018x}",
                self.session_id
            );
        }
        let payload_len = front_headroom + recv_len - payload_start;
        Ok((source, payload_start, payload_len))
    }

    fn headroom(&self) -> Headroom {
        Headroom::default()
    }
}
