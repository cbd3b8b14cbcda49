mod packet;
mod plain;
mod session;
mod tcp;
mod udp;

pub use packet::{
    max_packet_size_for_addr, relay_headroom, ClientPacker, ClientUnpacker, Headroom, PacketPool,
    QueuedPacket, ServerInfo, ServerPacker, ServerUnpacker, UdpSessionServer, IPV4_HEADER_LEN,
    IPV6_HEADER_LEN, UDP_HEADER_LEN,
};
pub use plain::{DirectClient, PlainSessionServer, PlainTunnelClient, SESSION_ID_LEN};
pub use session::{ClientAddrInfo, SessionEntry, SessionShared, SessionTable};
pub use tcp::Socks5TcpService;
pub use udp::{RecvMode, UdpRelaySettings, UdpSessionRelay};
