use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Binds a UDP socket at `addr`, applying the firewall mark when one is
/// configured. A mark of 0 means unset; marks are a Linux-only facility and
/// are ignored elsewhere.
pub fn listen_udp(addr: SocketAddr, fwmark: u32) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;

    #[cfg(target_os = "linux")]
    if fwmark != 0 {
        socket.set_mark(fwmark)?;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = fwmark;

    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_udp_ephemeral() {
        let socket = listen_udp("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        let local = socket.local_addr().unwrap();
        assert_ne!(local.port(), 0);

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"ping", local).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, peer.local_addr().unwrap());
    }
}
