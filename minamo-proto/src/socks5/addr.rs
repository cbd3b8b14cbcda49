//! SOCKS address codec.
//!
//! A SOCKS address is the `ATYP | ADDR | PORT` triple used in SOCKS5
//! request, reply, and UDP-relay headers. The wire layout is
//! `ATYP(1) | ADDR(variable) | PORT(2, big-endian)` where domain-form
//! ADDR is `LEN(1) | BYTES(LEN)`.

use std::fmt::{self, Debug, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use bytes::BufMut;
#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, AsyncReadExt};

use super::consts;
use super::Error;

/// Worst-case serialized length of a SOCKS address: the domain form with a
/// 255-byte host. Used to size scratch buffers.
pub const MAX_ADDR_LEN: usize = 1 + 1 + 255 + 2;

/// Host-level address value used by the relay and router.
///
/// Constructed from any wire-form SOCKS address and converted back. The
/// unspecified IPv4 `0.0.0.0:0` is the canonical placeholder for replies
/// where no bound address applies.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address, IPv4 or IPv6
    Ip(SocketAddr),
    /// Domain name plus port
    Domain(String, u16),
}

impl Address {
    /// The canonical `0.0.0.0:0` placeholder.
    pub fn unspecified() -> Address {
        Address::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(sa) => sa.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Ip(_) => None,
            Address::Domain(host, _) => Some(host),
        }
    }

    /// Parses a completed SOCKS address from the front of `b`, returning the
    /// value and the number of bytes consumed.
    ///
    /// Rejects unknown ATYP values, zero-length domains, and buffers too
    /// small for the declared fields; no partial value is ever produced.
    pub fn from_slice(b: &[u8]) -> Result<(Address, usize), Error> {
        let atyp = *b.first().ok_or(Error::ShortRead)?;
        match atyp {
            consts::ATYP_IPV4 => {
                if b.len() < 1 + 4 + 2 {
                    return Err(Error::ShortRead);
                }
                let ip = Ipv4Addr::new(b[1], b[2], b[3], b[4]);
                let port = u16::from_be_bytes([b[5], b[6]]);
                Ok((Address::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port))), 7))
            }
            consts::ATYP_IPV6 => {
                if b.len() < 1 + 16 + 2 {
                    return Err(Error::ShortRead);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&b[1..17]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([b[17], b[18]]);
                Ok((
                    Address::Ip(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0))),
                    19,
                ))
            }
            consts::ATYP_DOMAIN => {
                let len = *b.get(1).ok_or(Error::ShortRead)? as usize;
                if len == 0 {
                    return Err(Error::InvalidDomainLength);
                }
                if b.len() < 2 + len + 2 {
                    return Err(Error::ShortRead);
                }
                let host = std::str::from_utf8(&b[2..2 + len])
                    .map_err(|_| Error::InvalidDomainEncoding)?;
                let port = u16::from_be_bytes([b[2 + len], b[2 + len + 1]]);
                Ok((Address::Domain(host.to_owned(), port), 2 + len + 2))
            }
            _ => Err(Error::UnsupportedAddressType(atyp)),
        }
    }

    /// Serializes the address into `buf` in wire form.
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match self {
            Address::Ip(SocketAddr::V4(sa)) => {
                buf.put_u8(consts::ATYP_IPV4);
                buf.put_slice(&sa.ip().octets());
                buf.put_u16(sa.port());
            }
            Address::Ip(SocketAddr::V6(sa)) => {
                buf.put_u8(consts::ATYP_IPV6);
                buf.put_slice(&sa.ip().octets());
                buf.put_u16(sa.port());
            }
            Address::Domain(host, port) => {
                assert!(host.len() <= 255);
                buf.put_u8(consts::ATYP_DOMAIN);
                buf.put_u8(host.len() as u8);
                buf.put_slice(host.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    /// Serialized length in wire form.
    #[inline]
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Ip(SocketAddr::V4(..)) => 1 + 4 + 2,
            Address::Ip(SocketAddr::V6(..)) => 1 + 16 + 2,
            Address::Domain(host, _) => 1 + 1 + host.len() + 2,
        }
    }

    /// Resolves the address to a socket address, looking domains up through
    /// the system resolver.
    #[cfg(feature = "tokio")]
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        match self {
            Address::Ip(sa) => Ok(*sa),
            Address::Domain(host, port) => {
                tokio::net::lookup_host((host.as_str(), *port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("no addresses for {host}"),
                        )
                    })
            }
        }
    }
}

/// Completes a SOCKS address whose first two bytes have already been pulled
/// off the transport and handed back through `r` (normally a
/// [`PrefixedReader`](super::PrefixedReader)). Reads the minimum number of
/// bytes and appends the whole wire form, prefix included, to `buf`.
#[cfg(feature = "tokio")]
pub async fn append_from_reader<R>(buf: &mut Vec<u8>, r: &mut R) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let start = buf.len();
    buf.resize(start + 2, 0);
    r.read_exact(&mut buf[start..start + 2]).await?;

    let atyp = buf[start];
    let remaining = match atyp {
        consts::ATYP_IPV4 => 4 + 2 - 1,
        consts::ATYP_IPV6 => 16 + 2 - 1,
        consts::ATYP_DOMAIN => {
            let len = buf[start + 1] as usize;
            if len == 0 {
                return Err(Error::InvalidDomainLength);
            }
            len + 2
        }
        _ => return Err(Error::UnsupportedAddressType(atyp)),
    };

    let mid = buf.len();
    buf.resize(mid + remaining, 0);
    r.read_exact(&mut buf[mid..]).await?;
    Ok(())
}

impl Debug for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Address::Ip(sa) => write!(f, "{sa}"),
            Address::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl fmt::Display for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Address::Ip(sa) => write!(f, "{sa}"),
            Address::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(sa: SocketAddr) -> Address {
        Address::Ip(sa)
    }
}

impl From<(String, u16)> for Address {
    fn from((host, port): (String, u16)) -> Address {
        Address::Domain(host, port)
    }
}

impl From<(IpAddr, u16)> for Address {
    fn from((ip, port): (IpAddr, u16)) -> Address {
        Address::Ip(SocketAddr::new(ip, port))
    }
}

/// Parse `Address` error.
#[derive(Debug)]
pub struct AddressError;

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Address, AddressError> {
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(sa));
        }
        let (host, port) = s.rsplit_once(':').ok_or(AddressError)?;
        if host.is_empty() || host.len() > 255 {
            return Err(AddressError);
        }
        let port = port.parse::<u16>().map_err(|_| AddressError)?;
        Ok(Address::Domain(host.to_owned(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addr: Address) {
        let mut buf = Vec::new();
        addr.write_to_buf(&mut buf);
        assert_eq!(buf.len(), addr.serialized_len());
        let (parsed, consumed) = Address::from_slice(&buf).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_roundtrip_ipv4() {
        roundtrip(Address::Ip("127.0.0.1:8080".parse().unwrap()));
        roundtrip(Address::unspecified());
    }

    #[test]
    fn test_roundtrip_ipv6() {
        roundtrip(Address::Ip("[2001:db8::1]:443".parse().unwrap()));
    }

    #[test]
    fn test_roundtrip_domain() {
        roundtrip(Address::Domain("example.com".to_owned(), 443));
        roundtrip(Address::Domain("x".repeat(255), 65535));
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = Vec::new();
        Address::Domain("example.com".to_owned(), 443).write_to_buf(&mut buf);
        assert_eq!(
            buf,
            [
                0x03, 0x0b, 0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x2e, 0x63, 0x6f, 0x6d,
                0x01, 0xbb
            ]
        );

        buf.clear();
        Address::Ip("10.0.0.1:51820".parse().unwrap()).write_to_buf(&mut buf);
        assert_eq!(buf, [0x01, 0x0a, 0x00, 0x00, 0x01, 0xca, 0x7c]);
    }

    #[test]
    fn test_rejects_unknown_atyp() {
        assert!(matches!(
            Address::from_slice(&[0x02, 0, 0, 0, 0, 0, 0]),
            Err(Error::UnsupportedAddressType(0x02))
        ));
    }

    #[test]
    fn test_rejects_zero_domain_len() {
        assert!(matches!(
            Address::from_slice(&[0x03, 0x00, 0x01, 0xbb]),
            Err(Error::InvalidDomainLength)
        ));
    }

    #[test]
    fn test_rejects_truncated() {
        let mut buf = Vec::new();
        Address::Domain("example.com".to_owned(), 443).write_to_buf(&mut buf);
        for n in 0..buf.len() {
            assert!(
                matches!(Address::from_slice(&buf[..n]), Err(Error::ShortRead)),
                "prefix of {n} bytes must be a short read"
            );
        }

        assert!(matches!(
            Address::from_slice(&[0x01, 10, 0, 0]),
            Err(Error::ShortRead)
        ));
    }

    #[tokio::test]
    async fn test_append_from_reader_minimum_bytes() {
        let mut wire = Vec::new();
        Address::Domain("example.com".to_owned(), 443).write_to_buf(&mut wire);
        // Trailing garbage must be left unread.
        wire.extend_from_slice(&[0xde, 0xad]);

        let mut r = std::io::Cursor::new(wire.clone());
        let mut buf = Vec::new();
        append_from_reader(&mut buf, &mut r).await.unwrap();
        assert_eq!(buf, wire[..wire.len() - 2]);
        assert_eq!(r.position() as usize, wire.len() - 2);

        let (addr, _) = Address::from_slice(&buf).unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_owned(), 443));
    }

    #[tokio::test]
    async fn test_append_from_reader_short_read() {
        let mut wire = Vec::new();
        Address::Ip("[2001:db8::1]:443".parse().unwrap()).write_to_buf(&mut wire);
        wire.truncate(9);

        let mut r = std::io::Cursor::new(wire);
        let mut buf = Vec::new();
        assert!(matches!(
            append_from_reader(&mut buf, &mut r).await,
            Err(Error::ShortRead)
        ));
    }

    #[test]
    fn test_from_str() {
        assert_eq!(
            "127.0.0.1:80".parse::<Address>().unwrap(),
            Address::Ip("127.0.0.1:80".parse().unwrap())
        );
        assert_eq!(
            "example.com:443".parse::<Address>().unwrap(),
            Address::Domain("example.com".to_owned(), 443)
        );
        assert!("example.com".parse::<Address>().is_err());
        assert!("example.com:notaport".parse::<Address>().is_err());
    }
}
