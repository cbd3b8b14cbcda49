//! Client and server halves of the SOCKS5 negotiation, authentication, and
//! request/reply exchange over a bytestream transport.
//!
//! Every handshake works in a single scratch buffer of `3 + MAX_ADDR_LEN`
//! bytes; smaller buffers are a programmer error.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::addr::{append_from_reader, Address, MAX_ADDR_LEN};
use super::{consts, Command, Credentials, Error, Reply};

/// Outcome of a completed server-side request exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Accepted {
    /// CONNECT accepted; relay TCP traffic to the decoded target.
    Connect(Address),
    /// UDP ASSOCIATE completed and the control connection has since closed;
    /// tear down the UDP bookkeeping for the decoded target.
    UdpAssociateDone(Address),
}

/// An [`AsyncRead`] that serves a pre-buffered prefix before delegating to
/// the underlying stream.
///
/// While any prefix bytes remain, a read returns only prefix bytes and never
/// touches the underlying stream. Lets the request parser peek at lead bytes
/// of the address body and still hand them back to the address codec.
pub struct PrefixedReader<'a, R> {
    prefix: &'a [u8],
    inner: &'a mut R,
}

impl<'a, R> PrefixedReader<'a, R> {
    pub fn new(prefix: &'a [u8], inner: &'a mut R) -> PrefixedReader<'a, R> {
        PrefixedReader { prefix, inner }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PrefixedReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix = &this.prefix[n..];
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut *this.inner).poll_read(cx, buf)
    }
}

/// Writes a reply whose REP field is `status` and whose bound address is the
/// unspecified IPv4 placeholder.
async fn write_reply_with_status<W>(w: &mut W, b: &mut [u8], status: u8) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    b[0] = consts::VERSION;
    b[1] = status;
    b[2] = 0;
    let bound = Address::unspecified();
    let n = bound.serialized_len();
    bound.write_to_buf(&mut &mut b[3..3 + n]);
    w.write_all(&b[..3 + n]).await?;
    Ok(())
}

/// Sends the version identifier / method selection message and checks the
/// server's choice against `method`.
pub async fn client_negotiate_auth_method<RW>(
    rw: &mut RW,
    b: &mut [u8],
    method: u8,
) -> Result<(), Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    assert!(b.len() >= 3, "negotiate_auth_method: buffer too small");

    b[0] = consts::VERSION;
    b[1] = 1;
    b[2] = method;
    rw.write_all(&b[..3]).await?;

    rw.read_exact(&mut b[..2]).await?;
    if b[0] != consts::VERSION {
        return Err(Error::UnsupportedVersion(b[0]));
    }
    if b[1] != method {
        return Err(Error::UnsupportedAuthMethod(b[1]));
    }
    Ok(())
}

/// Sends a pre-formatted RFC 1929 authentication message (see
/// [`UserInfo::append_auth_msg`](super::UserInfo::append_auth_msg)) and
/// checks the response.
pub async fn client_do_username_password_auth<RW>(
    rw: &mut RW,
    b: &mut [u8],
    auth_msg: &[u8],
) -> Result<(), Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    assert!(b.len() >= 2, "do_username_password_auth: buffer too small");

    rw.write_all(auth_msg).await?;

    rw.read_exact(&mut b[..2]).await?;
    if b[0] != consts::USERNAME_PASSWORD_AUTH_VERSION {
        return Err(Error::UnsupportedAuthVersion(b[0]));
    }
    if b[1] != 0 {
        return Err(Error::IncorrectCredentials);
    }
    Ok(())
}

/// Sends a request with the given command and target and returns the bound
/// address from the reply.
pub async fn client_do_request<RW>(
    rw: &mut RW,
    b: &mut [u8],
    command: Command,
    target: &Address,
) -> Result<Address, Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    assert!(b.len() >= 3 + MAX_ADDR_LEN, "do_request: buffer too small");

    b[0] = consts::VERSION;
    b[1] = command.as_u8();
    b[2] = 0;
    let n = target.serialized_len();
    target.write_to_buf(&mut &mut b[3..3 + n]);
    rw.write_all(&b[..3 + n]).await?;

    // VER, REP, RSV, ATYP, and the first byte of the address body.
    rw.read_exact(&mut b[..5]).await?;
    if b[0] != consts::VERSION {
        return Err(Error::UnsupportedVersion(b[0]));
    }
    if b[1] != consts::REPLY_SUCCEEDED {
        return Err(Error::ReplyError(Reply::from_u8(b[1])));
    }

    let prefix = [b[3], b[4]];
    let mut sa = Vec::with_capacity(MAX_ADDR_LEN);
    append_from_reader(&mut sa, &mut PrefixedReader::new(&prefix, rw)).await?;
    let (addr, _) = Address::from_slice(&sa)?;
    Ok(addr)
}

/// Completes the handshake without authentication and issues a request.
pub async fn client_request<RW>(
    rw: &mut RW,
    command: Command,
    target: &Address,
) -> Result<Address, Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    let mut b = [0u8; 3 + MAX_ADDR_LEN];
    client_negotiate_auth_method(rw, &mut b, consts::AUTH_METHOD_NONE).await?;
    client_do_request(rw, &mut b, command, target).await
}

/// Like [`client_request`], but authenticates with the given RFC 1929
/// message first.
pub async fn client_request_username_password<RW>(
    rw: &mut RW,
    auth_msg: &[u8],
    command: Command,
    target: &Address,
) -> Result<Address, Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    let mut b = [0u8; 3 + MAX_ADDR_LEN];
    client_negotiate_auth_method(rw, &mut b, consts::AUTH_METHOD_USERNAME_PASSWORD).await?;
    client_do_username_password_auth(rw, &mut b, auth_msg).await?;
    client_do_request(rw, &mut b, command, target).await
}

/// Issues a CONNECT request and returns the bound address.
pub async fn client_connect<RW>(rw: &mut RW, target: &Address) -> Result<Address, Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    client_request(rw, Command::Connect, target).await
}

/// Like [`client_connect`], with username/password authentication.
pub async fn client_connect_username_password<RW>(
    rw: &mut RW,
    auth_msg: &[u8],
    target: &Address,
) -> Result<Address, Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    client_request_username_password(rw, auth_msg, Command::Connect, target).await
}

/// Issues a UDP ASSOCIATE request and returns the server's UDP bound
/// address.
pub async fn client_udp_associate<RW>(rw: &mut RW, target: &Address) -> Result<Address, Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    client_request(rw, Command::UdpAssociate, target).await
}

/// Like [`client_udp_associate`], with username/password authentication.
pub async fn client_udp_associate_username_password<RW>(
    rw: &mut RW,
    auth_msg: &[u8],
    target: &Address,
) -> Result<Address, Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    client_request_username_password(rw, auth_msg, Command::UdpAssociate, target).await
}

/// Processes an incoming version identifier / method selection message.
///
/// On success the selection reply has been written. If no offered method
/// matches `method`, the `0xFF` rejection is written before the error
/// surfaces. A NMETHODS of zero fails without writing anything.
pub async fn server_handle_method_selection<RW>(
    rw: &mut RW,
    b: &mut [u8],
    method: u8,
) -> Result<(), Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    assert!(b.len() >= 1 + 1 + 255, "method_selection: buffer too small");

    // VER, NMETHODS, and the first METHOD.
    rw.read_exact(&mut b[..3]).await?;
    if b[0] != consts::VERSION {
        return Err(Error::UnsupportedVersion(b[0]));
    }

    let found = match b[1] as usize {
        0 => return Err(Error::ZeroNMethods),
        1 => b[2] == method,
        nmethods => {
            rw.read_exact(&mut b[3..3 + nmethods - 1]).await?;
            b[2..2 + nmethods].contains(&method)
        }
    };

    if !found {
        // b[0] is already VERSION.
        b[1] = consts::AUTH_METHOD_NOT_ACCEPTABLE;
        let _ = rw.write_all(&b[..2]).await;
        return Err(Error::NoAcceptableAuthMethod);
    }

    b[1] = method;
    rw.write_all(&b[..2]).await?;
    Ok(())
}

/// Processes an incoming RFC 1929 authentication message and returns the
/// authenticated username.
///
/// The password is read into the buffer region that held the username: the
/// credentials entry is resolved from UNAME before the PASSWD read begins,
/// and the password is compared against that entry. The STATUS response is
/// written before a credential failure surfaces, so the client sees it.
pub async fn server_handle_username_password<RW>(
    rw: &mut RW,
    b: &mut [u8],
    credentials: &Credentials,
) -> Result<String, Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    assert!(
        b.len() >= 1 + 1 + 255 + 1,
        "username_password: buffer too small"
    );

    // VER, ULEN, and 2 more bytes. For a one-byte username the fourth byte
    // is already PLEN.
    rw.read_exact(&mut b[..4]).await?;
    if b[0] != consts::USERNAME_PASSWORD_AUTH_VERSION {
        return Err(Error::UnsupportedAuthVersion(b[0]));
    }

    let ulen = b[1] as usize;
    if ulen == 0 {
        return Err(Error::ZeroUlen);
    }
    if ulen > 1 {
        rw.read_exact(&mut b[4..4 + ulen - 1]).await?;
    }

    let plen_index = 2 + ulen;
    let user = std::str::from_utf8(&b[2..plen_index])
        .ok()
        .and_then(|uname| credentials.get(uname))
        .cloned();

    let plen = b[plen_index] as usize;
    if plen == 0 {
        return Err(Error::ZeroPlen);
    }

    // PASSWD overwrites UNAME; the entry above is all that survives.
    rw.read_exact(&mut b[2..2 + plen]).await?;

    let matched = user.filter(|info| info.password.as_bytes() == &b[2..2 + plen]);

    // b[0] is already the auth version. A non-zero STATUS reports failure,
    // and is written before the failure surfaces so the client sees it.
    b[1] = if matched.is_some() { 0 } else { 1 };
    rw.write_all(&b[..2]).await?;

    match matched {
        Some(info) => Ok(info.username),
        None => Err(Error::IncorrectCredentials),
    }
}

/// Processes an incoming request after authentication has finished.
///
/// `local_addr` is the local endpoint of the TCP control connection, used as
/// the bound address in UDP ASSOCIATE replies; `None` fails the ASSOCIATE
/// path. On ASSOCIATE the connection is held open with a single blocking
/// read, and [`Accepted::UdpAssociateDone`] reports that the carrier closed.
pub async fn server_handle_request<RW>(
    rw: &mut RW,
    b: &mut [u8],
    enable_tcp: bool,
    enable_udp: bool,
    local_addr: Option<SocketAddr>,
) -> Result<Accepted, Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    assert!(b.len() >= 3 + MAX_ADDR_LEN, "handle_request: buffer too small");

    // VER, CMD, RSV, ATYP, and the first byte of the address body.
    rw.read_exact(&mut b[..5]).await?;
    if b[0] != consts::VERSION {
        return Err(Error::UnsupportedVersion(b[0]));
    }

    let cmd = b[1];
    let prefix = [b[3], b[4]];
    let mut sa = Vec::with_capacity(MAX_ADDR_LEN);
    append_from_reader(&mut sa, &mut PrefixedReader::new(&prefix, rw)).await?;
    let (target, _) = Address::from_slice(&sa)?;

    match cmd {
        consts::CMD_CONNECT if enable_tcp => {
            write_reply_with_status(rw, b, consts::REPLY_SUCCEEDED).await?;
            Ok(Accepted::Connect(target))
        }
        consts::CMD_UDP_ASSOCIATE if enable_udp => {
            let local = local_addr.ok_or(Error::RequiresTcpConnection)?;

            b[0] = consts::VERSION;
            b[1] = consts::REPLY_SUCCEEDED;
            b[2] = 0;
            let bound = Address::from(local);
            let n = bound.serialized_len();
            bound.write_to_buf(&mut &mut b[3..3 + n]);
            rw.write_all(&b[..3 + n]).await?;

            // Hold the control connection open; any read completion means
            // the association is over.
            rw.read(&mut b[..1]).await?;
            Ok(Accepted::UdpAssociateDone(target))
        }
        _ => {
            let _ = write_reply_with_status(rw, b, consts::REPLY_COMMAND_NOT_SUPPORTED).await;
            Err(Error::UnsupportedCommand(cmd))
        }
    }
}

/// Accepts one unauthenticated request: method selection with method 0,
/// then the request exchange.
pub async fn server_accept<RW>(
    rw: &mut RW,
    enable_tcp: bool,
    enable_udp: bool,
    local_addr: Option<SocketAddr>,
) -> Result<Accepted, Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    let mut b = [0u8; 3 + MAX_ADDR_LEN];
    server_handle_method_selection(rw, &mut b, consts::AUTH_METHOD_NONE).await?;
    server_handle_request(rw, &mut b, enable_tcp, enable_udp, local_addr).await
}

/// Like [`server_accept`], but requires username/password authentication
/// and returns the authenticated username alongside the outcome.
pub async fn server_accept_username_password<RW>(
    rw: &mut RW,
    credentials: &Credentials,
    enable_tcp: bool,
    enable_udp: bool,
    local_addr: Option<SocketAddr>,
) -> Result<(Accepted, String), Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    let mut b = [0u8; 3 + MAX_ADDR_LEN];
    server_handle_method_selection(rw, &mut b, consts::AUTH_METHOD_USERNAME_PASSWORD).await?;
    let username = server_handle_username_password(rw, &mut b, credentials).await?;
    let accepted = server_handle_request(rw, &mut b, enable_tcp, enable_udp, local_addr).await?;
    Ok((accepted, username))
}
