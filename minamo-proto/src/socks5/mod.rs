//! SOCKS5 protocol engine (RFC 1928) with username/password authentication
//! (RFC 1929), usable from both the client and the server side of a
//! bytestream transport.

use std::collections::HashMap;
use std::fmt;
use std::io;

use thiserror::Error as ThisError;

mod addr;
#[cfg(feature = "tokio")]
mod stream;

pub use addr::{Address, AddressError, MAX_ADDR_LEN};
#[cfg(feature = "tokio")]
pub use addr::append_from_reader;
#[cfg(feature = "tokio")]
pub use stream::{
    client_connect, client_connect_username_password, client_do_request,
    client_do_username_password_auth, client_negotiate_auth_method, client_request,
    client_request_username_password, client_udp_associate,
    client_udp_associate_username_password, server_accept, server_accept_username_password,
    server_handle_method_selection, server_handle_request, server_handle_username_password,
    Accepted, PrefixedReader,
};

pub use self::consts::{
    AUTH_METHOD_NONE, AUTH_METHOD_NOT_ACCEPTABLE, AUTH_METHOD_USERNAME_PASSWORD,
    USERNAME_PASSWORD_AUTH_VERSION, VERSION,
};

#[rustfmt::skip]
pub mod consts {
    pub const VERSION:                        u8 = 0x05;

    pub const AUTH_METHOD_NONE:               u8 = 0x00;
    pub const AUTH_METHOD_GSSAPI:             u8 = 0x01;
    pub const AUTH_METHOD_USERNAME_PASSWORD:  u8 = 0x02;
    pub const AUTH_METHOD_NOT_ACCEPTABLE:     u8 = 0xff;

    pub const USERNAME_PASSWORD_AUTH_VERSION: u8 = 0x01;

    pub const CMD_CONNECT:                    u8 = 0x01;
    pub const CMD_BIND:                       u8 = 0x02;
    pub const CMD_UDP_ASSOCIATE:              u8 = 0x03;

    pub const ATYP_IPV4:                      u8 = 0x01;
    pub const ATYP_DOMAIN:                    u8 = 0x03;
    pub const ATYP_IPV6:                      u8 = 0x04;

    pub const REPLY_SUCCEEDED:                u8 = 0x00;
    pub const REPLY_GENERAL_FAILURE:          u8 = 0x01;
    pub const REPLY_CONNECTION_NOT_ALLOWED:   u8 = 0x02;
    pub const REPLY_NETWORK_UNREACHABLE:      u8 = 0x03;
    pub const REPLY_HOST_UNREACHABLE:         u8 = 0x04;
    pub const REPLY_CONNECTION_REFUSED:       u8 = 0x05;
    pub const REPLY_TTL_EXPIRED:              u8 = 0x06;
    pub const REPLY_COMMAND_NOT_SUPPORTED:    u8 = 0x07;
    pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// SOCKS5 request command.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum Command {
    /// CONNECT command (TCP tunnel)
    Connect,
    /// BIND command (not supported)
    Bind,
    /// UDP ASSOCIATE command
    UdpAssociate,
}

impl Command {
    #[inline]
    #[rustfmt::skip]
    pub fn as_u8(self) -> u8 {
        match self {
            Command::Connect      => consts::CMD_CONNECT,
            Command::Bind         => consts::CMD_BIND,
            Command::UdpAssociate => consts::CMD_UDP_ASSOCIATE,
        }
    }

    #[inline]
    #[rustfmt::skip]
    pub fn from_u8(code: u8) -> Option<Command> {
        match code {
            consts::CMD_CONNECT       => Some(Command::Connect),
            consts::CMD_BIND          => Some(Command::Bind),
            consts::CMD_UDP_ASSOCIATE => Some(Command::UdpAssociate),
            _                         => None,
        }
    }
}

/// SOCKS5 reply code.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,

    OtherReply(u8),
}

impl Reply {
    #[inline]
    #[rustfmt::skip]
    pub fn as_u8(self) -> u8 {
        match self {
            Reply::Succeeded               => consts::REPLY_SUCCEEDED,
            Reply::GeneralFailure          => consts::REPLY_GENERAL_FAILURE,
            Reply::ConnectionNotAllowed    => consts::REPLY_CONNECTION_NOT_ALLOWED,
            Reply::NetworkUnreachable      => consts::REPLY_NETWORK_UNREACHABLE,
            Reply::HostUnreachable         => consts::REPLY_HOST_UNREACHABLE,
            Reply::ConnectionRefused       => consts::REPLY_CONNECTION_REFUSED,
            Reply::TtlExpired              => consts::REPLY_TTL_EXPIRED,
            Reply::CommandNotSupported     => consts::REPLY_COMMAND_NOT_SUPPORTED,
            Reply::AddressTypeNotSupported => consts::REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
            Reply::OtherReply(c)           => c,
        }
    }

    #[inline]
    #[rustfmt::skip]
    pub fn from_u8(code: u8) -> Reply {
        match code {
            consts::REPLY_SUCCEEDED                  => Reply::Succeeded,
            consts::REPLY_GENERAL_FAILURE            => Reply::GeneralFailure,
            consts::REPLY_CONNECTION_NOT_ALLOWED     => Reply::ConnectionNotAllowed,
            consts::REPLY_NETWORK_UNREACHABLE        => Reply::NetworkUnreachable,
            consts::REPLY_HOST_UNREACHABLE           => Reply::HostUnreachable,
            consts::REPLY_CONNECTION_REFUSED         => Reply::ConnectionRefused,
            consts::REPLY_TTL_EXPIRED                => Reply::TtlExpired,
            consts::REPLY_COMMAND_NOT_SUPPORTED      => Reply::CommandNotSupported,
            consts::REPLY_ADDRESS_TYPE_NOT_SUPPORTED => Reply::AddressTypeNotSupported,
            _                                        => Reply::OtherReply(code),
        }
    }
}

impl fmt::Display for Reply {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Reply::Succeeded               => write!(f, "succeeded"),
            Reply::GeneralFailure          => write!(f, "general SOCKS server failure"),
            Reply::ConnectionNotAllowed    => write!(f, "connection not allowed by ruleset"),
            Reply::NetworkUnreachable      => write!(f, "network unreachable"),
            Reply::HostUnreachable         => write!(f, "host unreachable"),
            Reply::ConnectionRefused       => write!(f, "connection refused"),
            Reply::TtlExpired              => write!(f, "TTL expired"),
            Reply::CommandNotSupported     => write!(f, "command not supported"),
            Reply::AddressTypeNotSupported => write!(f, "address type not supported"),
            Reply::OtherReply(c)           => write!(f, "unknown reply ({c:#04x})"),
        }
    }
}

/// SOCKS5 protocol error.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("unsupported authentication method: {0:#04x}")]
    UnsupportedAuthMethod(u8),
    #[error("unsupported username/password auth version: {0:#04x}")]
    UnsupportedAuthVersion(u8),
    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),
    #[error("no acceptable authentication method")]
    NoAcceptableAuthMethod,
    #[error("incorrect username or password")]
    IncorrectCredentials,
    #[error("NMETHODS is 0")]
    ZeroNMethods,
    #[error("ULEN is 0")]
    ZeroUlen,
    #[error("PLEN is 0")]
    ZeroPlen,
    #[error("domain length is 0")]
    InvalidDomainLength,
    #[error("invalid domain encoding")]
    InvalidDomainEncoding,
    #[error("username length out of range [1, 255]")]
    UsernameLengthOutOfRange,
    #[error("password length out of range [1, 255]")]
    PasswordLengthOutOfRange,
    #[error("stream ended in the middle of a message")]
    ShortRead,
    #[error("UDP ASSOCIATE requires a TCP connection")]
    RequiresTcpConnection,
    #[error("SOCKS5 reply: {0}")]
    ReplyError(Reply),
    #[error(transparent)]
    Io(io::Error),
}

impl Error {
    /// True for errors that reject a protocol extension this implementation
    /// refuses, as opposed to I/O failures or malformed framing.
    pub fn is_protocol_rejection(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedVersion(_)
                | Error::UnsupportedAuthMethod(_)
                | Error::UnsupportedAuthVersion(_)
                | Error::UnsupportedCommand(_)
                | Error::UnsupportedAddressType(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        // read_exact reports a stream that ended mid-message as UnexpectedEof.
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::ShortRead
        } else {
            Error::Io(err)
        }
    }
}

/// A username/password pair for RFC 1929 authentication.
///
/// Both fields must be non-empty and at most 255 bytes long.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
    pub password: String,
}

impl UserInfo {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> UserInfo {
        UserInfo {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Checks the RFC 1929 length bounds on both fields.
    pub fn validate(&self) -> Result<(), Error> {
        if self.username.is_empty() || self.username.len() > 255 {
            return Err(Error::UsernameLengthOutOfRange);
        }
        if self.password.is_empty() || self.password.len() > 255 {
            return Err(Error::PasswordLengthOutOfRange);
        }
        Ok(())
    }

    /// Length of the serialized authentication message.
    pub fn auth_msg_len(&self) -> usize {
        1 + 1 + self.username.len() + 1 + self.password.len()
    }

    /// Appends the pair as an RFC 1929 authentication message.
    ///
    /// Call [`UserInfo::validate`] first.
    pub fn append_auth_msg(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.auth_msg_len());
        buf.push(consts::USERNAME_PASSWORD_AUTH_VERSION);
        buf.push(self.username.len() as u8);
        buf.extend_from_slice(self.username.as_bytes());
        buf.push(self.password.len() as u8);
        buf.extend_from_slice(self.password.as_bytes());
    }
}

/// Credentials table keyed by username.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    users: HashMap<String, UserInfo>,
}

impl Credentials {
    pub fn new() -> Credentials {
        Credentials::default()
    }

    /// Inserts a user, validating the length bounds first.
    pub fn insert(&mut self, user: UserInfo) -> Result<(), Error> {
        user.validate()?;
        self.users.insert(user.username.clone(), user);
        Ok(())
    }

    pub fn get(&self, username: &str) -> Option<&UserInfo> {
        self.users.get(username)
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_info_validate() {
        assert!(UserInfo::new("user", "pass").validate().is_ok());
        assert!(UserInfo::new("u".repeat(255), "p".repeat(255))
            .validate()
            .is_ok());

        assert!(matches!(
            UserInfo::new("", "pass").validate(),
            Err(Error::UsernameLengthOutOfRange)
        ));
        assert!(matches!(
            UserInfo::new("u".repeat(256), "pass").validate(),
            Err(Error::UsernameLengthOutOfRange)
        ));
        assert!(matches!(
            UserInfo::new("user", "").validate(),
            Err(Error::PasswordLengthOutOfRange)
        ));
        assert!(matches!(
            UserInfo::new("user", "p".repeat(256)).validate(),
            Err(Error::PasswordLengthOutOfRange)
        ));
    }

    #[test]
    fn test_auth_msg_layout() {
        let user = UserInfo::new("user", "pass");
        let mut buf = Vec::new();
        user.append_auth_msg(&mut buf);
        assert_eq!(
            buf,
            [0x01, 0x04, 0x75, 0x73, 0x65, 0x72, 0x04, 0x70, 0x61, 0x73, 0x73]
        );
        assert_eq!(buf.len(), user.auth_msg_len());
    }

    #[test]
    fn test_credentials_rejects_invalid() {
        let mut creds = Credentials::new();
        assert!(creds.insert(UserInfo::new("", "pass")).is_err());
        assert!(creds.insert(UserInfo::new("user", "pass")).is_ok());
        assert_eq!(creds.len(), 1);
        assert_eq!(creds.get("user").unwrap().password, "pass");
        assert!(creds.get("nobody").is_none());
    }

    #[test]
    fn test_protocol_rejection_classification() {
        assert!(Error::UnsupportedVersion(4).is_protocol_rejection());
        assert!(Error::UnsupportedCommand(2).is_protocol_rejection());
        assert!(Error::UnsupportedAddressType(9).is_protocol_rejection());
        assert!(!Error::ShortRead.is_protocol_rejection());
        assert!(!Error::IncorrectCredentials.is_protocol_rejection());
        assert!(!Error::ReplyError(Reply::HostUnreachable).is_protocol_rejection());
    }
}
