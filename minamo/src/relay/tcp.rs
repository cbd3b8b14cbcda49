//! SOCKS5 TCP inbound service.
//!
//! Runs the protocol engine per accepted connection: CONNECT is bridged to
//! the dialed target, UDP ASSOCIATE holds the control connection and reports
//! when the association ends.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use minamo_proto::socks5::{
    server_accept, server_accept_username_password, Accepted, Credentials,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct Socks5TcpService {
    server_name: String,
    listener: TcpListener,
    credentials: Option<Arc<Credentials>>,
}

impl Socks5TcpService {
    /// Binds the listener. With credentials, every connection must complete
    /// username/password authentication.
    pub async fn bind(
        server_name: String,
        listen_address: SocketAddr,
        credentials: Option<Arc<Credentials>>,
    ) -> Result<Socks5TcpService> {
        let listener = TcpListener::bind(listen_address)
            .await
            .context("binding SOCKS5 TCP listener")?;
        Ok(Socks5TcpService {
            server_name,
            listener,
            credentials,
        })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        info!(
            server = %self.server_name,
            listen_address = %self.listen_addr()?,
            "started SOCKS5 TCP service"
        );

        loop {
            let (conn, peer) = self.listener.accept().await?;
            let credentials = self.credentials.clone();
            let server_name = self.server_name.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_conn(conn, peer, credentials).await {
                    warn!(
                        server = %server_name,
                        client_address = %peer,
                        error = %e,
                        "connection failed"
                    );
                }
            });
        }
    }
}

async fn handle_conn(
    mut conn: TcpStream,
    peer: SocketAddr,
    credentials: Option<Arc<Credentials>>,
) -> Result<()> {
    let local_addr = conn.local_addr().ok();

    let (accepted, username) = match credentials {
        Some(credentials) => {
            let (accepted, username) =
                server_accept_username_password(&mut conn, &credentials, true, true, local_addr)
                    .await?;
            (accepted, username)
        }
        None => (
            server_accept(&mut conn, true, true, local_addr).await?,
            String::new(),
        ),
    };

    match accepted {
        Accepted::Connect(target) => {
            let dest = target.resolve().await.context("resolving target")?;
            let mut upstream = TcpStream::connect(dest)
                .await
                .with_context(|| format!("connecting to {target}"))?;
            let (up, down) = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
            debug!(
                client_address = %peer,
                target_address = %target,
                username = %username,
                uplink_bytes = up,
                downlink_bytes = down,
                "TCP relay finished"
            );
        }
        Accepted::UdpAssociateDone(target) => {
            debug!(
                client_address = %peer,
                target_address = %target,
                username = %username,
                "UDP association ended"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use minamo_proto::socks5::{client_connect, client_connect_username_password, UserInfo};
    use minamo_proto::socks5::{Address, Error};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn spawn_tcp_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = conn.read(&mut buf).await {
                        if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_bridges_to_target() {
        let echo_addr = spawn_tcp_echo().await;
        let service = Socks5TcpService::bind(
            "test".to_owned(),
            "127.0.0.1:0".parse().unwrap(),
            None,
        )
        .await
        .unwrap();
        let listen = service.listen_addr().unwrap();
        tokio::spawn(service.serve());

        let mut conn = TcpStream::connect(listen).await.unwrap();
        let bound = client_connect(&mut conn, &Address::Ip(echo_addr))
            .await
            .unwrap();
        assert_eq!(bound, Address::unspecified());

        conn.write_all(b"through the bridge").await.unwrap();
        let mut buf = [0u8; 18];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the bridge");
    }

    #[tokio::test]
    async fn test_authenticated_connect() {
        let echo_addr = spawn_tcp_echo().await;
        let mut credentials = Credentials::new();
        credentials
            .insert(UserInfo::new("alice", "secret"))
            .unwrap();

        let service = Socks5TcpService::bind(
            "test".to_owned(),
            "127.0.0.1:0".parse().unwrap(),
            Some(Arc::new(credentials)),
        )
        .await
        .unwrap();
        let listen = service.listen_addr().unwrap();
        tokio::spawn(service.serve());

        let mut auth_msg = Vec::new();
        UserInfo::new("alice", "secret").append_auth_msg(&mut auth_msg);
        let mut conn = TcpStream::connect(listen).await.unwrap();
        let bound = client_connect_username_password(&mut conn, &auth_msg, &Address::Ip(echo_addr))
            .await
            .unwrap();
        assert_eq!(bound, Address::unspecified());

        conn.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_wrong_credentials_rejected() {
        let mut credentials = Credentials::new();
        credentials
            .insert(UserInfo::new("alice", "secret"))
            .unwrap();

        let service = Socks5TcpService::bind(
            "test".to_owned(),
            "127.0.0.1:0".parse().unwrap(),
            Some(Arc::new(credentials)),
        )
        .await
        .unwrap();
        let listen = service.listen_addr().unwrap();
        tokio::spawn(service.serve());

        let mut auth_msg = Vec::new();
        UserInfo::new("alice", "wrong").append_auth_msg(&mut auth_msg);
        let mut conn = TcpStream::connect(listen).await.unwrap();
        let res = client_connect_username_password(
            &mut conn,
            &auth_msg,
            &Address::Ip("127.0.0.1:80".parse().unwrap()),
        )
        .await;
        assert!(matches!(res, Err(Error::IncorrectCredentials)));
    }
}
