//! Dynamic SOCKS5 Proxy Forwarding
//!
//! Implements a local SOCKS5 proxy server that tunnels connections through SSH.
//! Example: Local SOCKS5 proxy on 127.0.0.1:1080 -> SSH tunnel -> any destination

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::local::{bind_loopback, spawn_listener, splice, ConnectionHandler, ForwardHandle};
use crate::ssh::{RemoteSession, SshError};

/// SOCKS5 protocol constants
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_UNACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

/// SOCKS5 server whose CONNECT requests become `direct-tcpip` channels
pub struct SocksServer<S: RemoteSession + Clone> {
    session: S,
}

impl<S: RemoteSession + Clone> SocksServer<S> {
    pub fn new(session: S) -> Self {
        Self { session }
    }
}

#[async_trait]
impl<S: RemoteSession + Clone> ConnectionHandler for SocksServer<S> {
    async fn handle(&self, mut stream: TcpStream) -> Result<(u64, u64), SshError> {
        let (dest_host, dest_port) = read_connect_request(&mut stream).await?;
        debug!("SOCKS5: Connecting to {}:{}", dest_host, dest_port);

        let upstream = match self.session.open_direct_tcpip(&dest_host, dest_port).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(
                    "Failed to open SSH channel to {}:{}: {}",
                    dest_host, dest_port, e
                );
                send_socks5_reply(&mut stream, socks5::REP_HOST_UNREACHABLE).await?;
                return Err(e);
            }
        };

        send_socks5_reply(&mut stream, socks5::REP_SUCCESS).await?;
        debug!("SOCKS5: Tunnel established to {}:{}", dest_host, dest_port);

        Ok(splice(stream, upstream).await)
    }
}

/// Start a SOCKS5 proxy on `127.0.0.1:local_port`
pub async fn start_dynamic_forward<S: RemoteSession + Clone>(
    session: S,
    local_port: u16,
) -> Result<ForwardHandle, SshError> {
    let listener = bind_loopback(local_port).await?;
    let bound = listener
        .local_addr()
        .map_err(|e| SshError::TunnelError(format!("Failed to get bound address: {}", e)))?;
    info!("Started SOCKS5 proxy on {}", bound);

    spawn_listener(
        listener,
        format!("SOCKS5 proxy {}", bound),
        Arc::new(SocksServer::new(session)),
    )
}

/// Run the greeting and request phases, returning the requested destination
async fn read_connect_request(stream: &mut TcpStream) -> Result<(String, u16), SshError> {
    // Phase 1: Authentication negotiation
    let mut buf = [0u8; 258];

    stream.read_exact(&mut buf[..2]).await.map_err(|e| {
        SshError::ConnectionFailed(format!("Failed to read SOCKS5 greeting: {}", e))
    })?;

    let version = buf[0];
    let nmethods = buf[1] as usize;

    if version != socks5::VERSION {
        return Err(SshError::ConnectionFailed(format!(
            "Unsupported SOCKS version: {}",
            version
        )));
    }

    stream
        .read_exact(&mut buf[..nmethods])
        .await
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to read auth methods: {}", e)))?;

    if !buf[..nmethods].contains(&socks5::AUTH_NONE) {
        stream
            .write_all(&[socks5::VERSION, socks5::AUTH_UNACCEPTABLE])
            .await
            .ok();
        return Err(SshError::ConnectionFailed(
            "Client doesn't support NO AUTH method".into(),
        ));
    }

    stream
        .write_all(&[socks5::VERSION, socks5::AUTH_NONE])
        .await
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to send auth response: {}", e)))?;

    // Phase 2: Connection request
    stream
        .read_exact(&mut buf[..4])
        .await
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to read SOCKS5 request: {}", e)))?;

    let version = buf[0];
    let cmd = buf[1];
    // buf[2] is reserved
    let atyp = buf[3];

    if version != socks5::VERSION {
        return Err(SshError::ConnectionFailed(
            "Invalid SOCKS5 version in request".into(),
        ));
    }

    if cmd != socks5::CMD_CONNECT {
        send_socks5_reply(stream, socks5::REP_CMD_NOT_SUPPORTED).await?;
        return Err(SshError::ConnectionFailed(format!(
            "Unsupported SOCKS5 command: {}",
            cmd
        )));
    }

    match atyp {
        socks5::ATYP_IPV4 => {
            stream.read_exact(&mut buf[..6]).await.map_err(|e| {
                SshError::ConnectionFailed(format!("Failed to read IPv4 address: {}", e))
            })?;
            let ip = std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok((ip.to_string(), port))
        }
        socks5::ATYP_DOMAIN => {
            stream.read_exact(&mut buf[..1]).await.map_err(|e| {
                SshError::ConnectionFailed(format!("Failed to read domain length: {}", e))
            })?;
            let domain_len = buf[0] as usize;
            stream
                .read_exact(&mut buf[..domain_len + 2])
                .await
                .map_err(|e| SshError::ConnectionFailed(format!("Failed to read domain: {}", e)))?;
            let domain = String::from_utf8_lossy(&buf[..domain_len]).to_string();
            let port = u16::from_be_bytes([buf[domain_len], buf[domain_len + 1]]);
            Ok((domain, port))
        }
        socks5::ATYP_IPV6 => {
            stream.read_exact(&mut buf[..18]).await.map_err(|e| {
                SshError::ConnectionFailed(format!("Failed to read IPv6 address: {}", e))
            })?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok((ip.to_string(), port))
        }
        _ => {
            send_socks5_reply(stream, socks5::REP_ADDR_NOT_SUPPORTED).await?;
            Err(SshError::ConnectionFailed(format!(
                "Unsupported address type: {}",
                atyp
            )))
        }
    }
}

/// Send a SOCKS5 reply
async fn send_socks5_reply(stream: &mut TcpStream, status: u8) -> Result<(), SshError> {
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    // The bound address is always reported as 0.0.0.0:0
    let reply = [
        socks5::VERSION,
        status,
        0x00,
        socks5::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];

    stream
        .write_all(&reply)
        .await
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to send SOCKS5 reply: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::session::tests::{MockSession, SessionEvent};
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio_socks::tcp::Socks5Stream;

    #[tokio::test]
    async fn test_connect_by_domain() {
        let session = Arc::new(MockSession::new("web", "dial"));
        let handle = start_dynamic_forward(session.clone(), 0).await.unwrap();

        let stream = Socks5Stream::connect(handle.bound_addr, ("build.internal", 5000))
            .await
            .unwrap();
        let mut reader = BufReader::new(stream);
        let mut banner = String::new();
        reader.read_line(&mut banner).await.unwrap();
        assert_eq!(banner, "build.internal:5000\n");

        reader.get_mut().write_all(b"ping\n").await.unwrap();
        let mut echo = String::new();
        reader.read_line(&mut echo).await.unwrap();
        assert_eq!(echo, "ping\n");

        assert_eq!(
            session.events(),
            vec![SessionEvent::DirectTcpip("build.internal".into(), 5000)]
        );
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_connect_by_ipv4() {
        let session = Arc::new(MockSession::new("web", "dial"));
        let handle = start_dynamic_forward(session.clone(), 0).await.unwrap();

        let stream = Socks5Stream::connect(handle.bound_addr, "10.1.2.3:8443")
            .await
            .unwrap();
        let mut reader = BufReader::new(stream);
        let mut banner = String::new();
        reader.read_line(&mut banner).await.unwrap();
        assert_eq!(banner, "10.1.2.3:8443\n");
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_refused_channel_reports_host_unreachable() {
        let session = Arc::new(MockSession::new("web", "dial"));
        session.refuse_channels.store(true, Ordering::SeqCst);
        let handle = start_dynamic_forward(session, 0).await.unwrap();

        let result = Socks5Stream::connect(handle.bound_addr, ("db.internal", 5432)).await;
        assert!(result.is_err());

        // The listener survives a failed client connection
        assert!(handle.is_running());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_rejects_clients_without_no_auth() {
        let session = Arc::new(MockSession::new("web", "dial"));
        let handle = start_dynamic_forward(session.clone(), 0).await.unwrap();

        let mut stream = TcpStream::connect(handle.bound_addr).await.unwrap();
        // Offer username/password only
        stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
        assert!(session.events().is_empty());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_rejects_bind_command() {
        let session = Arc::new(MockSession::new("web", "dial"));
        let handle = start_dynamic_forward(session.clone(), 0).await.unwrap();

        let mut stream = TcpStream::connect(handle.bound_addr).await.unwrap();
        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut auth = [0u8; 2];
        stream.read_exact(&mut auth).await.unwrap();
        assert_eq!(auth, [0x05, 0x00]);

        // BIND to 127.0.0.1:80
        stream
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x07);
        assert!(session.events().is_empty());
        handle.stop().await;
    }
}
