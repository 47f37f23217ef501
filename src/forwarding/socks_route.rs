//! SOCKS-routed forwarding
//!
//! A local listener whose connections are carried through the dynamic
//! forwarder instead of opening their own session channel.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, info};

use super::local::{bind_loopback, spawn_listener, splice, ConnectionHandler, ForwardHandle};
use crate::ssh::SshError;

/// Routes every accepted connection to `127.0.0.1:<remote_port>` via SOCKS5
pub struct SocksRoute {
    proxy: SocketAddr,
    remote_port: u16,
}

impl SocksRoute {
    pub fn new(proxy: SocketAddr, remote_port: u16) -> Self {
        Self { proxy, remote_port }
    }
}

#[async_trait]
impl ConnectionHandler for SocksRoute {
    async fn handle(&self, stream: TcpStream) -> Result<(u64, u64), SshError> {
        let upstream = Socks5Stream::connect(self.proxy, ("127.0.0.1", self.remote_port))
            .await
            .map_err(|e| {
                SshError::TunnelError(format!(
                    "SOCKS proxy {} could not reach port {}: {}",
                    self.proxy, self.remote_port, e
                ))
            })?
            .into_inner();
        debug!("Routed connection through {} to port {}", self.proxy, self.remote_port);

        Ok(splice(stream, Box::new(upstream)).await)
    }
}

/// Start a listener on `127.0.0.1:local_port` routed through `proxy`
pub async fn start_socks_route(
    proxy: SocketAddr,
    local_port: u16,
    remote_port: u16,
) -> Result<ForwardHandle, SshError> {
    let listener = bind_loopback(local_port).await?;
    let bound = listener
        .local_addr()
        .map_err(|e| SshError::TunnelError(format!("Failed to get bound address: {}", e)))?;
    info!(
        "Started SOCKS-routed forward: {} -> {} -> port {}",
        bound, proxy, remote_port
    );

    spawn_listener(
        listener,
        format!("SOCKS-routed forward {}", bound),
        Arc::new(SocksRoute::new(proxy, remote_port)),
    )
}
