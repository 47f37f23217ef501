//! Tunnel Manager
//!
//! Owns every tunnel opened on top of one session. Tunnels are named after
//! their ports, closed individually or all at once, and a closed tunnel is
//! forgotten so a second close is a no-op.

use std::net::SocketAddr;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::dynamic::start_dynamic_forward;
use super::local::{start_direct_forward, ForwardHandle, ForwardStats, RemoteTarget};
use super::socks_route::start_socks_route;
use crate::ssh::{RemoteSession, SshError};

/// How a tunnel carries its connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TunnelKind {
    /// SOCKS5 dynamic forwarder
    Socks,
    /// One session forwarding channel per connection
    Direct,
    /// Local listener routed through the SOCKS tunnel
    SocksRouted,
}

/// Public description of an open tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelDescriptor {
    pub name: String,
    pub local_port: u16,
    pub remote_address: Option<String>,
    pub remote_port: Option<u16>,
    pub remote_socket_path: Option<String>,
    pub is_socks: bool,
    pub kind: TunnelKind,
}

impl TunnelDescriptor {
    fn socks(local_port: u16) -> Self {
        Self {
            name: format!("ssh_tunnel_socks_{}", local_port),
            local_port,
            remote_address: None,
            remote_port: None,
            remote_socket_path: None,
            is_socks: true,
            kind: TunnelKind::Socks,
        }
    }

    fn forward(local_port: u16, target: &RemoteTarget, kind: TunnelKind) -> Self {
        let name = match kind {
            TunnelKind::SocksRouted => format!("socks_forward_{}_{}", local_port, target),
            _ => format!("ssh_tunnel_{}_{}", local_port, target),
        };
        let (remote_address, remote_port, remote_socket_path) = match target {
            RemoteTarget::Port(port) => (Some("127.0.0.1".to_string()), Some(*port), None),
            RemoteTarget::Socket(path) => (None, None, Some(path.clone())),
        };
        Self {
            name,
            local_port,
            remote_address,
            remote_port,
            remote_socket_path,
            is_socks: false,
            kind,
        }
    }
}

struct TunnelEntry {
    descriptor: TunnelDescriptor,
    handle: ForwardHandle,
}

/// Tunnel manager for one session
pub struct TunnelManager<S: RemoteSession + Clone> {
    session: S,
    /// Open tunnels in creation order
    tunnels: RwLock<Vec<TunnelEntry>>,
}

impl<S: RemoteSession + Clone> TunnelManager<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            tunnels: RwLock::new(Vec::new()),
        }
    }

    /// Start the SOCKS5 dynamic forwarder
    pub async fn open_socks_tunnel(&self, local_port: u16) -> Result<TunnelDescriptor, SshError> {
        if let Some(existing) = self.socks_addr().await {
            return Err(SshError::TunnelError(format!(
                "SOCKS tunnel already open on {}",
                existing
            )));
        }

        let handle = start_dynamic_forward(self.session.clone(), local_port).await?;
        let descriptor = TunnelDescriptor::socks(handle.local_port());
        info!("Opened tunnel {}", descriptor.name);
        self.tunnels.write().await.push(TunnelEntry {
            descriptor: descriptor.clone(),
            handle,
        });
        Ok(descriptor)
    }

    /// Open a tunnel from `127.0.0.1:local_port` to `target`
    ///
    /// Port targets go through the SOCKS tunnel when one is open; socket
    /// targets always get a direct tunnel.
    pub async fn open_tunnel(
        &self,
        local_port: u16,
        target: RemoteTarget,
    ) -> Result<TunnelDescriptor, SshError> {
        let (handle, kind) = match (&target, self.socks_addr().await) {
            (RemoteTarget::Port(port), Some(proxy)) => (
                start_socks_route(proxy, local_port, *port).await?,
                TunnelKind::SocksRouted,
            ),
            _ => (
                start_direct_forward(self.session.clone(), local_port, target.clone()).await?,
                TunnelKind::Direct,
            ),
        };

        let descriptor = TunnelDescriptor::forward(handle.local_port(), &target, kind);
        info!("Opened tunnel {}", descriptor.name);
        self.tunnels.write().await.push(TunnelEntry {
            descriptor: descriptor.clone(),
            handle,
        });
        Ok(descriptor)
    }

    /// Stop a tunnel; returns false when no such tunnel is open
    pub async fn close_tunnel(&self, name: &str) -> bool {
        let entry = {
            let mut tunnels = self.tunnels.write().await;
            tunnels
                .iter()
                .position(|e| e.descriptor.name == name)
                .map(|index| tunnels.remove(index))
        };

        match entry {
            Some(entry) => {
                entry.handle.stop().await;
                info!("Closed tunnel {}", name);
                true
            }
            None => {
                debug!("Tunnel {} already closed", name);
                false
            }
        }
    }

    /// Stop every tunnel, newest first
    pub async fn close_all(&self) {
        let entries: Vec<TunnelEntry> = self.tunnels.write().await.drain(..).rev().collect();
        for entry in entries {
            entry.handle.stop().await;
            info!("Closed tunnel {}", entry.descriptor.name);
        }
    }

    pub async fn list(&self) -> Vec<TunnelDescriptor> {
        self.tunnels
            .read()
            .await
            .iter()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub async fn stats(&self, name: &str) -> Option<ForwardStats> {
        self.tunnels
            .read()
            .await
            .iter()
            .find(|e| e.descriptor.name == name)
            .map(|e| e.handle.stats())
    }

    /// Address of the SOCKS tunnel, if open
    pub async fn socks_addr(&self) -> Option<SocketAddr> {
        self.tunnels
            .read()
            .await
            .iter()
            .find(|e| e.descriptor.kind == TunnelKind::Socks)
            .map(|e| e.handle.bound_addr)
    }

    pub async fn count(&self) -> usize {
        self.tunnels.read().await.len()
    }
}
