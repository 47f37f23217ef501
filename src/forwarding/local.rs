//! Local Port Forwarding
//!
//! Loopback listeners whose accepted connections are handed to a
//! [`ConnectionHandler`]. The direct tunnel lives here: every connection
//! opens its own session forwarding channel to a remote port or unix socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::ssh::{ForwardStream, RemoteSession, SshError};

/// Where a tunnel ends on the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTarget {
    /// TCP port on the remote loopback
    Port(u16),
    /// Unix socket path on the remote host
    Socket(String),
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteTarget::Port(port) => write!(f, "{}", port),
            RemoteTarget::Socket(path) => write!(f, "{}", path),
        }
    }
}

/// Statistics for a port forward
#[derive(Debug, Clone, Default)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (client -> server)
    pub bytes_sent: u64,
    /// Total bytes received (server -> client)
    pub bytes_received: u64,
}

/// Serves one accepted client connection
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Returns (bytes sent, bytes received)
    async fn handle(&self, stream: TcpStream) -> Result<(u64, u64), SshError>;
}

/// Handle to a running loopback listener
pub struct ForwardHandle {
    /// Actual bound address (may differ from requested if port was 0)
    pub bound_addr: SocketAddr,
    /// Flag to stop the forwarding loop
    running: Arc<AtomicBool>,
    /// Channel to signal stop
    stop_tx: mpsc::Sender<()>,
    /// Connection statistics
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
}

impl ForwardHandle {
    /// Stop accepting; connections already being served run to completion
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Stopping listener on {}", self.bound_addr);
            let _ = self.stop_tx.send(()).await;
        }
    }

    /// Check if the listener is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_port(&self) -> u16 {
        self.bound_addr.port()
    }

    /// Get current statistics
    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

/// Bind a loopback listener, mapping the common failures to readable errors
pub async fn bind_loopback(port: u16) -> Result<TcpListener, SshError> {
    let local_addr = format!("127.0.0.1:{}", port);
    TcpListener::bind(&local_addr).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => SshError::TunnelError(format!(
            "Port already in use: {}. Another application may be using this port.",
            local_addr
        )),
        std::io::ErrorKind::PermissionDenied => SshError::TunnelError(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            local_addr
        )),
        _ => SshError::TunnelError(format!("Failed to bind to {}: {}", local_addr, e)),
    })
}

/// Run the accept loop for `listener` in the background
pub fn spawn_listener(
    listener: TcpListener,
    name: String,
    handler: Arc<dyn ConnectionHandler>,
) -> Result<ForwardHandle, SshError> {
    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::TunnelError(format!("Failed to get bound address: {}", e)))?;

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let stats = Arc::new(parking_lot::RwLock::new(ForwardStats::default()));
    let stats_clone = stats.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    info!("{} stopped by request", name);
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if !running_clone.load(Ordering::SeqCst) {
                                break;
                            }

                            // Disable Nagle's algorithm for low-latency forwarding
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }

                            debug!("{}: accepted connection from {}", name, peer_addr);

                            {
                                let mut s = stats_clone.write();
                                s.connection_count += 1;
                                s.active_connections += 1;
                            }

                            let handler = handler.clone();
                            let stats_for_conn = stats_clone.clone();
                            let conn_name = name.clone();

                            tokio::spawn(async move {
                                let result = handler.handle(stream).await;

                                let mut s = stats_for_conn.write();
                                s.active_connections = s.active_connections.saturating_sub(1);
                                match result {
                                    Ok((sent, received)) => {
                                        s.bytes_sent += sent;
                                        s.bytes_received += received;
                                    }
                                    Err(e) => {
                                        warn!("{}: connection from {} failed: {}", conn_name, peer_addr, e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("{}: accept error: {}", name, e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        running_clone.store(false, Ordering::SeqCst);
        debug!("{} listener task exited", name);
    });

    Ok(ForwardHandle {
        bound_addr,
        running,
        stop_tx,
        stats,
    })
}

/// Splice a local connection and an upstream stream until either side closes
pub async fn splice(mut local: TcpStream, mut upstream: ForwardStream) -> (u64, u64) {
    match tokio::io::copy_bidirectional(&mut local, &mut upstream).await {
        Ok((sent, received)) => (sent, received),
        Err(e) => {
            debug!("Forward connection closed with error: {}", e);
            let _ = upstream.shutdown().await;
            (0, 0)
        }
    }
}

/// Direct tunnel: one forwarding channel per accepted connection
pub struct DirectForward<S: RemoteSession + Clone> {
    session: S,
    target: RemoteTarget,
}

impl<S: RemoteSession + Clone> DirectForward<S> {
    pub fn new(session: S, target: RemoteTarget) -> Self {
        Self { session, target }
    }
}

#[async_trait]
impl<S: RemoteSession + Clone> ConnectionHandler for DirectForward<S> {
    async fn handle(&self, stream: TcpStream) -> Result<(u64, u64), SshError> {
        let upstream = match &self.target {
            RemoteTarget::Port(port) => self.session.open_direct_tcpip("127.0.0.1", *port).await?,
            RemoteTarget::Socket(path) => self.session.open_direct_streamlocal(path).await?,
        };
        debug!("Opened channel for forward to {}", self.target);
        Ok(splice(stream, upstream).await)
    }
}

/// Start a direct tunnel from `127.0.0.1:local_port` to `target`
pub async fn start_direct_forward<S: RemoteSession + Clone>(
    session: S,
    local_port: u16,
    target: RemoteTarget,
) -> Result<ForwardHandle, SshError> {
    let listener = bind_loopback(local_port).await?;
    let bound = listener
        .local_addr()
        .map_err(|e| SshError::TunnelError(format!("Failed to get bound address: {}", e)))?;
    info!("Started direct forward: {} -> {}", bound, target);

    let handler = Arc::new(DirectForward::new(session, target));
    spawn_listener(listener, format!("Direct forward {}", bound), handler)
}
