//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. All other components
//! (tunnels, the proxy chain, the remote bootstrap) communicate with it via
//! `HandleController` which sends commands through an mpsc channel.
//!
//! This avoids:
//! - `Arc<Mutex<Handle>>` lock contention
//! - Deadlocks from holding locks across `.await`
//! - Protocol violations from concurrent Handle access
//!
//! # Usage
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, "web".to_string());
//!
//! // Forward to a port on the remote loopback
//! let stream = controller.open_direct_tcpip("127.0.0.1", 8080).await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::session::{ExecOutput, ForwardStream, RemoteSession};

/// Upper bound for a remote command started through `exec`
const EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (for exec)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (for direct tunnels, dynamic forward and jump hops)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-streamlocal channel (for tunnels to a remote unix socket)
    ChannelOpenDirectStreamlocal {
        socket_path: String,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (it copies the `Sender`). The owner task disconnects
/// when asked to, or once every controller has been dropped.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    label: String,
    /// Request agent forwarding on every exec channel
    forward_agent: bool,
}

impl HandleController {
    /// Create a controller around an existing command channel
    ///
    /// This is primarily used for testing. In production, use `spawn_handle_owner_task`.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>, label: impl Into<String>) -> Self {
        Self {
            cmd_tx,
            label: label.into(),
            forward_agent: false,
        }
    }

    pub fn with_agent_forwarding(mut self, enabled: bool) -> Self {
        self.forward_agent = enabled;
        self
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Open a direct-tcpip channel
    pub async fn open_direct_tcpip_channel(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Open a direct-streamlocal channel
    pub async fn open_direct_streamlocal_channel(
        &self,
        socket_path: &str,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectStreamlocal {
                socket_path: socket_path.to_string(),
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }
}

#[async_trait]
impl RemoteSession for HandleController {
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<ForwardStream, SshError> {
        let channel = self
            .open_direct_tcpip_channel(host, port as u32, "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn open_direct_streamlocal(&self, socket_path: &str) -> Result<ForwardStream, SshError> {
        let channel = self.open_direct_streamlocal_channel(socket_path).await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        let mut channel = self.open_session_channel().await?;

        if self.forward_agent {
            if let Err(e) = channel.agent_forward(false).await {
                warn!("Agent forwarding request on {} failed: {}", self.label, e);
            }
        }

        debug!("Exec on {}: {}", self.label, command);
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to execute command: {}", e)))?;

        let mut output = ExecOutput::default();
        let collect = async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        output.stdout.extend_from_slice(&data);
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        // ext=1 is stderr
                        output.stderr.extend_from_slice(&data);
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        output.exit_status = Some(exit_status);
                    }
                    // exit-status may still follow EOF
                    Some(ChannelMsg::Eof) => {}
                    Some(ChannelMsg::Close) | None => break,
                    Some(_other) => {}
                }
            }
        };

        if tokio::time::timeout(EXEC_TIMEOUT, collect).await.is_err() {
            warn!("Exec on {} timed out after {:?}", self.label, EXEC_TIMEOUT);
            return Err(SshError::Timeout(format!("Remote command timed out: {}", command)));
        }

        Ok(output)
    }

    async fn close(&self) {
        self.disconnect().await;
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for sending commands.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let task_label = label.clone();

    tokio::spawn(async move {
        let label = task_label;
        info!("Handle owner task started for {}", label);

        loop {
            match cmd_rx.recv().await {
                Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                Some(HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                Some(HandleCommand::ChannelOpenDirectStreamlocal {
                    socket_path,
                    reply_tx,
                }) => {
                    let result = handle.channel_open_direct_streamlocal(&socket_path).await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_streamlocal result");
                    }
                }

                Some(HandleCommand::Disconnect) => {
                    info!("Disconnect requested for {}", label);
                    break;
                }

                None => {
                    info!("All controllers dropped for {}", label);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        label,
        forward_agent: false,
    }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx }
            | HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. }
            | HandleCommand::ChannelOpenDirectStreamlocal { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_controller_reports_disconnected_when_task_gone() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx, "web");
        drop(cmd_rx);

        assert!(matches!(
            controller.open_direct_tcpip("127.0.0.1", 80).await,
            Err(SshError::Disconnected)
        ));
        assert!(matches!(
            controller.exec("true").await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_drain_answers_pending_requests() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(HandleCommand::ChannelOpenDirectStreamlocal {
                socket_path: "/run/app.sock".into(),
                reply_tx,
            })
            .await
            .unwrap();
        cmd_tx.send(HandleCommand::Disconnect).await.unwrap();

        drain_pending_commands(&mut cmd_rx);
        assert!(matches!(reply_rx.await, Ok(Err(russh::Error::Disconnect))));
    }

    #[tokio::test]
    async fn test_dropped_reply_is_disconnected() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx, "web");

        tokio::spawn(async move {
            // Receive and drop the request without answering
            let _ = cmd_rx.recv().await;
        });

        assert!(matches!(
            controller.open_direct_streamlocal("/run/app.sock").await,
            Err(SshError::Disconnected)
        ));
    }
}
