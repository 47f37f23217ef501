//! Session seams
//!
//! Everything above the transport (proxy chains, tunnels, the remote
//! bootstrap) talks to an authenticated connection through
//! [`RemoteSession`], and obtains one through [`SshConnector`]. The russh
//! implementations live in `client` and `handle_owner`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::SshError;
use super::negotiator::AuthNegotiator;
use crate::config::ResolvedHost;

/// Bidirectional byte stream carried by a forwarding channel
pub trait ForwardStreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ForwardStreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type ForwardStream = Box<dyn ForwardStreamIo>;

/// Result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_status: Option<u32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// An authenticated SSH connection
#[async_trait]
pub trait RemoteSession: Send + Sync + 'static {
    /// `direct-tcpip` channel to `host:port` as seen from the remote side
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<ForwardStream, SshError>;

    /// `direct-streamlocal@openssh.com` channel to a remote unix socket
    async fn open_direct_streamlocal(&self, socket_path: &str) -> Result<ForwardStream, SshError>;

    /// Run a command and collect its output
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError>;

    /// Tear down the connection and everything forwarded through it
    async fn close(&self);
}

/// How a session reaches its server
pub enum Transport {
    /// Open a TCP connection
    Dial { host: String, port: u16 },
    /// Run SSH over a stream forwarded by the previous hop
    Stream(ForwardStream),
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Dial { host, port } => write!(f, "Dial({}:{})", host, port),
            Transport::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// Per-session connection parameters
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Name used in logs
    pub label: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Serve `auth-agent@openssh.com` channels from the local agent
    pub forward_agent: bool,
    pub agent_socket: Option<PathBuf>,
}

impl SessionParams {
    pub fn for_host(host: &ResolvedHost, connect_timeout: Duration) -> Self {
        Self {
            label: host.alias.clone(),
            host: host.hostname.clone(),
            port: host.port,
            connect_timeout,
            forward_agent: host.forward_agent,
            agent_socket: host.agent_socket.clone(),
        }
    }

    /// Dial transport for this host
    pub fn dial(&self) -> Transport {
        Transport::Dial {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Establishes and authenticates sessions
#[async_trait]
pub trait SshConnector: Send + Sync {
    type Session: RemoteSession;

    async fn connect(
        &self,
        transport: Transport,
        params: &SessionParams,
        negotiator: &mut AuthNegotiator,
    ) -> Result<Self::Session, SshError>;
}
