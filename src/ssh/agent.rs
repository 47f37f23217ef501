//! SSH Agent Client
//!
//! Talks to the agent selected for a host (`IdentityAgent`, `SSH_AUTH_SOCK`
//! or the OpenSSH for Windows pipe) through russh's [`AgentClient`]. Two
//! operations are needed: listing identities for ranking, and signing the
//! server challenge for exactly one chosen key.
//!
//! # Platform Support
//! - **Unix/Linux/macOS**: Unix domain socket path
//! - **Windows**: named pipe path (e.g. `\\.\pipe\openssh-ssh-agent`)
//!
//! # The `AgentSigner` Workaround (Send + RPITIT)
//!
//! russh 0.54's built-in `impl Signer for AgentClient` returns `impl Future + Send`
//! via RPITIT. Inside [`Handle::authenticate_publickey_with`], the call
//! `signer.auth_publickey_sign(&key, ...)` captures `&key` where `key` is a local
//! `PublicKey` from `Reply::SignRequest`. The compiler cannot prove `Send` for
//! this borrow's lifetime through RPITIT (related: rust-lang/rust#100013).
//! `AgentSigner` clones the key into the future before awaiting.

use std::future::Future;
use std::path::Path;

use async_trait::async_trait;
use russh::client::{AuthResult, Handle, Handler};
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key::{self, PublicKey};
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info};

use crate::ssh::error::SshError;

type DynAgentClient = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// Send-safe wrapper around [`AgentClient`] implementing the [`Signer`] trait.
struct AgentSigner<'a> {
    agent: &'a mut DynAgentClient,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// SSH Agent client wrapper
///
/// Wraps russh's `AgentClient` with a type-erased stream for cross-platform support.
pub struct SshAgentClient {
    agent: DynAgentClient,
}

impl SshAgentClient {
    /// Connect to the agent listening at `socket`
    pub async fn connect(socket: &Path) -> Result<Self, SshError> {
        debug!("Connecting to SSH Agent at {:?}", socket);

        #[cfg(unix)]
        {
            let agent = AgentClient::connect_uds(socket).await.map_err(|e| {
                SshError::AgentNotAvailable(format!(
                    "Failed to connect to SSH Agent at {}: {}",
                    socket.display(),
                    e
                ))
            })?;
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(windows)]
        {
            let agent = AgentClient::connect_named_pipe(socket)
                .await
                .map_err(|e| {
                    SshError::AgentNotAvailable(format!(
                        "Failed to connect to SSH Agent via named pipe {}: {}. \
                         Make sure the OpenSSH Authentication Agent service is running.",
                        socket.display(),
                        e
                    ))
                })?;
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = socket;
            Err(SshError::AgentNotAvailable(
                "SSH Agent is not supported on this platform".to_string(),
            ))
        }
    }

    /// Keys currently held by the agent, in agent order
    pub async fn request_identities(&mut self) -> Result<Vec<PublicKey>, SshError> {
        self.agent
            .request_identities()
            .await
            .map_err(|e| SshError::AgentError(format!("Failed to list agent keys: {}", e)))
    }

    /// Offer one agent-held key to the server, letting the agent sign the challenge
    ///
    /// RSA keys are signed with the strongest hash the server advertised.
    pub async fn authenticate_with_key<H: Handler>(
        &mut self,
        handle: &mut Handle<H>,
        username: &str,
        key: PublicKey,
    ) -> Result<AuthResult, SshError> {
        debug!("Trying agent key: {} ({})", key.algorithm(), key.comment());

        let hash_alg = signature_hash(&key, handle.best_supported_rsa_hash().await?);

        let comment = key.comment().to_string();
        let result = handle
            .authenticate_publickey_with(
                username,
                key,
                hash_alg,
                &mut AgentSigner {
                    agent: &mut self.agent,
                },
            )
            .await
            .map_err(|e| SshError::AgentError(format!("Agent signing error: {}", e)))?;

        if result.success() {
            info!("SSH Agent authentication succeeded with key: {}", comment);
        }
        Ok(result)
    }
}

/// Hash requested from the agent for `key`
///
/// `server_best` is the server's `server-sig-algs` answer. RSA keys without
/// an explicit hash are signed with SHA-1, which only servers that sent no
/// `server-sig-algs` still accept.
fn signature_hash(
    key: &PublicKey,
    server_best: Option<Option<ssh_key::HashAlg>>,
) -> Option<ssh_key::HashAlg> {
    if !key.algorithm().is_rsa() {
        return None;
    }
    server_best.flatten()
}

/// Source of agent identities, keyed by agent socket path
#[async_trait]
pub trait AgentIdentities: Send + Sync {
    async fn identities(&self, socket: &Path) -> Result<Vec<PublicKey>, SshError>;
}

/// The real agent reached over its socket or pipe
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAgent;

#[async_trait]
impl AgentIdentities for SystemAgent {
    async fn identities(&self, socket: &Path) -> Result<Vec<PublicKey>, SshError> {
        let mut client = SshAgentClient::connect(socket).await?;
        client.request_identities().await
    }
}
