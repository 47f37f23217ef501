//! SSH Client implementation using russh
//!
//! [`RusshConnector`] performs the handshake (over TCP or a forwarded
//! stream), drives the hop's [`AuthNegotiator`] until the server accepts or
//! every method is exhausted, then hands the handle to its owner task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey};
use russh::{Channel, MethodSet};
use tracing::{debug, info, warn};

use super::agent::SshAgentClient;
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::identity::fingerprint;
use super::negotiator::{AuthMethodKind, AuthNegotiator, AuthStep};
use super::prompt::KbiPrompt;
use super::session::{SessionParams, SshConnector, Transport};

/// Client handler for russh callbacks
///
/// This handler processes server-initiated events:
/// - Host key reporting
/// - Agent forwarding channels (`auth-agent@openssh.com`)
pub struct ClientHandler {
    label: String,
    host: String,
    port: u16,
    /// Local agent served to the remote side, when forwarding is enabled
    forward_agent: Option<PathBuf>,
}

impl ClientHandler {
    pub fn new(label: String, host: String, port: u16) -> Self {
        Self {
            label,
            host,
            port,
            forward_agent: None,
        }
    }

    pub fn with_agent_forwarding(mut self, agent_socket: Option<PathBuf>) -> Self {
        self.forward_agent = agent_socket;
        self
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Host key for {} ({}:{}): {} SHA256:{}",
            self.label,
            self.host,
            self.port,
            server_public_key.algorithm().as_str(),
            fingerprint(server_public_key).trim_end_matches('=')
        );
        Ok(true)
    }

    /// Called when the remote side connects to the forwarded agent
    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<client::Msg>,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(socket) = self.forward_agent.clone() else {
            warn!("Agent forwarding channel from {} refused: not enabled", self.label);
            return Ok(());
        };

        let label = self.label.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge_agent(channel, &socket).await {
                warn!("Agent forwarding for {} failed: {}", label, e);
            }
        });
        Ok(())
    }
}

/// Splice a forwarded agent channel onto the local agent socket
async fn bridge_agent(channel: Channel<client::Msg>, socket: &std::path::Path) -> std::io::Result<()> {
    let mut remote = channel.into_stream();

    #[cfg(unix)]
    let mut local = tokio::net::UnixStream::connect(socket).await?;

    #[cfg(windows)]
    let mut local = tokio::net::windows::named_pipe::ClientOptions::new().open(socket)?;

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (&mut remote, socket);
        return Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "agent forwarding is not supported on this platform",
        ));
    }

    #[cfg(any(unix, windows))]
    {
        tokio::io::copy_bidirectional(&mut remote, &mut local).await?;
        Ok(())
    }
}

/// Connector backed by russh
#[derive(Debug, Clone, Default)]
pub struct RusshConnector;

impl RusshConnector {
    fn client_config() -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        })
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    type Session = HandleController;

    async fn connect(
        &self,
        transport: Transport,
        params: &SessionParams,
        negotiator: &mut AuthNegotiator,
    ) -> Result<HandleController, SshError> {
        let forward_agent = if params.forward_agent {
            params.agent_socket.clone()
        } else {
            None
        };
        let handler = ClientHandler::new(params.label.clone(), params.host.clone(), params.port)
            .with_agent_forwarding(forward_agent.clone());
        let config = Self::client_config();

        info!("Connecting to {} ({}:{}) via {:?}", params.label, params.host, params.port, transport);

        let handshake = async {
            match transport {
                Transport::Dial { host, port } => {
                    client::connect(config, (host.as_str(), port), handler).await
                }
                Transport::Stream(stream) => client::connect_stream(config, stream, handler).await,
            }
        };

        let mut handle = tokio::time::timeout(params.connect_timeout, handshake)
            .await
            .map_err(|_| {
                SshError::Timeout(format!(
                    "Handshake with {} timed out after {:?}",
                    params.label, params.connect_timeout
                ))
            })??;

        debug!("SSH handshake completed with {}", params.label);

        authenticate(&mut handle, negotiator).await?;

        info!("Authenticated to {} as {}", params.label, negotiator.username());

        Ok(spawn_handle_owner_task(handle, params.label.clone())
            .with_agent_forwarding(forward_agent.is_some()))
    }
}

fn remaining(methods: &MethodSet) -> Vec<AuthMethodKind> {
    methods
        .iter()
        .filter_map(|m| {
            let name: &str = m.into();
            AuthMethodKind::from_name(name)
        })
        .collect()
}

/// Server verdict on one authentication request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    /// Methods the server still accepts
    Failure(Vec<AuthMethodKind>),
}

/// Server reply inside a keyboard-interactive exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KbiReply {
    Success,
    Failure(Vec<AuthMethodKind>),
    InfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<KbiPrompt>,
    },
}

/// The authentication requests `authenticate` sends to a server
#[async_trait]
pub trait AuthChannel: Send {
    async fn auth_none(&mut self, username: String) -> Result<AuthOutcome, SshError>;

    async fn auth_publickey(
        &mut self,
        username: String,
        key: Arc<PrivateKey>,
    ) -> Result<AuthOutcome, SshError>;

    /// Offer `key` and let `agent` sign the challenge
    async fn auth_agent_key(
        &mut self,
        agent: &mut SshAgentClient,
        username: &str,
        key: PublicKey,
    ) -> Result<AuthOutcome, SshError>;

    async fn auth_password(
        &mut self,
        username: String,
        password: String,
    ) -> Result<AuthOutcome, SshError>;

    async fn keyboard_interactive_start(&mut self, username: String)
        -> Result<KbiReply, SshError>;

    async fn keyboard_interactive_respond(
        &mut self,
        answers: Vec<String>,
    ) -> Result<KbiReply, SshError>;
}

fn outcome(result: AuthResult) -> AuthOutcome {
    match result {
        AuthResult::Success => AuthOutcome::Success,
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            if partial_success {
                info!("Partial success, more authentication required");
            }
            AuthOutcome::Failure(remaining(&remaining_methods))
        }
    }
}

fn kbi_reply(response: KeyboardInteractiveAuthResponse) -> KbiReply {
    match response {
        KeyboardInteractiveAuthResponse::Success => KbiReply::Success,
        KeyboardInteractiveAuthResponse::Failure {
            remaining_methods, ..
        } => KbiReply::Failure(remaining(&remaining_methods)),
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
        } => KbiReply::InfoRequest {
            name,
            instructions,
            prompts: prompts
                .into_iter()
                .map(|p| KbiPrompt {
                    prompt: p.prompt,
                    echo: p.echo,
                })
                .collect(),
        },
    }
}

#[async_trait]
impl AuthChannel for Handle<ClientHandler> {
    async fn auth_none(&mut self, username: String) -> Result<AuthOutcome, SshError> {
        let result = self.authenticate_none(username).await?;
        Ok(outcome(result))
    }

    async fn auth_publickey(
        &mut self,
        username: String,
        key: Arc<PrivateKey>,
    ) -> Result<AuthOutcome, SshError> {
        let hash_alg = self.best_supported_rsa_hash().await?.flatten();
        let result = self
            .authenticate_publickey(username, PrivateKeyWithHashAlg::new(key, hash_alg))
            .await?;
        Ok(outcome(result))
    }

    async fn auth_agent_key(
        &mut self,
        agent: &mut SshAgentClient,
        username: &str,
        key: PublicKey,
    ) -> Result<AuthOutcome, SshError> {
        let result = agent.authenticate_with_key(self, username, key).await?;
        Ok(outcome(result))
    }

    async fn auth_password(
        &mut self,
        username: String,
        password: String,
    ) -> Result<AuthOutcome, SshError> {
        let result = self.authenticate_password(username, password).await?;
        Ok(outcome(result))
    }

    async fn keyboard_interactive_start(
        &mut self,
        username: String,
    ) -> Result<KbiReply, SshError> {
        let response = self
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await?;
        Ok(kbi_reply(response))
    }

    async fn keyboard_interactive_respond(
        &mut self,
        answers: Vec<String>,
    ) -> Result<KbiReply, SshError> {
        let response = self.authenticate_keyboard_interactive_respond(answers).await?;
        Ok(kbi_reply(response))
    }
}

/// Drive the negotiator against the server until success or exhaustion
pub async fn authenticate<A: AuthChannel>(
    server: &mut A,
    negotiator: &mut AuthNegotiator,
) -> Result<(), SshError> {
    let mut methods_left: Option<Vec<AuthMethodKind>> = None;

    loop {
        let step = negotiator.next_step(methods_left.as_deref()).await;
        debug!("Auth step for {}: {:?}", negotiator.host(), step);

        let result = match step {
            AuthStep::None { username } => server.auth_none(username).await?,

            AuthStep::PublicKey { username, key } => server.auth_publickey(username, key).await?,

            AuthStep::AgentKey {
                username,
                public_key,
            } => {
                let Some(socket) = negotiator.agent_socket().map(|p| p.to_path_buf()) else {
                    debug!("No agent socket for agent-backed key; skipping");
                    continue;
                };
                let mut agent = match SshAgentClient::connect(&socket).await {
                    Ok(agent) => agent,
                    Err(e) => {
                        warn!("{}", e);
                        continue;
                    }
                };
                match server.auth_agent_key(&mut agent, &username, public_key).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("{}", e);
                        continue;
                    }
                }
            }

            AuthStep::Skip | AuthStep::Refuse => continue,

            AuthStep::Password { username, password } => {
                server.auth_password(username, password).await?
            }

            AuthStep::KeyboardInteractive { username } => {
                keyboard_interactive(server, negotiator, username).await?
            }

            AuthStep::Fail => {
                return Err(SshError::AuthenticationFailed(format!(
                    "All authentication methods exhausted for {}@{}",
                    negotiator.username(),
                    negotiator.host()
                )));
            }
        };

        match result {
            AuthOutcome::Success => return Ok(()),
            AuthOutcome::Failure(methods) => methods_left = Some(methods),
        }
    }
}

/// One keyboard-interactive exchange
async fn keyboard_interactive<A: AuthChannel>(
    server: &mut A,
    negotiator: &mut AuthNegotiator,
    username: String,
) -> Result<AuthOutcome, SshError> {
    let mut reply = server.keyboard_interactive_start(username).await?;

    loop {
        match reply {
            KbiReply::Success => return Ok(AuthOutcome::Success),
            KbiReply::Failure(methods) => return Ok(AuthOutcome::Failure(methods)),
            KbiReply::InfoRequest {
                name,
                instructions,
                prompts,
            } => {
                let answers = negotiator
                    .answer_keyboard_interactive(&name, &instructions, &prompts)
                    .await;
                reply = server.keyboard_interactive_respond(answers).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::identity::tests::{
        public_key, write_key, AGENT_ONLY_PUBLIC, ALICE_PRIVATE, ALICE_PUBLIC,
    };
    use crate::ssh::identity::IdentityKey;
    use crate::ssh::prompt::tests::ScriptedPrompt;
    use crate::ssh::prompt::PromptOutcome;

    /// Records every request and answers from a fixed policy
    #[derive(Default)]
    struct ScriptedServer {
        /// Methods advertised after a failed request
        methods: Vec<AuthMethodKind>,
        /// Fingerprints of the file keys offered, in order
        offered_keys: Vec<String>,
        agent_offers: usize,
        passwords: Vec<String>,
        kbi_starts: usize,
        kbi_answers: Vec<Vec<String>>,
        /// Accept the key with this fingerprint
        accept_key: Option<String>,
        accept_password: Option<String>,
        /// Prompts sent once per keyboard-interactive start
        kbi_prompts: Vec<KbiPrompt>,
    }

    impl ScriptedServer {
        fn failure(&self) -> AuthOutcome {
            AuthOutcome::Failure(self.methods.clone())
        }
    }

    #[async_trait]
    impl AuthChannel for ScriptedServer {
        async fn auth_none(&mut self, _username: String) -> Result<AuthOutcome, SshError> {
            Ok(self.failure())
        }

        async fn auth_publickey(
            &mut self,
            _username: String,
            key: Arc<PrivateKey>,
        ) -> Result<AuthOutcome, SshError> {
            let offered = fingerprint(key.public_key());
            self.offered_keys.push(offered.clone());
            if self.accept_key.as_deref() == Some(offered.as_str()) {
                Ok(AuthOutcome::Success)
            } else {
                Ok(self.failure())
            }
        }

        async fn auth_agent_key(
            &mut self,
            _agent: &mut SshAgentClient,
            _username: &str,
            _key: PublicKey,
        ) -> Result<AuthOutcome, SshError> {
            self.agent_offers += 1;
            Ok(self.failure())
        }

        async fn auth_password(
            &mut self,
            _username: String,
            password: String,
        ) -> Result<AuthOutcome, SshError> {
            let accepted = self.accept_password.as_deref() == Some(password.as_str());
            self.passwords.push(password);
            if accepted {
                Ok(AuthOutcome::Success)
            } else {
                Ok(self.failure())
            }
        }

        async fn keyboard_interactive_start(
            &mut self,
            _username: String,
        ) -> Result<KbiReply, SshError> {
            self.kbi_starts += 1;
            if self.kbi_prompts.is_empty() {
                return Ok(KbiReply::Failure(self.methods.clone()));
            }
            Ok(KbiReply::InfoRequest {
                name: String::new(),
                instructions: String::new(),
                prompts: self.kbi_prompts.clone(),
            })
        }

        async fn keyboard_interactive_respond(
            &mut self,
            answers: Vec<String>,
        ) -> Result<KbiReply, SshError> {
            self.kbi_answers.push(answers);
            Ok(KbiReply::Failure(self.methods.clone()))
        }
    }

    fn negotiator(keys: Vec<IdentityKey>, prompt: ScriptedPrompt) -> AuthNegotiator {
        AuthNegotiator::new("alice", "web", keys, Arc::new(prompt))
    }

    #[tokio::test]
    async fn test_unreachable_agent_falls_through_to_next_key() {
        let dir = tempfile::tempdir().unwrap();
        let alice = write_key(dir.path(), "alice", ALICE_PRIVATE, ALICE_PUBLIC);
        let agent_key = public_key(AGENT_ONLY_PUBLIC);
        let alice_public = public_key(ALICE_PUBLIC);
        let keys = vec![
            IdentityKey {
                label: "agent-only".into(),
                fingerprint: fingerprint(&agent_key),
                public_key: agent_key,
                agent_backed: true,
                source: None,
            },
            IdentityKey {
                label: "alice".into(),
                fingerprint: fingerprint(&alice_public),
                public_key: alice_public,
                agent_backed: false,
                source: Some(alice),
            },
        ];
        let mut negotiator = negotiator(keys, ScriptedPrompt::default())
            .with_agent_socket(Some(dir.path().join("no-agent.sock")));
        let mut server = ScriptedServer {
            methods: vec![AuthMethodKind::PublicKey],
            accept_key: Some(fingerprint(&public_key(ALICE_PUBLIC))),
            ..Default::default()
        };

        authenticate(&mut server, &mut negotiator).await.unwrap();
        assert_eq!(server.agent_offers, 0);
        assert_eq!(server.offered_keys, vec![fingerprint(&public_key(ALICE_PUBLIC))]);
    }

    #[tokio::test]
    async fn test_refused_password_is_not_sent() {
        let prompt = ScriptedPrompt::with_secrets(&[None, Some("s3cret")]);
        let mut negotiator = negotiator(vec![], prompt);
        let mut server = ScriptedServer {
            methods: vec![AuthMethodKind::Password],
            accept_password: Some("s3cret".into()),
            ..Default::default()
        };

        authenticate(&mut server, &mut negotiator).await.unwrap();
        assert_eq!(server.passwords, vec!["s3cret"]);
        assert_eq!(negotiator.password_retries(), 1);
    }

    #[tokio::test]
    async fn test_keyboard_interactive_rejected_at_start_ends_in_failure() {
        let mut negotiator = negotiator(vec![], ScriptedPrompt::default());
        let mut server = ScriptedServer {
            methods: vec![AuthMethodKind::KeyboardInteractive],
            ..Default::default()
        };

        let err = authenticate(&mut server, &mut negotiator).await.unwrap_err();
        assert!(matches!(err, SshError::AuthenticationFailed(_)));
        assert_eq!(server.kbi_starts, 3);
    }

    #[tokio::test]
    async fn test_keyboard_interactive_answers_each_round() {
        let prompt = ScriptedPrompt::default();
        for code in ["111", "222", "333"] {
            prompt.rounds.lock().push_back(PromptOutcome {
                responses: vec![code.into()],
                cancelled: false,
            });
        }
        let mut negotiator = negotiator(vec![], prompt);
        let mut server = ScriptedServer {
            methods: vec![AuthMethodKind::KeyboardInteractive],
            kbi_prompts: vec![KbiPrompt {
                prompt: "Code: ".into(),
                echo: true,
            }],
            ..Default::default()
        };

        assert!(authenticate(&mut server, &mut negotiator).await.is_err());
        assert_eq!(server.kbi_starts, 3);
        assert_eq!(
            server.kbi_answers,
            vec![vec!["111".to_string()], vec!["222".to_string()], vec!["333".to_string()]]
        );
    }
}
