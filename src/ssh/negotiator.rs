//! Authentication negotiation
//!
//! One [`AuthNegotiator`] per hop decides what to send in each
//! authentication round, given the methods the server still accepts. It owns
//! the hop's key queue and retry budgets; the russh driver in
//! [`crate::ssh::client`] applies the chosen steps to the session.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use russh::keys::ssh_key;
use russh::keys::{PrivateKey, PublicKey};
use tracing::{debug, info, warn};

use crate::ssh::identity::IdentityKey;
use crate::ssh::prompt::{CredentialPrompt, KbiPrompt};

/// Password prompts per hop
pub const PASSWORD_RETRY_COUNT: u32 = 3;
/// Keyboard-interactive rounds per hop
pub const KEYBOARD_INTERACTIVE_RETRY_COUNT: u32 = 3;
/// Passphrase attempts per encrypted key
pub const PASSPHRASE_RETRY_COUNT: u32 = 3;

/// Authentication methods a server can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethodKind {
    None,
    PublicKey,
    Password,
    KeyboardInteractive,
    HostBased,
}

impl AuthMethodKind {
    /// Parse a method name as sent on the wire
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "publickey" => Some(Self::PublicKey),
            "password" => Some(Self::Password),
            "keyboard-interactive" => Some(Self::KeyboardInteractive),
            "hostbased" => Some(Self::HostBased),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::PublicKey => "publickey",
            Self::Password => "password",
            Self::KeyboardInteractive => "keyboard-interactive",
            Self::HostBased => "hostbased",
        }
    }
}

/// What to send in the next authentication round
pub enum AuthStep {
    /// Try the `none` method to learn the allowed methods
    None { username: String },
    PublicKey {
        username: String,
        key: Arc<PrivateKey>,
    },
    /// Let the agent sign for exactly this key
    AgentKey {
        username: String,
        public_key: PublicKey,
    },
    /// Key unusable; ask again without a server round trip
    Skip,
    Password { username: String, password: String },
    /// Password prompt declined; ask again without a server round trip
    Refuse,
    KeyboardInteractive { username: String },
    /// Every method is exhausted for this hop
    Fail,
}

impl AuthStep {
    pub fn method(&self) -> &'static str {
        match self {
            AuthStep::None { .. } => "none",
            AuthStep::PublicKey { .. } | AuthStep::AgentKey { .. } => "publickey",
            AuthStep::Password { .. } => "password",
            AuthStep::KeyboardInteractive { .. } => "keyboard-interactive",
            AuthStep::Skip | AuthStep::Refuse => "retry",
            AuthStep::Fail => "fail",
        }
    }
}

impl std::fmt::Debug for AuthStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStep::None { username } => write!(f, "None({})", username),
            AuthStep::PublicKey { username, key } => {
                write!(f, "PublicKey({}, {})", username, key.algorithm().as_str())
            }
            AuthStep::AgentKey {
                username,
                public_key,
            } => write!(f, "AgentKey({}, {})", username, public_key.comment()),
            AuthStep::Skip => write!(f, "Skip"),
            AuthStep::Password { username, .. } => write!(f, "Password({}, ***)", username),
            AuthStep::Refuse => write!(f, "Refuse"),
            AuthStep::KeyboardInteractive { username } => {
                write!(f, "KeyboardInteractive({})", username)
            }
            AuthStep::Fail => write!(f, "Fail"),
        }
    }
}

/// Per-hop authentication state machine
pub struct AuthNegotiator {
    username: String,
    host: String,
    keys: VecDeque<IdentityKey>,
    password_retries: u32,
    keyboard_interactive_retries: u32,
    prompt: Arc<dyn CredentialPrompt>,
    agent_socket: Option<PathBuf>,
}

impl AuthNegotiator {
    pub fn new(
        username: impl Into<String>,
        host: impl Into<String>,
        keys: Vec<IdentityKey>,
        prompt: Arc<dyn CredentialPrompt>,
    ) -> Self {
        Self {
            username: username.into(),
            host: host.into(),
            keys: keys.into(),
            password_retries: PASSWORD_RETRY_COUNT,
            keyboard_interactive_retries: KEYBOARD_INTERACTIVE_RETRY_COUNT,
            prompt,
            agent_socket: None,
        }
    }

    /// Agent used to sign for agent-backed keys
    pub fn with_agent_socket(mut self, socket: Option<PathBuf>) -> Self {
        self.agent_socket = socket;
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn agent_socket(&self) -> Option<&std::path::Path> {
        self.agent_socket.as_deref()
    }

    pub fn remaining_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn password_retries(&self) -> u32 {
        self.password_retries
    }

    pub fn keyboard_interactive_retries(&self) -> u32 {
        self.keyboard_interactive_retries
    }

    /// Decide the next round
    ///
    /// `methods_left` is `None` before the first round, afterwards the
    /// methods the server still accepts.
    pub async fn next_step(&mut self, methods_left: Option<&[AuthMethodKind]>) -> AuthStep {
        let Some(methods) = methods_left else {
            return AuthStep::None {
                username: self.username.clone(),
            };
        };

        if methods.contains(&AuthMethodKind::PublicKey) {
            if let Some(identity) = self.keys.pop_front() {
                return self.public_key_step(identity).await;
            }
        }

        if methods.contains(&AuthMethodKind::Password) && self.password_retries > 0 {
            let title = format!("Enter password for {}@{}", self.username, self.host);
            let answer = self.prompt.prompt_secret(&title).await;
            self.password_retries -= 1;
            return match answer {
                Some(password) if !password.is_empty() => AuthStep::Password {
                    username: self.username.clone(),
                    password,
                },
                _ => {
                    debug!("Password prompt declined for {}@{}", self.username, self.host);
                    AuthStep::Refuse
                }
            };
        }

        if methods.contains(&AuthMethodKind::KeyboardInteractive)
            && self.keyboard_interactive_retries > 0
        {
            // One round per start, whether or not the server sends prompts
            self.keyboard_interactive_retries -= 1;
            return AuthStep::KeyboardInteractive {
                username: self.username.clone(),
            };
        }

        warn!(
            "All authentication methods exhausted for {}@{}",
            self.username, self.host
        );
        AuthStep::Fail
    }

    async fn public_key_step(&mut self, identity: IdentityKey) -> AuthStep {
        if identity.agent_backed {
            debug!("Offering agent key {} ({})", identity.label, identity.fingerprint);
            return AuthStep::AgentKey {
                username: self.username.clone(),
                public_key: identity.public_key,
            };
        }

        let Some(path) = identity.source else {
            return AuthStep::Skip;
        };

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                debug!("Identity {:?} no longer readable: {}", path, e);
                return AuthStep::Skip;
            }
        };

        let key = if needs_passphrase(&text) {
            self.decrypt_with_prompt(&text, &path).await
        } else {
            match russh::keys::decode_secret_key(&text, None) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("Failed to parse private key {:?}: {}", path, e);
                    None
                }
            }
        };

        match key {
            Some(key) => {
                debug!("Offering key {:?} ({})", path, identity.fingerprint);
                AuthStep::PublicKey {
                    username: self.username.clone(),
                    key: Arc::new(key),
                }
            }
            None => AuthStep::Skip,
        }
    }

    async fn decrypt_with_prompt(&self, text: &str, path: &std::path::Path) -> Option<PrivateKey> {
        let title = format!("Enter passphrase for {}", path.display());
        for attempt in 1..=PASSPHRASE_RETRY_COUNT {
            let passphrase = match self.prompt.prompt_secret(&title).await {
                Some(p) if !p.is_empty() => p,
                _ => {
                    debug!("Passphrase prompt declined for {:?}", path);
                    return None;
                }
            };

            match russh::keys::decode_secret_key(text, Some(&passphrase)) {
                Ok(key) => return Some(key),
                Err(e) => {
                    debug!(
                        "Passphrase attempt {}/{} for {:?} failed: {}",
                        attempt, PASSPHRASE_RETRY_COUNT, path, e
                    );
                }
            }
        }
        info!("Giving up on encrypted key {:?}", path);
        None
    }

    /// Answer one keyboard-interactive info request
    ///
    /// Cancelling any prompt ends keyboard-interactive for this hop; only the
    /// responses collected so far are submitted. The round itself was
    /// already counted when it started.
    pub async fn answer_keyboard_interactive(
        &mut self,
        name: &str,
        instructions: &str,
        prompts: &[KbiPrompt],
    ) -> Vec<String> {
        if prompts.is_empty() {
            return Vec::new();
        }

        let title = [name, instructions]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        let title = if title.is_empty() {
            format!("Authentication for {}@{}", self.username, self.host)
        } else {
            title
        };

        let outcome = self.prompt.prompt_multiple(&title, prompts).await;
        if outcome.cancelled {
            debug!("Keyboard-interactive cancelled for {}@{}", self.username, self.host);
            self.keyboard_interactive_retries = 0;
        }
        outcome.responses
    }
}

/// Whether the key text is passphrase-protected
fn needs_passphrase(text: &str) -> bool {
    match ssh_key::PrivateKey::from_openssh(text) {
        Ok(key) => key.is_encrypted(),
        Err(_) => text.contains("ENCRYPTED"),
    }
}
