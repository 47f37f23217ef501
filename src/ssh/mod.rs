//! SSH module - handles SSH connections and authentication
//!
//! This module provides the core SSH functionality using russh library.
//!
//! # Features
//! - Destination parsing (`[user@]host[:port]`)
//! - Identity discovery and ranking against the SSH agent
//! - Multi-method authentication (publickey, agent, password, keyboard-interactive)
//! - ProxyJump chains with SSH-over-SSH
//! - Agent forwarding

pub mod agent;
pub mod client;
pub mod destination;
mod error;
pub mod handle_owner;
pub mod identity;
pub mod negotiator;
pub mod prompt;
pub mod proxy;
pub mod session;

pub use agent::{AgentIdentities, SshAgentClient, SystemAgent};
pub use client::{authenticate, AuthChannel, AuthOutcome, ClientHandler, KbiReply, RusshConnector};
pub use destination::{parse_proxy_jump, Destination};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use identity::{fingerprint, IdentityKey, IdentityResolver, DEFAULT_IDENTITY_FILES};
pub use negotiator::{AuthMethodKind, AuthNegotiator, AuthStep};
pub use prompt::{CredentialPrompt, FailureChoice, KbiPrompt, PromptOutcome, TerminalPrompt};
pub use proxy::{ProxyChainBuilder, ProxyConnection, ProxyHop, SessionChain};
pub use session::{
    ExecOutput, ForwardStream, ForwardStreamIo, RemoteSession, SessionParams, SshConnector,
    Transport,
};
