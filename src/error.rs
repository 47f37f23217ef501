//! Resolution error taxonomy
//!
//! Every failed resolution attempt surfaces as one [`ResolveError`], which
//! tells the caller whether retrying can help.

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::ssh::SshError;

/// Whether a failed remote can be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Availability {
    /// Retrying will not help (bad input, broken remote install)
    NotAvailable,
    /// The remote may become reachable (network, credentials)
    TemporarilyNotAvailable,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Invalid remote authority: {0}")]
    Parse(String),

    #[error("SSH configuration lookup failed: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication failed: {0}")]
    AuthExhausted(String),

    #[error("Remote server bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Connection failed: {0}")]
    Network(String),
}

impl ResolveError {
    pub fn availability(&self) -> Availability {
        match self {
            ResolveError::Parse(_) | ResolveError::Bootstrap(_) => Availability::NotAvailable,
            ResolveError::Config(_) | ResolveError::AuthExhausted(_) | ResolveError::Network(_) => {
                Availability::TemporarilyNotAvailable
            }
        }
    }
}

impl From<SshError> for ResolveError {
    fn from(err: SshError) -> Self {
        if err.is_auth_failure() {
            ResolveError::AuthExhausted(err.to_string())
        } else {
            ResolveError::Network(err.to_string())
        }
    }
}
