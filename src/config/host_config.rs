//! Host configuration snapshot
//!
//! A `HostConfig` is the already-computed result of an SSH config lookup for
//! one host: directive name → value(s). Pattern matching, `Include`
//! expansion and "first match wins" happen in the lookup, not here.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::ssh::destination::Destination;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Named pipe used by the OpenSSH for Windows agent service
pub const WINDOWS_AGENT_PIPE: &str = r"\\.\pipe\openssh-ssh-agent";

/// Canonical spelling of the directives this crate consumes
const CANONICAL_DIRECTIVES: &[(&str, &str)] = &[
    ("host", "Host"),
    ("hostname", "HostName"),
    ("user", "User"),
    ("port", "Port"),
    ("identityagent", "IdentityAgent"),
    ("identitiesonly", "IdentitiesOnly"),
    ("identityfile", "IdentityFile"),
    ("forwardagent", "ForwardAgent"),
    ("preferredauthentications", "PreferredAuthentications"),
    ("proxyjump", "ProxyJump"),
    ("proxycommand", "ProxyCommand"),
    ("include", "Include"),
];

/// Directives that accumulate every occurrence instead of keeping the first
const LIST_DIRECTIVES: &[&str] = &["IdentityFile"];

/// Host configuration lookup errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to run ssh config lookup for {host}: {reason}")]
    LookupFailed { host: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Map a directive name to its canonical spelling
pub fn normalize_directive(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    CANONICAL_DIRECTIVES
        .iter()
        .find(|(key, _)| *key == lower)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| name.to_string())
}

/// A directive value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostConfigValue {
    Single(String),
    List(Vec<String>),
}

impl HostConfigValue {
    /// First value (the effective one for single-valued directives)
    pub fn first(&self) -> Option<&str> {
        match self {
            HostConfigValue::Single(value) => Some(value),
            HostConfigValue::List(values) => values.first().map(String::as_str),
        }
    }

    pub fn values(&self) -> Vec<String> {
        match self {
            HostConfigValue::Single(value) => vec![value.clone()],
            HostConfigValue::List(values) => values.clone(),
        }
    }
}

/// Ordered directive → value mapping for one host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    entries: Vec<(String, HostConfigValue)>,
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a directive occurrence
    ///
    /// Single-valued directives keep their first value; `IdentityFile`
    /// accumulates every occurrence in order.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let key = normalize_directive(name);
        let value = value.into();
        let is_list = LIST_DIRECTIVES.contains(&key.as_str());

        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, HostConfigValue::List(values))) if is_list => values.push(value),
            Some(_) => {}
            None if is_list => self.entries.push((key, HostConfigValue::List(vec![value]))),
            None => self.entries.push((key, HostConfigValue::Single(value))),
        }
    }

    /// Builder-style insert, handy in tests and for programmatic configs
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&HostConfigValue> {
        let key = normalize_directive(name);
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
            .map(|(_, v)| v)
    }

    /// Effective single value of a directive
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(HostConfigValue::first)
    }

    /// Every value of a directive (empty when absent)
    pub fn values(&self, name: &str) -> Vec<String> {
        self.get(name).map(HostConfigValue::values).unwrap_or_default()
    }

    fn flag(&self, name: &str) -> bool {
        self.value(name)
            .map(|v| v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HostConfigValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Source of per-host configuration
#[async_trait]
pub trait HostConfigLookup: Send + Sync {
    async fn host_configuration(&self, host: &str) -> Result<HostConfig, ConfigError>;
}

/// Connection parameters for one hop, derived from a destination and its config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    /// Name used in prompts and logs (the destination as written)
    pub alias: String,
    /// Address actually dialed or forwarded to
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub identity_files: Vec<String>,
    pub identities_only: bool,
    pub forward_agent: bool,
    pub agent_socket: Option<PathBuf>,
    pub proxy_jump: Option<String>,
}

impl ResolvedHost {
    /// Resolve using the process environment for agent discovery
    pub fn resolve(destination: &Destination, config: &HostConfig) -> Self {
        Self::resolve_with_env(destination, config, |name| std::env::var(name).ok())
    }

    /// Resolve with an explicit environment accessor
    ///
    /// Precedence: the destination's own user/port beat the config, the
    /// config's `HostName` beats the destination alias.
    pub fn resolve_with_env<F>(destination: &Destination, config: &HostConfig, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let hostname = config
            .value("HostName")
            .map(str::to_string)
            .unwrap_or_else(|| destination.hostname.clone());

        let port = destination
            .port
            .or_else(|| config.value("Port").and_then(|p| p.parse().ok()))
            .unwrap_or(DEFAULT_SSH_PORT);

        let user = destination
            .user
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| config.value("User").map(str::to_string))
            .unwrap_or_else(whoami::username);

        Self {
            alias: destination.hostname.clone(),
            hostname,
            port,
            user,
            identity_files: config.values("IdentityFile"),
            identities_only: config.flag("IdentitiesOnly"),
            forward_agent: config.flag("ForwardAgent"),
            agent_socket: resolve_agent_socket(config.value("IdentityAgent"), &env),
            proxy_jump: config.value("ProxyJump").map(str::to_string),
        }
    }
}

/// Pick the agent socket from `IdentityAgent`, `SSH_AUTH_SOCK` or the platform default
fn resolve_agent_socket<F>(identity_agent: Option<&str>, env: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    match identity_agent.map(str::trim) {
        Some(value) if value.eq_ignore_ascii_case("none") => return None,
        Some(value) if !value.is_empty() && value != "SSH_AUTH_SOCK" => {
            let expanded = match value.strip_prefix('$') {
                Some(var) => env(var)?,
                None => value.to_string(),
            };
            return Some(expand_tilde(&expanded));
        }
        _ => {}
    }

    if let Some(sock) = env("SSH_AUTH_SOCK").filter(|s| !s.is_empty()) {
        return Some(PathBuf::from(sock));
    }

    if cfg!(windows) {
        Some(PathBuf::from(WINDOWS_AGENT_PIPE))
    } else {
        None
    }
}

/// Expand ~ to home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
