//! Host configuration lookup backed by the system `ssh -G`
//!
//! `ssh -G <host>` prints the fully computed configuration for a host
//! (Host/Match blocks, Include files and system config already applied), one
//! `key value` pair per line with lowercase keys.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::host_config::{ConfigError, HostConfig, HostConfigLookup};

/// Lookup that shells out to the OpenSSH client
#[derive(Debug, Clone)]
pub struct NativeSshConfig {
    /// ssh executable
    program: String,
    /// Optional user config file passed via `-F`
    config_file: Option<PathBuf>,
}

impl NativeSshConfig {
    pub fn new() -> Self {
        Self {
            program: "ssh".to_string(),
            config_file: None,
        }
    }

    /// Use a specific user config file instead of ~/.ssh/config
    ///
    /// Note that `-F` also stops ssh from reading the system-wide config.
    pub fn with_config_file(mut self, path: Option<PathBuf>) -> Self {
        self.config_file = path;
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

impl Default for NativeSshConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `ssh -G` output into a `HostConfig`
pub fn parse_ssh_g_output(output: &str) -> HostConfig {
    let mut config = HostConfig::new();
    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        if let Some((key, value)) = line.split_once(' ') {
            if key.is_empty() {
                continue;
            }
            config.insert(key, value);
        }
    }
    config
}

#[async_trait]
impl HostConfigLookup for NativeSshConfig {
    async fn host_configuration(&self, host: &str) -> Result<HostConfig, ConfigError> {
        let mut command = Command::new(&self.program);
        if let Some(path) = &self.config_file {
            command.arg("-F").arg(path);
        }
        command.arg("-G").arg(host);

        debug!("Computing ssh configuration for {}", host);

        let output = command.output().await.map_err(|e| ConfigError::LookupFailed {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("ssh -G {} exited with {}: {}", host, output.status, stderr.trim());
            return Err(ConfigError::LookupFailed {
                host: host.to_string(),
                reason: stderr.trim().to_string(),
            });
        }

        Ok(parse_ssh_g_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "user alice\n\
hostname 192.168.1.10\n\
port 2222\n\
identityfile ~/.ssh/id_rsa\n\
identityfile ~/.ssh/id_ed25519\n\
forwardagent yes\n\
proxyjump bob@jump1,carol@jump2\n\
serveraliveinterval 0\n";

    #[test]
    fn test_parse_ssh_g_output() {
        let config = parse_ssh_g_output(SAMPLE);
        assert_eq!(config.value("User"), Some("alice"));
        assert_eq!(config.value("HostName"), Some("192.168.1.10"));
        assert_eq!(config.value("Port"), Some("2222"));
        assert_eq!(
            config.values("IdentityFile"),
            vec!["~/.ssh/id_rsa", "~/.ssh/id_ed25519"]
        );
        assert_eq!(config.value("ProxyJump"), Some("bob@jump1,carol@jump2"));
        assert_eq!(config.value("serveraliveinterval"), Some("0"));
    }

    #[test]
    fn test_parse_ignores_malformed_lines() {
        let config = parse_ssh_g_output("\nnovalue\n hostname x\r\nport 22\r\n");
        assert_eq!(config.value("Port"), Some("22"));
        assert!(config.get("novalue").is_none());
    }

    #[tokio::test]
    async fn test_missing_program_is_lookup_error() {
        let lookup = NativeSshConfig::new().with_program("/nonexistent/ssh-binary");
        match lookup.host_configuration("example.com").await {
            Err(ConfigError::LookupFailed { host, .. }) => assert_eq!(host, "example.com"),
            other => panic!("Unexpected result: {:?}", other),
        }
    }
}
