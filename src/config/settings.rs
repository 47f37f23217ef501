//! Resolver settings
//!
//! Persisted as camelCase JSON. Every field has a default so a partial (or
//! missing) settings file still yields a usable configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Current settings schema version
pub const SETTINGS_VERSION: u32 = 1;

/// Default remote server download location
pub const DEFAULT_DOWNLOAD_URL_TEMPLATE: &str = "https://github.com/VSCodium/vscodium/releases/download/${version}/vscodium-reh-linux-${arch}-${version}.tar.gz";

/// Settings consumed by one resolution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverSettings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Stand up a SOCKS5 dynamic tunnel and route TCP tunnels through it
    #[serde(default = "default_true")]
    pub enable_dynamic_forwarding: bool,

    /// Template handed to the remote bootstrap
    #[serde(default = "default_download_url_template")]
    pub server_download_url_template: String,

    /// Extensions the remote bootstrap installs
    #[serde(default)]
    pub default_extensions: Vec<String>,

    /// Ask the remote server to listen on a unix socket instead of a TCP port
    #[serde(default)]
    pub remote_server_listen_on_socket: bool,

    /// User ssh config file (None = ~/.ssh/config)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_config_file: Option<PathBuf>,

    /// Handshake timeout for every hop
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Remote command run by the script bootstrap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_command: Option<String>,

    /// Environment variable names the bootstrap reports back
    #[serde(default)]
    pub server_env_vars: Vec<String>,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_true() -> bool {
    true
}

fn default_download_url_template() -> String {
    DEFAULT_DOWNLOAD_URL_TEMPLATE.to_string()
}

fn default_connect_timeout() -> u64 {
    90
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            enable_dynamic_forwarding: true,
            server_download_url_template: default_download_url_template(),
            default_extensions: Vec::new(),
            remote_server_listen_on_socket: false,
            ssh_config_file: None,
            connect_timeout_secs: default_connect_timeout(),
            bootstrap_command: None,
            server_env_vars: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_use_defaults() {
        let settings: ResolverSettings =
            serde_json::from_str(r#"{"enableDynamicForwarding": false, "defaultExtensions": ["a.b"]}"#)
                .unwrap();
        assert!(!settings.enable_dynamic_forwarding);
        assert_eq!(settings.default_extensions, vec!["a.b"]);
        assert_eq!(settings.connect_timeout_secs, 90);
        assert_eq!(settings.server_download_url_template, DEFAULT_DOWNLOAD_URL_TEMPLATE);
        assert!(!settings.remote_server_listen_on_socket);
    }

    #[test]
    fn test_empty_object_equals_default() {
        let settings: ResolverSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, ResolverSettings::default());
    }
}
