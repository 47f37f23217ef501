//! Configuration Module
//!
//! Host configuration consumption (computed `ssh -G` output) and the
//! persisted resolver settings.

pub mod host_config;
pub mod native;
pub mod settings;
pub mod storage;

pub use host_config::{
    expand_tilde, normalize_directive, ConfigError, HostConfig, HostConfigLookup,
    HostConfigValue, ResolvedHost, DEFAULT_SSH_PORT,
};
pub use native::{parse_ssh_g_output, NativeSshConfig};
pub use settings::{ResolverSettings, DEFAULT_DOWNLOAD_URL_TEMPLATE, SETTINGS_VERSION};
pub use storage::{config_dir, settings_file, validate, SettingsStorage, StorageError};
