//! Settings file loading
//!
//! The resolver reads `settings.json` from `~/.ssh-remote` (macOS/Linux) or
//! `%APPDATA%\ssh-remote` (Windows). The file is optional; a present file
//! must parse and pass validation.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use super::settings::{ResolverSettings, SETTINGS_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Settings version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Directory holding the settings file
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("ssh-remote"));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".ssh-remote"))
        .ok_or(StorageError::NoConfigDir)
}

pub fn settings_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("settings.json"))
}

/// Location of the resolver settings
pub struct SettingsStorage {
    path: PathBuf,
}

impl SettingsStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: settings_file()?,
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the settings; a missing file yields the defaults
    pub async fn load(&self) -> Result<ResolverSettings, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", self.path.display());
                return Ok(ResolverSettings::default());
            }
            Err(source) => {
                return Err(StorageError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let settings: ResolverSettings =
            serde_json::from_str(&contents).map_err(|source| StorageError::Json {
                path: self.path.clone(),
                source,
            })?;
        validate(&settings)?;
        Ok(settings)
    }
}

/// Reject settings a resolution attempt could not work with
pub fn validate(settings: &ResolverSettings) -> Result<(), StorageError> {
    if settings.version > SETTINGS_VERSION {
        return Err(StorageError::VersionTooNew {
            found: settings.version,
            supported: SETTINGS_VERSION,
        });
    }
    if settings.connect_timeout_secs == 0 {
        return Err(StorageError::Invalid {
            field: "connectTimeoutSecs",
            reason: "must be at least 1".to_string(),
        });
    }
    if settings.server_download_url_template.trim().is_empty() {
        return Err(StorageError::Invalid {
            field: "serverDownloadUrlTemplate",
            reason: "must not be empty".to_string(),
        });
    }
    if let Some(name) = settings
        .server_env_vars
        .iter()
        .find(|name| !is_env_name(name))
    {
        return Err(StorageError::Invalid {
            field: "serverEnvVars",
            reason: format!("{:?} is not an environment variable name", name),
        });
    }
    Ok(())
}

/// `[A-Za-z_][A-Za-z0-9_]*`; the names end up in a remote shell script
fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
