//! ssh-remote command line entry point

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use ssh_remote::config::{
    ConfigError, HostConfigLookup, NativeSshConfig, ResolvedHost, SettingsStorage, StorageError,
};
use ssh_remote::forwarding::TunnelDescriptor;
use ssh_remote::logging::init_logging;
use ssh_remote::resolver::{parse_authority, ScriptBootstrap};
use ssh_remote::ssh::{
    CredentialPrompt, FailureChoice, IdentityResolver, RusshConnector, SystemAgent,
    TerminalPrompt,
};
use ssh_remote::{Availability, ResolveError, ResolvedAuthority, Resolver};

/// Resolve SSH remotes into local tunneled endpoints
#[derive(Debug, Parser)]
#[command(name = "ssh-remote", version, about)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect, bootstrap the remote server and keep the tunnels open until Ctrl-C
    Resolve {
        /// Authority such as ssh-remote+alice@devbox:22
        authority: String,

        /// Settings file (default: <config dir>/settings.json)
        #[arg(long = "settings", value_name = "FILE")]
        settings: Option<PathBuf>,

        /// Give up after this many attempts
        #[arg(long = "max-attempts", default_value = "3")]
        max_attempts: u32,
    },

    /// Print the configuration ssh computes for a host
    HostConfig {
        host: String,

        /// ssh config file passed to `ssh -F`
        #[arg(short = 'F', long = "config-file", value_name = "FILE")]
        config_file: Option<PathBuf>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to encode output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to wait for Ctrl-C: {0}")]
    Signal(std::io::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveOutput<'a> {
    authority: &'a ResolvedAuthority,
    env: &'a std::collections::BTreeMap<String, String>,
    tunnels: Vec<TunnelDescriptor>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    });

    let result = match cli.command {
        Command::Resolve {
            authority,
            settings,
            max_attempts,
        } => resolve(&authority, settings, max_attempts.max(1)).await,
        Command::HostConfig { host, config_file } => host_config(&host, config_file).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn resolve(
    authority: &str,
    settings_path: Option<PathBuf>,
    max_attempts: u32,
) -> Result<(), CliError> {
    let storage = match settings_path {
        Some(path) => SettingsStorage::with_path(path),
        None => SettingsStorage::new()?,
    };
    let settings = storage.load().await?;
    info!("Loaded settings from {}", storage.path().display());

    let lookup = Arc::new(NativeSshConfig::new().with_config_file(settings.ssh_config_file.clone()));
    let identities = IdentityResolver::new(Arc::new(SystemAgent));
    let prompt: Arc<dyn CredentialPrompt> = Arc::new(TerminalPrompt);
    let bootstrap = Arc::new(ScriptBootstrap::with_command(settings.bootstrap_command.clone()));
    let resolver = Resolver::new(
        RusshConnector,
        lookup,
        identities,
        prompt.clone(),
        bootstrap,
        settings,
    );

    let mut attempt = 1;
    let connection = loop {
        match resolver.resolve(authority, attempt).await {
            Ok(connection) => break connection,
            Err(e) => {
                if attempt == 1 {
                    // Only the initial connection asks; later attempts follow the classification
                    let message = format!("Could not establish connection to \"{}\": {}", authority, e);
                    if matches!(prompt.failure_choice(&message).await, FailureChoice::Close) {
                        return Err(e.into());
                    }
                } else if e.availability() == Availability::NotAvailable {
                    return Err(e.into());
                }

                if attempt >= max_attempts {
                    return Err(e.into());
                }
                attempt += 1;
                warn!("Retrying ({}/{})", attempt, max_attempts);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    };

    let output = ResolveOutput {
        authority: &connection.authority,
        env: &connection.env,
        tunnels: connection.tunnels.list().await,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    info!("Tunnels are open, press Ctrl-C to disconnect");
    let waited = tokio::signal::ctrl_c().await;
    connection.dispose().await;
    waited.map_err(CliError::Signal)
}

async fn host_config(host: &str, config_file: Option<PathBuf>) -> Result<(), CliError> {
    let lookup = NativeSshConfig::new().with_config_file(config_file);

    // Accept either a bare host or a full authority
    let destination = match parse_authority(host) {
        Ok(destination) => destination,
        Err(_) => ssh_remote::ssh::Destination::parse(host),
    };

    let config = lookup.host_configuration(&destination.hostname).await?;
    for (name, value) in config.iter() {
        for v in value.values() {
            println!("{} {}", name, v);
        }
    }

    let resolved = ResolvedHost::resolve(&destination, &config);
    info!(
        "{} resolves to {}@{}:{} (identities only: {}, forward agent: {}, agent: {:?}, proxy jump: {:?})",
        destination,
        resolved.user,
        resolved.hostname,
        resolved.port,
        resolved.identities_only,
        resolved.forward_agent,
        resolved.agent_socket,
        resolved.proxy_jump
    );
    Ok(())
}
