//! Connection orchestration
//!
//! Turns a remote authority into a live local endpoint:
//! authority → destination → host configuration → identities → proxy chain →
//! target session → remote bootstrap → tunnels. Everything acquired on the
//! way is tracked in a [`ResourceGroup`]; a failed attempt releases what it
//! acquired, a successful one hands the group to the [`Connection`].

pub mod authority;
pub mod bootstrap;
pub mod resources;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

use crate::config::{HostConfigLookup, ResolvedHost, ResolverSettings};
use crate::error::ResolveError;
use crate::forwarding::{TunnelDescriptor, TunnelManager};
use crate::ssh::{
    CredentialPrompt, Destination, IdentityResolver, ProxyChainBuilder, RemoteSession,
    SessionChain, SshConnector, Transport,
};

pub use authority::{format_authority, parse_authority, AUTHORITY_SCHEME};
pub use bootstrap::{
    parse_bootstrap_output, BootstrapOutcome, BootstrapRequest, RemoteBootstrap, ScriptBootstrap,
    DEFAULT_BOOTSTRAP_SCRIPT,
};
pub use resources::{Release, ResourceGroup, SessionResource, TunnelResource};

/// Local endpoint of a resolved remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAuthority {
    pub host: String,
    pub port: u16,
    pub connection_token: String,
}

/// A live resolution
pub struct Connection<S: RemoteSession + Clone> {
    pub authority: ResolvedAuthority,
    /// Environment values echoed back by the bootstrap
    pub env: BTreeMap<String, String>,
    pub tunnels: Arc<TunnelManager<S>>,
    /// Tunnel the authority points at
    pub primary_tunnel: TunnelDescriptor,
    pub socks_tunnel: Option<TunnelDescriptor>,
    /// Jump hosts followed by the target session
    pub chain: SessionChain<S>,
    resources: ResourceGroup,
}

impl<S: RemoteSession + Clone> Connection<S> {
    /// The target session
    pub fn session(&self) -> Option<&S> {
        self.chain.last()
    }

    /// Close the tunnels, then the session chain; safe to call repeatedly
    pub async fn dispose(&self) {
        if !self.resources.is_empty() {
            info!(
                "Disposing connection {}:{}",
                self.authority.host, self.authority.port
            );
        }
        self.resources.release_all().await;
    }
}

/// Resolves remote authorities into connections
pub struct Resolver<C: SshConnector> {
    connector: C,
    lookup: Arc<dyn HostConfigLookup>,
    identities: IdentityResolver,
    prompt: Arc<dyn CredentialPrompt>,
    bootstrap: Arc<dyn RemoteBootstrap>,
    settings: ResolverSettings,
}

impl<C> Resolver<C>
where
    C: SshConnector,
    C::Session: Clone,
{
    pub fn new(
        connector: C,
        lookup: Arc<dyn HostConfigLookup>,
        identities: IdentityResolver,
        prompt: Arc<dyn CredentialPrompt>,
        bootstrap: Arc<dyn RemoteBootstrap>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            connector,
            lookup,
            identities,
            prompt,
            bootstrap,
            settings,
        }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Run one resolution attempt
    ///
    /// Retrying is up to the caller; `attempt` is only logged.
    pub async fn resolve(
        &self,
        authority: &str,
        attempt: u32,
    ) -> Result<Connection<C::Session>, ResolveError> {
        info!(
            "Resolving ssh remote authority '{}' (attempt #{})",
            authority, attempt
        );

        let destination = parse_authority(authority)?;
        let resources = ResourceGroup::new();

        let result = self.establish(destination, &resources).await;
        match result {
            Ok(mut connection) => {
                connection.resources = resources;
                info!(
                    "Resolved {} to {}:{}",
                    authority, connection.authority.host, connection.authority.port
                );
                Ok(connection)
            }
            Err(e) => {
                error!("Error resolving authority {}: {}", authority, e);
                resources.release_all().await;
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        destination: Destination,
        resources: &ResourceGroup,
    ) -> Result<Connection<C::Session>, ResolveError> {
        let config = self.lookup.host_configuration(&destination.hostname).await?;
        let host = ResolvedHost::resolve(&destination, &config);
        info!(
            "Connecting to {}@{}:{} (agent forwarding: {})",
            host.user, host.hostname, host.port, host.forward_agent
        );

        let builder = ProxyChainBuilder::new(
            &self.connector,
            self.lookup.as_ref(),
            &self.identities,
            self.prompt.clone(),
            Duration::from_secs(self.settings.connect_timeout_secs),
        );

        // Target identities are gathered before any jump host is contacted
        let mut target = builder.hop_for(destination, host).await;

        let proxy = match target.host.proxy_jump.as_deref() {
            Some(proxy_jump) => builder.build(proxy_jump, &target.host).await?,
            None => None,
        };

        let (mut chain, transport) = match proxy {
            Some(proxy) => {
                if let Some(head) = proxy.chain.head() {
                    resources.push(Box::new(SessionResource {
                        label: format!("jump chain of {} hop(s)", proxy.chain.len()),
                        session: head.clone(),
                    }));
                }
                (proxy.chain, Transport::Stream(proxy.stream))
            }
            None => (SessionChain::new(), target.params.dial()),
        };

        let session = self
            .connector
            .connect(transport, &target.params, &mut target.negotiator)
            .await?;
        info!("Authenticated to {}", target.destination);
        if chain.is_empty() {
            resources.push(Box::new(SessionResource {
                label: target.params.label.clone(),
                session: session.clone(),
            }));
        }
        chain.push(session.clone());

        let request = BootstrapRequest::from_settings(&self.settings);
        let outcome = self.bootstrap.install(&session, &request).await?;
        if outcome.exit_code != 0 {
            return Err(ResolveError::Bootstrap(format!(
                "Couldn't install the server on {}, install script returned exit status {}",
                target.destination, outcome.exit_code
            )));
        }

        let tunnels = Arc::new(TunnelManager::new(session));

        let socks_tunnel = if self.settings.enable_dynamic_forwarding {
            let socks = tunnels.open_socks_tunnel(0).await?;
            resources.push(Box::new(TunnelResource {
                manager: tunnels.clone(),
                name: socks.name.clone(),
            }));
            Some(socks)
        } else {
            None
        };

        let primary_tunnel = tunnels.open_tunnel(0, outcome.listening_on.clone()).await?;
        resources.push(Box::new(TunnelResource {
            manager: tunnels.clone(),
            name: primary_tunnel.name.clone(),
        }));

        Ok(Connection {
            authority: ResolvedAuthority {
                host: "127.0.0.1".to_string(),
                port: primary_tunnel.local_port,
                connection_token: outcome.connection_token,
            },
            env: outcome.env,
            tunnels,
            primary_tunnel,
            socks_tunnel,
            chain,
            resources: ResourceGroup::new(),
        })
    }
}
