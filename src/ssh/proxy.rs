//! ProxyJump Implementation for SSH
//!
//! Implements SSH connection through jump hosts (bastion hosts).
//! Supports unlimited multi-hop proxy with SSH-over-SSH.
//!
//! # Algorithm
//!
//! Multi-hop connection uses `direct-tcpip` channels to establish SSH-over-SSH tunnels:
//! ```text
//! Client --SSH--> [Jump1] --direct-tcpip--> [Jump2] --direct-tcpip--> ... --> [JumpN] --direct-tcpip--> [Target]
//! ```
//!
//! Only the first hop dials a real socket. Every hop is configured from its
//! own host configuration, identities and negotiator, and each forward goes
//! to the *resolved* host/port of the next hop (or of the target).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::destination::{parse_proxy_jump, Destination};
use super::identity::IdentityResolver;
use super::negotiator::AuthNegotiator;
use super::prompt::CredentialPrompt;
use super::session::{ForwardStream, RemoteSession, SessionParams, SshConnector, Transport};
use crate::config::{HostConfigLookup, ResolvedHost};
use crate::error::ResolveError;

/// One fully configured hop, ready to connect
pub struct ProxyHop {
    pub destination: Destination,
    pub host: ResolvedHost,
    pub params: SessionParams,
    pub negotiator: AuthNegotiator,
}

/// Live sessions of a chain, outermost first
///
/// Only the head dialed a real socket; closing it tears down every session
/// forwarded through it.
pub struct SessionChain<S: RemoteSession> {
    sessions: Vec<S>,
}

impl<S: RemoteSession> SessionChain<S> {
    pub fn new() -> Self {
        Self {
            sessions: Vec::new(),
        }
    }

    pub fn push(&mut self, session: S) {
        self.sessions.push(session);
    }

    pub fn head(&self) -> Option<&S> {
        self.sessions.first()
    }

    /// Innermost session (the target once the chain is complete)
    pub fn last(&self) -> Option<&S> {
        self.sessions.last()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close the head session
    pub async fn close(&self) {
        if let Some(head) = self.head() {
            head.close().await;
        }
    }
}

impl<S: RemoteSession> Default for SessionChain<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Established jump hosts plus the stream reaching the target
pub struct ProxyConnection<S: RemoteSession> {
    pub chain: SessionChain<S>,
    pub stream: ForwardStream,
}

/// Builds hops from destinations and connects them left to right
pub struct ProxyChainBuilder<'a, C: SshConnector> {
    connector: &'a C,
    lookup: &'a dyn HostConfigLookup,
    identities: &'a IdentityResolver,
    prompt: Arc<dyn CredentialPrompt>,
    connect_timeout: Duration,
}

impl<'a, C: SshConnector> ProxyChainBuilder<'a, C> {
    pub fn new(
        connector: &'a C,
        lookup: &'a dyn HostConfigLookup,
        identities: &'a IdentityResolver,
        prompt: Arc<dyn CredentialPrompt>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            lookup,
            identities,
            prompt,
            connect_timeout,
        }
    }

    /// Resolve one destination into a connectable hop
    pub async fn prepare_hop(&self, destination: Destination) -> Result<ProxyHop, ResolveError> {
        let config = self.lookup.host_configuration(&destination.hostname).await?;
        let host = ResolvedHost::resolve(&destination, &config);
        Ok(self.hop_for(destination, host).await)
    }

    /// Configure a hop whose host is already resolved
    pub async fn hop_for(&self, destination: Destination, host: ResolvedHost) -> ProxyHop {
        let keys = self.identities.resolve(&host).await;
        debug!(
            "Hop {} -> {}@{}:{} with {} identities",
            destination,
            host.user,
            host.hostname,
            host.port,
            keys.len()
        );

        let negotiator = AuthNegotiator::new(&host.user, &host.alias, keys, self.prompt.clone())
            .with_agent_socket(host.agent_socket.clone());
        let params = SessionParams::for_host(&host, self.connect_timeout);

        ProxyHop {
            destination,
            host,
            params,
            negotiator,
        }
    }

    /// Connect every `ProxyJump` hop and open a stream to the target
    ///
    /// Returns `None` when the value names no hops.
    pub async fn build(
        &self,
        proxy_jump: &str,
        target: &ResolvedHost,
    ) -> Result<Option<ProxyConnection<C::Session>>, ResolveError> {
        let destinations = parse_proxy_jump(proxy_jump);
        if destinations.is_empty() {
            return Ok(None);
        }

        let mut hops = Vec::with_capacity(destinations.len());
        for destination in destinations {
            hops.push(self.prepare_hop(destination).await?);
        }

        info!(
            "Connecting to {} through {} jump host(s)",
            target.alias,
            hops.len()
        );

        let mut chain = SessionChain::new();
        match self.connect_hops(hops, target, &mut chain).await {
            Ok(stream) => Ok(Some(ProxyConnection { chain, stream })),
            Err(e) => {
                warn!("Proxy chain to {} failed: {}", target.alias, e);
                chain.close().await;
                Err(e)
            }
        }
    }

    async fn connect_hops(
        &self,
        hops: Vec<ProxyHop>,
        target: &ResolvedHost,
        chain: &mut SessionChain<C::Session>,
    ) -> Result<ForwardStream, ResolveError> {
        // Forward destination of hop i is hop i+1, the last hop forwards to the target
        let next_addrs: Vec<(String, u16)> = hops
            .iter()
            .skip(1)
            .map(|hop| (hop.host.hostname.clone(), hop.host.port))
            .chain(std::iter::once((target.hostname.clone(), target.port)))
            .collect();

        let mut incoming: Option<ForwardStream> = None;
        for (mut hop, (next_host, next_port)) in hops.into_iter().zip(next_addrs) {
            let transport = match incoming.take() {
                None => hop.params.dial(),
                Some(stream) => Transport::Stream(stream),
            };

            let session = self
                .connector
                .connect(transport, &hop.params, &mut hop.negotiator)
                .await?;
            info!("Jump host {} authenticated", hop.destination);

            let stream = session.open_direct_tcpip(&next_host, next_port).await;
            chain.push(session);
            incoming = Some(stream?);
            debug!("Forwarding through {} to {}:{}", hop.destination, next_host, next_port);
        }

        incoming.ok_or_else(|| ResolveError::Network("Empty proxy chain".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::host_config::tests::StaticLookup;
    use crate::config::HostConfig;
    use crate::ssh::identity::tests::FakeAgent;
    use crate::ssh::prompt::tests::ScriptedPrompt;
    use crate::ssh::session::tests::{MockConnector, SessionEvent};
    use tokio::io::AsyncReadExt;

    struct Fixture {
        connector: MockConnector,
        lookup: StaticLookup,
        identities: IdentityResolver,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(lookup: StaticLookup) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let identities = IdentityResolver::new(Arc::new(FakeAgent {
                keys: vec![],
                fail: false,
            }))
            .with_ssh_dir(dir.path().to_path_buf());
            Self {
                connector: MockConnector::default(),
                lookup,
                identities,
                _dir: dir,
            }
        }

        fn builder(&self) -> ProxyChainBuilder<'_, MockConnector> {
            ProxyChainBuilder::new(
                &self.connector,
                &self.lookup,
                &self.identities,
                Arc::new(ScriptedPrompt::default()),
                Duration::from_secs(5),
            )
        }
    }

    fn target(hostname: &str, port: u16) -> ResolvedHost {
        ResolvedHost::resolve(
            &Destination::parse(&format!("deploy@{}:{}", hostname, port)),
            &HostConfig::new(),
        )
    }

    async fn read_line(stream: &mut ForwardStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while stream.read_exact(&mut byte).await.is_ok() && byte[0] != b'\n' {
            line.push(byte[0]);
        }
        String::from_utf8(line).unwrap()
    }

    #[test]
    fn test_empty_session_chain() {
        let chain: SessionChain<Arc<crate::ssh::session::tests::MockSession>> = SessionChain::new();
        assert!(chain.is_empty());
        assert!(chain.head().is_none());
    }

    #[tokio::test]
    async fn test_no_hops() {
        let fixture = Fixture::new(StaticLookup::default());
        let result = fixture.builder().build("none", &target("web", 22)).await.unwrap();
        assert!(result.is_none());
        assert!(fixture.connector.connections().is_empty());
    }

    #[tokio::test]
    async fn test_two_hops_forward_to_resolved_addresses() {
        let lookup = StaticLookup::default()
            .with_host("jump1", HostConfig::new().with("HostName", "10.0.0.1"))
            .with_host(
                "jump2",
                HostConfig::new().with("HostName", "10.0.0.2").with("Port", "2200"),
            );
        let fixture = Fixture::new(lookup);

        let mut connection = fixture
            .builder()
            .build("jump1,jump2", &target("10.0.0.9", 2222))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            fixture.connector.connections(),
            vec!["jump1@dial:10.0.0.1:22", "jump2@stream:10.0.0.2:2200"]
        );
        let jump1 = fixture.connector.session("jump1").unwrap();
        let jump2 = fixture.connector.session("jump2").unwrap();
        assert_eq!(
            jump1.events(),
            vec![SessionEvent::DirectTcpip("10.0.0.2".into(), 2200)]
        );
        assert_eq!(
            jump2.events(),
            vec![SessionEvent::DirectTcpip("10.0.0.9".into(), 2222)]
        );
        assert_eq!(read_line(&mut connection.stream).await, "10.0.0.9:2222");

        assert_eq!(connection.chain.len(), 2);
        connection.chain.close().await;
        assert!(jump1.is_closed());
        assert!(!jump2.is_closed());
    }

    #[tokio::test]
    async fn test_three_hops_with_users_and_ports() {
        let lookup = StaticLookup::default().with_host("b", HostConfig::new().with("Port", "2022"));
        let fixture = Fixture::new(lookup);

        let mut connection = fixture
            .builder()
            .build("alice@a:2201, b ,carol@c", &target("target", 22))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            fixture.connector.connections(),
            vec!["a@dial:a:2201", "b@stream:b:2022", "c@stream:c:22"]
        );
        assert_eq!(read_line(&mut connection.stream).await, "target:22");
        assert_eq!(connection.chain.len(), 3);
        assert_eq!(connection.chain.last().unwrap().label, "c");
    }

    #[tokio::test]
    async fn test_failed_hop_closes_head() {
        let fixture = Fixture::new(StaticLookup::default());
        fixture.connector.reject.lock().push("jump2".to_string());

        let result = fixture.builder().build("jump1,jump2", &target("web", 22)).await;
        assert!(matches!(result, Err(ResolveError::AuthExhausted(_))));
        let jump1 = fixture.connector.session("jump1").unwrap();
        assert!(jump1.is_closed());
    }

    #[tokio::test]
    async fn test_prepare_hop_uses_hop_config() {
        let lookup = StaticLookup::default().with_host(
            "bastion",
            HostConfig::new().with("HostName", "203.0.113.7").with("User", "ops"),
        );
        let fixture = Fixture::new(lookup);

        let hop = fixture
            .builder()
            .prepare_hop(Destination::parse("bastion"))
            .await
            .unwrap();
        assert_eq!(hop.params.host, "203.0.113.7");
        assert_eq!(hop.params.port, 22);
        assert_eq!(hop.negotiator.username(), "ops");
        assert_eq!(hop.negotiator.host(), "bastion");
    }

    #[tokio::test]
    async fn test_lookup_failure_aborts_before_dialing() {
        let lookup = StaticLookup {
            failing: vec!["jump2".to_string()],
            ..Default::default()
        };
        let fixture = Fixture::new(lookup);

        let result = fixture.builder().build("jump1,jump2", &target("web", 22)).await;
        assert!(matches!(result, Err(ResolveError::Config(_))));
        assert!(fixture.connector.connections().is_empty());
    }

    #[tokio::test]
    async fn test_refused_forward_is_network_error() {
        let fixture = Fixture::new(StaticLookup::default());
        fixture.connector.refuse_channels.lock().push("jump1".to_string());

        let result = fixture.builder().build("jump1", &target("web", 22)).await;
        assert!(matches!(result, Err(ResolveError::Network(_))));
        let jump1 = fixture.connector.session("jump1").unwrap();
        assert!(jump1.is_closed());
    }
}
