//! Port Forwarding Module
//!
//! Loopback tunnels on top of an authenticated session:
//! - Direct: one forwarding channel per connection (TCP port or unix socket)
//! - Dynamic: SOCKS5 proxy whose requests become `direct-tcpip` channels
//! - SOCKS-routed: local listener carried through the SOCKS5 proxy

pub mod dynamic;
pub mod local;
pub mod manager;
pub mod socks_route;

pub use dynamic::{start_dynamic_forward, SocksServer};
pub use local::{
    bind_loopback, start_direct_forward, ConnectionHandler, DirectForward, ForwardHandle,
    ForwardStats, RemoteTarget,
};
pub use manager::{TunnelDescriptor, TunnelKind, TunnelManager};
pub use socks_route::{start_socks_route, SocksRoute};
