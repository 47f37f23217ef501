//! ssh-remote - SSH connection, ProxyJump and tunneling core
//!
//! Resolves `ssh-remote+[user@]host[:port]` authorities into a local
//! endpoint tunneled to a freshly bootstrapped remote server.

pub mod config;
pub mod error;
pub mod forwarding;
pub mod logging;
pub mod resolver;
pub mod ssh;

pub use error::{Availability, ResolveError};
pub use resolver::{Connection, ResolvedAuthority, Resolver};
