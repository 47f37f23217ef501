//! Resources acquired while resolving, released newest first

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::forwarding::TunnelManager;
use crate::ssh::RemoteSession;

/// Something that must be torn down when the connection goes away
#[async_trait]
pub trait Release: Send + Sync {
    fn describe(&self) -> String;

    async fn release(&self);
}

/// Ordered set of resources; each is released exactly once
#[derive(Default)]
pub struct ResourceGroup {
    resources: Mutex<Vec<Box<dyn Release>>>,
}

impl ResourceGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, resource: Box<dyn Release>) {
        debug!("Acquired {}", resource.describe());
        self.resources.lock().push(resource);
    }

    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.lock().is_empty()
    }

    /// Release everything in reverse acquisition order
    pub async fn release_all(&self) {
        loop {
            // The lock must not be held across the await
            let next = self.resources.lock().pop();
            let Some(resource) = next else { break };
            debug!("Releasing {}", resource.describe());
            resource.release().await;
        }
    }
}

/// A named tunnel of a [`TunnelManager`]
pub struct TunnelResource<S: RemoteSession + Clone> {
    pub manager: Arc<TunnelManager<S>>,
    pub name: String,
}

#[async_trait]
impl<S: RemoteSession + Clone> Release for TunnelResource<S> {
    fn describe(&self) -> String {
        format!("tunnel {}", self.name)
    }

    async fn release(&self) {
        self.manager.close_tunnel(&self.name).await;
    }
}

/// The session that dialed the real socket
pub struct SessionResource<S: RemoteSession> {
    pub label: String,
    pub session: S,
}

#[async_trait]
impl<S: RemoteSession> Release for SessionResource<S> {
    fn describe(&self) -> String {
        format!("session {}", self.label)
    }

    async fn release(&self) {
        self.session.close().await;
    }
}
