//! Transport layer abstraction.
//!
//! A [`MeshTransport`] delivers one request to a partner and returns its
//! response. A [`NameServer`] maps NetMeshBase identifiers to whatever a
//! transport needs to reach them. [`LocalNetwork`] does both in-process,
//! with fault injection for tests and embedded deployments.

use crate::error::{SyncError, SyncResult};
use crate::protocol::MeshMessage;
use async_trait::async_trait;
use meshbase_types::NetMeshBaseIdentifier;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Resolves once `rx` turns true or its sender is gone.
pub(crate) async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Sends requests to partner MeshBases.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Sends a request to `to` and waits for the response.
    async fn send_request(
        &self,
        to: &NetMeshBaseIdentifier,
        message: MeshMessage,
    ) -> SyncResult<MeshMessage>;
}

/// Answers requests arriving from partners.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: MeshMessage) -> MeshMessage;
}

/// Finds the endpoint serving a NetMeshBase.
pub trait NameServer: Send + Sync {
    type Handle: Clone + Send;

    /// Returns `None` if the identifier is unknown or its endpoint is gone.
    fn find_by_identifier(&self, identifier: &NetMeshBaseIdentifier) -> Option<Self::Handle>;
}

#[derive(Default)]
struct LocalNetworkInner {
    handlers: RwLock<HashMap<NetMeshBaseIdentifier, Weak<dyn MessageHandler>>>,
    unreachable: RwLock<HashSet<NetMeshBaseIdentifier>>,
    delays: RwLock<HashMap<NetMeshBaseIdentifier, Duration>>,
    delivered: AtomicU64,
}

/// In-process name server and transport.
///
/// Holds handlers weakly: dropping a MeshBase takes it off the network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<LocalNetworkInner>,
}

impl LocalNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `handler` reachable as `identifier`.
    pub fn register<H: MessageHandler + 'static>(
        &self,
        identifier: NetMeshBaseIdentifier,
        handler: &Arc<H>,
    ) {
        let handler: Arc<dyn MessageHandler> = handler.clone();
        let weak = Arc::downgrade(&handler);
        debug!("Registered {} on local network", identifier);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identifier, weak);
    }

    pub fn unregister(&self, identifier: &NetMeshBaseIdentifier) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identifier);
    }

    /// Drops every request to `identifier` with a network error.
    pub fn set_unreachable(&self, identifier: &NetMeshBaseIdentifier, unreachable: bool) {
        let mut set = self
            .inner
            .unreachable
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if unreachable {
            set.insert(identifier.clone());
        } else {
            set.remove(identifier);
        }
    }

    /// Delays every request to `identifier`. `None` removes the delay.
    pub fn set_delay(&self, identifier: &NetMeshBaseIdentifier, delay: Option<Duration>) {
        let mut delays = self
            .inner
            .delays
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match delay {
            Some(delay) => {
                delays.insert(identifier.clone(), delay);
            }
            None => {
                delays.remove(identifier);
            }
        }
    }

    /// Number of requests handed to a handler so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::SeqCst)
    }

    fn is_unreachable(&self, identifier: &NetMeshBaseIdentifier) -> bool {
        self.inner
            .unreachable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(identifier)
    }

    fn delay_for(&self, identifier: &NetMeshBaseIdentifier) -> Option<Duration> {
        self.inner
            .delays
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identifier)
            .copied()
    }
}

impl NameServer for LocalNetwork {
    type Handle = Arc<dyn MessageHandler>;

    fn find_by_identifier(&self, identifier: &NetMeshBaseIdentifier) -> Option<Self::Handle> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identifier)
            .and_then(Weak::upgrade)
    }
}

#[async_trait]
impl MeshTransport for LocalNetwork {
    async fn send_request(
        &self,
        to: &NetMeshBaseIdentifier,
        message: MeshMessage,
    ) -> SyncResult<MeshMessage> {
        if let Some(delay) = self.delay_for(to) {
            tokio::time::sleep(delay).await;
        }
        if self.is_unreachable(to) {
            return Err(SyncError::Network(format!("{to} is unreachable")));
        }
        let handler = self
            .find_by_identifier(to)
            .ok_or_else(|| SyncError::PeerNotFound(to.to_string()))?;
        self.inner.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(handler.handle_message(message).await)
    }
}
