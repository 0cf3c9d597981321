//! Keyed registry of proxies: at most one live proxy per partner.

use crate::config::NetMeshBaseConfig;
use crate::error::{SyncError, SyncResult};
use crate::proxy::{ExternalizedProxy, Proxy};
use crate::schedule::Clock;
use crate::transport::MeshTransport;
use meshbase_types::{CoherenceSpecification, NetMeshBaseIdentifier};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

/// Creates, hands out and discards the proxies of one NetMeshBase.
pub struct ProxyManager {
    owner: NetMeshBaseIdentifier,
    transport: Arc<dyn MeshTransport>,
    config: Arc<NetMeshBaseConfig>,
    clock: Clock,
    shutdown: watch::Receiver<bool>,
    proxies: RwLock<HashMap<NetMeshBaseIdentifier, Arc<Proxy>>>,
}

impl ProxyManager {
    pub(crate) fn new(
        owner: NetMeshBaseIdentifier,
        transport: Arc<dyn MeshTransport>,
        config: Arc<NetMeshBaseConfig>,
        clock: Clock,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            owner,
            transport,
            config,
            clock,
            shutdown,
            proxies: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the proxy to `partner`, creating it if needed. `coherence`
    /// only applies to a newly created proxy.
    pub async fn obtain_for(
        &self,
        partner: &NetMeshBaseIdentifier,
        coherence: CoherenceSpecification,
    ) -> SyncResult<Arc<Proxy>> {
        if *partner == self.owner {
            return Err(SyncError::Protocol(format!(
                "{partner} cannot be its own partner"
            )));
        }
        if let Some(proxy) = self.proxies.read().await.get(partner) {
            return Ok(Arc::clone(proxy));
        }

        let mut proxies = self.proxies.write().await;
        let proxy = proxies.entry(partner.clone()).or_insert_with(|| {
            Arc::new(Proxy::new(
                self.owner.clone(),
                partner.clone(),
                coherence,
                Arc::clone(&self.transport),
                Arc::clone(&self.config),
                self.clock,
                self.shutdown.clone(),
            ))
        });
        Ok(Arc::clone(proxy))
    }

    pub async fn get(&self, partner: &NetMeshBaseIdentifier) -> Option<Arc<Proxy>> {
        self.proxies.read().await.get(partner).cloned()
    }

    /// Snapshot of all live proxies, sorted by partner.
    pub async fn proxies(&self) -> Vec<Arc<Proxy>> {
        let mut proxies: Vec<_> = self.proxies.read().await.values().cloned().collect();
        proxies.sort_by(|a, b| a.partner().cmp(b.partner()));
        proxies
    }

    pub async fn len(&self) -> usize {
        self.proxies.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.proxies.read().await.is_empty()
    }

    /// Removes and kills the proxy to `partner`.
    pub async fn discard(&self, partner: &NetMeshBaseIdentifier) -> Option<Arc<Proxy>> {
        let proxy = self.proxies.write().await.remove(partner)?;
        proxy.die();
        info!("Discarded proxy {} -> {}", self.owner, partner);
        Some(proxy)
    }

    /// Discards every proxy whose channel failed too often in a row.
    pub async fn discard_failed(&self) -> Vec<NetMeshBaseIdentifier> {
        let limit = self.config.max_consecutive_failures;
        let mut proxies = self.proxies.write().await;
        let failed: Vec<_> = proxies
            .iter()
            .filter(|(_, proxy)| proxy.consecutive_failures() >= limit)
            .map(|(partner, _)| partner.clone())
            .collect();
        for partner in &failed {
            if let Some(proxy) = proxies.remove(partner) {
                warn!(
                    "Discarding proxy to {} after {} consecutive failures",
                    partner,
                    proxy.consecutive_failures()
                );
                proxy.die();
            }
        }
        failed
    }

    /// Returns whether the proxy existed and was quarantined.
    pub async fn release_quarantine(&self, partner: &NetMeshBaseIdentifier) -> bool {
        match self.get(partner).await {
            Some(proxy) => proxy.release_quarantine(),
            None => false,
        }
    }

    /// Reinstates a persisted proxy unless one is already live.
    pub async fn restore(&self, externalized: ExternalizedProxy) -> Arc<Proxy> {
        let mut proxies = self.proxies.write().await;
        let partner = externalized.partner.clone();
        let proxy = proxies.entry(partner).or_insert_with(|| {
            Arc::new(Proxy::restore(
                self.owner.clone(),
                externalized,
                Arc::clone(&self.transport),
                Arc::clone(&self.config),
                self.clock,
                self.shutdown.clone(),
            ))
        });
        Arc::clone(proxy)
    }

    /// Kills and forgets every proxy.
    pub async fn kill_all(&self) {
        let drained: Vec<_> = self.proxies.write().await.drain().collect();
        for (_, proxy) in drained {
            proxy.die();
        }
    }
}
