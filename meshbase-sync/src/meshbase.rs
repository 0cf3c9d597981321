//! A MeshBase that replicates with partners over Xpriso.
//!
//! [`NetMeshBase`] ties the local [`ObjectStore`] to one [`Proxy`] per
//! partner. It resolves access paths (relaying through the first hop),
//! pushes committed changes to every partner replicating the touched
//! objects, and answers the partners' requests.

use crate::config::NetMeshBaseConfig;
use crate::error::{AccessError, SyncError, SyncResult};
use crate::protocol::{ErrorMessage, FailedPath, MeshMessage, XprisoMessage, PROTOCOL_VERSION};
use crate::proxy::{InboundDecision, Proxy};
use crate::proxy_store::ProxyStore;
use crate::registry::ProxyManager;
use crate::schedule::{Clock, RefreshState};
use crate::transport::{stop_requested, MeshTransport, MessageHandler};
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use meshbase_store::{ApplyOutcome, ChangeSet, MeshObject, ObjectStore, StoreError, Transaction};
use meshbase_types::{
    MeshObjectIdentifier, NetMeshBaseAccessSpecification, NetMeshBaseIdentifier,
    NetMeshObjectAccessSpecification, ScopeSpecification,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A NetMeshBase: local store, proxies and the resolution entry point.
pub struct NetMeshBase {
    identifier: NetMeshBaseIdentifier,
    store: ObjectStore,
    proxies: ProxyManager,
    config: Arc<NetMeshBaseConfig>,
    clock: Clock,
    /// Held while a transaction is committed and its pushes are queued.
    push_order: Mutex<()>,
    shutdown: watch::Sender<bool>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl NetMeshBase {
    /// Creates a MeshBase holding only its home object.
    #[must_use]
    pub fn new(
        identifier: NetMeshBaseIdentifier,
        transport: Arc<dyn MeshTransport>,
        config: NetMeshBaseConfig,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let clock = Clock::new();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let proxies = ProxyManager::new(
            identifier.clone(),
            transport,
            Arc::clone(&config),
            clock,
            shutdown_rx,
        );
        info!("Created NetMeshBase {}", identifier);
        Arc::new(Self {
            store: ObjectStore::new(identifier.clone()),
            identifier,
            proxies,
            config,
            clock,
            push_order: Mutex::new(()),
            shutdown,
            refresh_task: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn identifier(&self) -> &NetMeshBaseIdentifier {
        &self.identifier
    }

    #[must_use]
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    #[must_use]
    pub fn proxy_manager(&self) -> &ProxyManager {
        &self.proxies
    }

    #[must_use]
    pub fn config(&self) -> &NetMeshBaseConfig {
        &self.config
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // ── Resolution ───────────────────────────────────────────────

    /// Resolves `path` to a local object or replica.
    ///
    /// An empty path is a plain local lookup. Otherwise the first hop is
    /// asked to resolve the rest of the path on our behalf. A cached
    /// replica is returned without I/O while its coherence considers it
    /// fresh, and refreshed first once it is due.
    pub fn access_locally<'a>(
        &'a self,
        path: &'a NetMeshObjectAccessSpecification,
    ) -> BoxFuture<'a, Result<MeshObject, AccessError>> {
        self.resolve(path).boxed()
    }

    /// Resolves several paths concurrently.
    pub async fn access_locally_many(
        &self,
        paths: &[NetMeshObjectAccessSpecification],
    ) -> Vec<Result<MeshObject, AccessError>> {
        join_all(paths.iter().map(|path| self.access_locally(path))).await
    }

    async fn resolve(
        &self,
        path: &NetMeshObjectAccessSpecification,
    ) -> Result<MeshObject, AccessError> {
        let Some(first) = path.first_hop() else {
            return self.resolve_here(path);
        };
        if *first.identifier() == self.identifier {
            return self.access_locally(&path.remainder()).await;
        }
        let target = path
            .object_identifier()
            .unwrap_or_else(|| first.identifier().home_object());

        if let Some(cached) = self.cached(&target, first).await? {
            return Ok(cached);
        }

        let coherence = first
            .coherence()
            .unwrap_or_else(|| self.config.default_coherence());
        let proxy = self
            .proxies
            .obtain_for(first.identifier(), coherence)
            .await
            .map_err(|e| AccessError::at_hop(first, e))?;

        let remainder = path.remainder();
        let outcome = match proxy
            .obtain_replicas(&self.store, std::slice::from_ref(&remainder), first.coherence())
            .await
        {
            Ok(outcome) => outcome,
            Err(cause) => {
                self.note_failure(&proxy).await;
                return Err(AccessError::at_hop(first, cause));
            }
        };

        if let Some(failed) = outcome.failed.into_iter().find(|f| f.path == remainder) {
            if failed.code == ErrorMessage::RELAY_UNSUPPORTED {
                info!(
                    "{} does not relay, resolving {} directly",
                    first.identifier(),
                    remainder
                );
                return self.access_locally(&remainder).await;
            }
            let (failed_hops, cause) = if failed.failed_hops.is_empty() {
                let cause = SyncError::Peer {
                    code: failed.code,
                    message: failed.reason,
                };
                (vec![first.clone()], cause)
            } else {
                let cause = SyncError::RelayFailed {
                    via: first.identifier().to_string(),
                    reason: failed.reason,
                };
                (failed.failed_hops, cause)
            };
            return Err(AccessError::new(outcome.objects, failed_hops, cause));
        }

        outcome
            .objects
            .into_iter()
            .find(|object| object.id == target)
            .or_else(|| self.store.get(&target))
            .ok_or_else(|| {
                AccessError::at_hop(
                    first,
                    SyncError::Protocol(format!("{} did not convey {target}", first.identifier())),
                )
            })
    }

    fn resolve_here(
        &self,
        path: &NetMeshObjectAccessSpecification,
    ) -> Result<MeshObject, AccessError> {
        let id = path
            .object_identifier()
            .unwrap_or_else(|| self.identifier.home_object());
        self.store.get(&id).ok_or_else(|| {
            AccessError::new(
                Vec::new(),
                Vec::new(),
                SyncError::Store(StoreError::NotFound(id.to_string())),
            )
        })
    }

    /// A usable local copy of `target`, refreshed first if due.
    async fn cached(
        &self,
        target: &MeshObjectIdentifier,
        first: &NetMeshBaseAccessSpecification,
    ) -> Result<Option<MeshObject>, AccessError> {
        let Some(object) = self.store.get(target) else {
            return Ok(None);
        };
        let Some(home) = object.proxy_towards_home.clone() else {
            return Ok(Some(object));
        };
        let Some(proxy) = self.proxies.get(&home).await else {
            return Ok(None);
        };
        match proxy.refresh_state(&object.id) {
            None => Ok(None),
            Some(RefreshState::Fresh | RefreshState::Terminal) => Ok(Some(object)),
            Some(RefreshState::Due)
                if proxy
                    .replica(&object.id)
                    .is_some_and(|entry| entry.lock.allows_local_writes()) =>
            {
                Ok(Some(object))
            }
            Some(RefreshState::Due) => {
                debug!("Replica {} is due, refreshing from {}", object.id, home);
                match proxy
                    .resynchronize(&self.store, std::slice::from_ref(&object.id))
                    .await
                {
                    Ok(outcome) if outcome.canceled.contains(&object.id) => Ok(None),
                    Ok(_) => Ok(self.store.get(&object.id)),
                    Err(cause) => {
                        self.note_failure(&proxy).await;
                        Err(AccessError::new(vec![object], vec![first.clone()], cause))
                    }
                }
            }
        }
    }

    // ── Transactions ─────────────────────────────────────────────

    /// Opens a transaction, waiting for the current one to finish.
    pub async fn begin_transaction(&self) -> Transaction {
        self.store.begin_transaction().await
    }

    /// Opens a transaction, failing if one is already open.
    pub fn try_begin_transaction(&self) -> SyncResult<Transaction> {
        Ok(self.store.try_begin_transaction()?)
    }

    /// Commits `tx` and pushes its changes to every partner replicating
    /// a touched object. Push failures are logged, not returned.
    pub async fn commit(&self, tx: Transaction) -> SyncResult<ChangeSet> {
        self.commit_and_push(tx, None).await
    }

    async fn commit_and_push(
        &self,
        tx: Transaction,
        exclude: Option<&NetMeshBaseIdentifier>,
    ) -> SyncResult<ChangeSet> {
        let proxies = self.proxies.proxies().await;
        let (change_set, pending) = {
            let _order = self.push_order.lock().unwrap_or_else(PoisonError::into_inner);
            let change_set = self.store.commit_transaction(tx)?;
            let mut pending = Vec::new();
            if !change_set.is_empty() {
                for proxy in &proxies {
                    if Some(proxy.partner()) == exclude {
                        continue;
                    }
                    match proxy.send_changes(&change_set) {
                        Ok(Some(reply)) => pending.push((Arc::clone(proxy), reply)),
                        Ok(None) => {}
                        Err(e) => warn!(
                            "Not pushing transaction {} to {}: {}",
                            change_set.transaction_seq,
                            proxy.partner(),
                            e
                        ),
                    }
                }
            }
            (change_set, pending)
        };

        let results = join_all(
            pending
                .into_iter()
                .map(|(proxy, reply)| async move { (proxy, reply.wait().await) }),
        )
        .await;
        for (proxy, result) in results {
            if let Err(e) = result {
                warn!(
                    "Pushing transaction {} to {} failed: {}",
                    change_set.transaction_seq,
                    proxy.partner(),
                    e
                );
                self.note_failure(&proxy).await;
            }
        }
        Ok(change_set)
    }

    // ── Locks and replicas ───────────────────────────────────────

    /// Obtains the write locks of `ids` from wherever they are held.
    /// Returns the objects whose lock is held here afterwards.
    pub async fn try_to_obtain_locks(
        &self,
        ids: &[MeshObjectIdentifier],
        timeout: Duration,
    ) -> SyncResult<Vec<MeshObjectIdentifier>> {
        let (mut obtained, by_holder) = self.group_by_lock_holder(ids)?;
        for (holder, group) in by_holder {
            let proxy = self
                .proxies
                .obtain_for(&holder, self.config.default_coherence())
                .await?;
            match proxy.try_to_obtain_locks(&self.store, &group, timeout).await {
                Ok(got) => obtained.extend(got),
                Err(e) => {
                    self.note_failure(&proxy).await;
                    return Err(e);
                }
            }
        }
        Ok(obtained)
    }

    /// Takes the write locks of `ids` without waiting for their holders.
    pub async fn force_obtain_locks(&self, ids: &[MeshObjectIdentifier]) -> SyncResult<()> {
        let (_, by_holder) = self.group_by_lock_holder(ids)?;
        for (holder, group) in by_holder {
            let proxy = self
                .proxies
                .obtain_for(&holder, self.config.default_coherence())
                .await?;
            proxy.force_obtain_locks(&self.store, &group).await?;
        }
        Ok(())
    }

    /// Drops replicas and tells the partners they came from.
    pub async fn cancel_replicas(&self, ids: &[MeshObjectIdentifier]) -> SyncResult<()> {
        let mut by_home: BTreeMap<NetMeshBaseIdentifier, Vec<MeshObjectIdentifier>> =
            BTreeMap::new();
        for id in ids {
            let object = self
                .store
                .get(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if let Some(home) = object.proxy_towards_home {
                by_home.entry(home).or_default().push(object.id);
            }
        }
        for (home, group) in by_home {
            if let Some(proxy) = self.proxies.get(&home).await {
                proxy.cancel_replicas(&self.store, &group).await?;
            }
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn group_by_lock_holder(
        &self,
        ids: &[MeshObjectIdentifier],
    ) -> SyncResult<(
        Vec<MeshObjectIdentifier>,
        BTreeMap<NetMeshBaseIdentifier, Vec<MeshObjectIdentifier>>,
    )> {
        let mut held = Vec::new();
        let mut by_holder: BTreeMap<_, Vec<_>> = BTreeMap::new();
        for id in ids {
            let object = self
                .store
                .get(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            match object.proxy_towards_lock {
                None => held.push(object.id),
                Some(holder) => by_holder.entry(holder).or_default().push(object.id),
            }
        }
        Ok((held, by_holder))
    }

    // ── Background refresh ───────────────────────────────────────

    /// Starts the task that refreshes due replicas and reclaims stale
    /// locks every `refresh_tick_ms`. Stopped by [`NetMeshBase::shutdown`].
    pub fn start_background_refresh(self: &Arc<Self>) {
        let mut task = self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let meshbase = Arc::downgrade(self);
        let mut stop = self.shutdown.subscribe();
        let tick = self.config.refresh_tick().max(Duration::from_millis(1));
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    () = stop_requested(&mut stop) => break,
                }
                let Some(meshbase) = meshbase.upgrade() else {
                    break;
                };
                meshbase.refresh_due_replicas().await;
            }
            debug!("Background refresh stopped");
        }));
    }

    /// One refresh sweep over all proxies. Returns the number of replicas
    /// checked.
    pub async fn refresh_due_replicas(&self) -> usize {
        let now = self.clock.now_ms();
        let mut checked = 0;
        for proxy in self.proxies.proxies().await {
            if proxy.quarantine_reason().is_some() {
                continue;
            }
            if let Some(delay) = self.config.lock_reclaim_delay_ms {
                let stale = proxy.locks_due_for_reclaim(now, delay);
                if !stale.is_empty() {
                    if let Err(e) = proxy.force_obtain_locks(&self.store, &stale).await {
                        warn!("Reclaiming locks from {} failed: {}", proxy.partner(), e);
                    }
                }
            }
            let due = proxy.due_replicas(now);
            if due.is_empty() {
                continue;
            }
            match proxy.resynchronize(&self.store, &due).await {
                Ok(outcome) => checked += outcome.changed.len() + outcome.unchanged.len(),
                Err(e) => warn!(
                    "Refreshing {} replicas from {} failed: {}",
                    due.len(),
                    proxy.partner(),
                    e
                ),
            }
        }
        self.proxies.discard_failed().await;
        checked
    }

    /// Stops background refresh, fails in-flight requests and kills every
    /// proxy. Further requests from partners are refused.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.proxies.kill_all().await;
        info!("NetMeshBase {} shut down", self.identifier);
    }

    // ── Persistence ──────────────────────────────────────────────

    /// Writes every proxy to `store`. Returns how many were saved.
    pub async fn save_proxies(&self, store: &ProxyStore) -> SyncResult<usize> {
        let proxies = self.proxies.proxies().await;
        for proxy in &proxies {
            store.save(&proxy.to_externalized())?;
        }
        debug!("Saved {} proxies of {}", proxies.len(), self.identifier);
        Ok(proxies.len())
    }

    /// Reinstates the proxies saved in `store`.
    pub async fn restore_proxies(&self, store: &ProxyStore) -> SyncResult<usize> {
        let saved = store.load_all()?;
        let count = saved.len();
        for externalized in saved {
            self.proxies.restore(externalized).await;
        }
        info!("Restored {} proxies of {}", count, self.identifier);
        Ok(count)
    }

    pub async fn release_quarantine(&self, partner: &NetMeshBaseIdentifier) -> bool {
        self.proxies.release_quarantine(partner).await
    }

    async fn note_failure(&self, proxy: &Proxy) {
        if proxy.consecutive_failures() >= self.config.max_consecutive_failures {
            warn!(
                "Proxy to {} failed {} times in a row",
                proxy.partner(),
                proxy.consecutive_failures()
            );
            self.proxies.discard(proxy.partner()).await;
        }
    }

    // ── Responder side ───────────────────────────────────────────

    async fn handle_xpriso(&self, request: XprisoMessage) -> MeshMessage {
        if request.version != PROTOCOL_VERSION {
            return MeshMessage::Error(ErrorMessage::version_mismatch(
                PROTOCOL_VERSION,
                request.version,
            ));
        }
        if request.receiver != self.identifier {
            return MeshMessage::Error(ErrorMessage::internal(format!(
                "message for {} delivered to {}",
                request.receiver, self.identifier
            )));
        }
        if self.is_shut_down() {
            return MeshMessage::Error(ErrorMessage::internal(format!(
                "{} is shutting down",
                self.identifier
            )));
        }
        let proxy = match self
            .proxies
            .obtain_for(&request.sender, self.config.default_coherence())
            .await
        {
            Ok(proxy) => proxy,
            Err(e) => return MeshMessage::Error(ErrorMessage::internal(e.to_string())),
        };
        if let Some(reason) = proxy.quarantine_reason() {
            return MeshMessage::Error(ErrorMessage::quarantined(reason));
        }

        let mut inbound = proxy.inbound().await;
        match inbound.check(request.session, request.request_id) {
            InboundDecision::Fresh => {}
            InboundDecision::Replay(response) => {
                debug!(
                    "Replaying response to request {} from {}",
                    request.request_id, request.sender
                );
                return response;
            }
            InboundDecision::Stale { last } => {
                warn!(
                    "Discarding request {} from {}: already at {}",
                    request.request_id, request.sender, last
                );
                return MeshMessage::Error(ErrorMessage::duplicate(request.request_id, last));
            }
        }

        let response = match self.process(&proxy, &request).await {
            Ok(reply) => MeshMessage::Xpriso(reply),
            Err(SyncError::ProtocolViolation { reason, .. }) => {
                MeshMessage::Error(ErrorMessage::protocol_violation(reason))
            }
            Err(e) => MeshMessage::Error(ErrorMessage::internal(e.to_string())),
        };
        inbound.remember(request.request_id, response.clone());
        drop(inbound);
        proxy.touch_updated();

        if request.cease_communications {
            info!("{} ceased communications", request.sender);
            self.proxies.discard(&request.sender).await;
        }
        response
    }

    /// Answers one fresh request. Everything that may talk to other
    /// MeshBases happens first; all store changes then happen in one
    /// transaction.
    async fn process(&self, proxy: &Proxy, request: &XprisoMessage) -> SyncResult<XprisoMessage> {
        let sender = &request.sender;
        let mut reply = request.reply();

        for path in &request.requested_first_time {
            self.serve_first_time(proxy, path, &mut reply).await;
        }
        self.obtain_upstream_locks(sender, &request.requested_locks)
            .await;

        let mut tx = self.store.begin_transaction().await;
        for id in &request.lock_acknowledgements {
            proxy
                .accept_lock_acknowledgement(id)
                .map_err(|e| proxy.violation(format!("lock on {id}: {e}")))?;
            if tx.get(id).is_some() {
                tx.set_lock_holder(id, Some(sender.clone()))?;
            }
            info!("Lock on {} passed to {}", id, sender);
        }
        for id in &request.reclaimed_locks {
            if tx.get(id).is_some() {
                tx.set_lock_holder(id, Some(sender.clone()))?;
            }
            proxy.lock_reclaimed_by_partner(id);
            warn!("{} reclaimed the lock on {}", sender, id);
        }
        if let Some(change_set) = &request.change_set {
            // Only the partner through which the lock is reached may change
            // an object this MeshBase already has.
            for change in &change_set.changes {
                let lock_via_sender = tx
                    .get(&change.object)
                    .is_none_or(|object| object.proxy_towards_lock.as_ref() == Some(sender));
                if !lock_via_sender {
                    return Err(proxy.violation(format!(
                        "change to {} without holding its lock",
                        change.object
                    )));
                }
            }
            let outcomes = self.store.apply_change_set(&mut tx, change_set)?;
            let applied = outcomes
                .iter()
                .filter(|outcome| **outcome == ApplyOutcome::Applied)
                .count();
            debug!(
                "Applied {} of {} changes from {}",
                applied,
                outcomes.len(),
                sender
            );
        }
        for id in &request.requested_canceled {
            proxy.forget_served(id);
            if tx
                .get(id)
                .is_some_and(|object| object.proxy_towards_lock.as_ref() == Some(sender))
            {
                tx.set_lock_holder(id, None)?;
            }
        }
        for id in &request.requested_resynchronize {
            match tx.get(id) {
                Some(object) => {
                    proxy.record_served(&object);
                    reply.resynchronized.push(object.to_conveyed());
                }
                None => {
                    proxy.forget_served(id);
                    reply.requested_canceled.push(id.clone());
                }
            }
        }
        for id in &request.requested_locks {
            let Some(object) = tx.get(id) else {
                continue;
            };
            if !object.has_lock() {
                debug!("Cannot pass the lock on {} to {}: not held here", id, sender);
                continue;
            }
            proxy
                .propose_lock_release(&object)
                .map_err(|e| SyncError::Protocol(format!("lock on {id}: {e}")))?;
            reply.pushed_locks.push(object.id.clone());
            reply.conveyed.push(object.to_conveyed());
        }

        self.commit_and_push(tx, Some(sender)).await?;
        Ok(reply)
    }

    async fn serve_first_time(
        &self,
        proxy: &Proxy,
        path: &NetMeshObjectAccessSpecification,
        reply: &mut XprisoMessage,
    ) {
        if !path.is_local() && !self.config.relay_enabled {
            reply.failed_paths.push(FailedPath {
                path: path.clone(),
                failed_hops: Vec::new(),
                code: ErrorMessage::RELAY_UNSUPPORTED,
                reason: ErrorMessage::relay_unsupported(&self.identifier).message,
            });
            return;
        }
        match self.access_locally(path).await {
            Ok(object) => {
                let neighbors = path
                    .scope()
                    .map(|scope| self.neighbors_within(&object, scope))
                    .unwrap_or_default();
                for object in std::iter::once(object).chain(neighbors) {
                    proxy.record_served(&object);
                    reply.conveyed.push(object.to_conveyed());
                }
            }
            Err(error) => {
                let mut partial = error.partial;
                // What this hop alone resolved: its own home object.
                if !path.is_local() {
                    if let Some(home) = self.store.home_object() {
                        partial.insert(0, home);
                    }
                }
                for object in &partial {
                    proxy.record_served(object);
                    reply.conveyed.push(object.to_conveyed());
                }
                let code = if path.is_local() {
                    ErrorMessage::UNKNOWN_OBJECT
                } else {
                    ErrorMessage::ACCESS_FAILED
                };
                debug!("Could not resolve {} for {}: {}", path, proxy.partner(), error.cause);
                reply.failed_paths.push(FailedPath {
                    path: path.clone(),
                    failed_hops: error.failed,
                    code,
                    reason: error.cause.to_string(),
                });
            }
        }
    }

    /// Objects held here within `scope` relationship steps of `root`,
    /// nearest first.
    fn neighbors_within(&self, root: &MeshObject, scope: ScopeSpecification) -> Vec<MeshObject> {
        let mut seen = BTreeSet::from([root.id.clone()]);
        let mut frontier = vec![root.clone()];
        let mut found = Vec::new();
        let mut steps = 1;
        while !frontier.is_empty() && scope.applies_to(steps) {
            let mut next = Vec::new();
            for object in &frontier {
                for id in &object.neighbors {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    if let Some(neighbor) = self.store.get(id) {
                        next.push(neighbor);
                    }
                }
            }
            found.extend(next.iter().cloned());
            frontier = next;
            steps += 1;
        }
        found
    }

    /// Locks the sender asks for but that are held beyond us are
    /// obtained from their holders first.
    async fn obtain_upstream_locks(
        &self,
        sender: &NetMeshBaseIdentifier,
        ids: &[MeshObjectIdentifier],
    ) {
        let upstream: Vec<_> = ids
            .iter()
            .filter(|id| {
                self.store.get(id).is_some_and(|object| {
                    object
                        .proxy_towards_lock
                        .as_ref()
                        .is_some_and(|holder| holder != sender)
                })
            })
            .cloned()
            .collect();
        if upstream.is_empty() {
            return;
        }
        if let Err(e) = self
            .try_to_obtain_locks(&upstream, self.config.request_timeout())
            .await
        {
            warn!(
                "Could not obtain {} locks for {}: {}",
                upstream.len(),
                sender,
                e
            );
        }
    }
}

#[async_trait]
impl MessageHandler for NetMeshBase {
    async fn handle_message(&self, message: MeshMessage) -> MeshMessage {
        match message {
            MeshMessage::Ping(nonce) => MeshMessage::Pong(nonce),
            MeshMessage::Xpriso(request) => self.handle_xpriso(request).await,
            other => MeshMessage::Error(ErrorMessage::protocol_violation(format!(
                "unexpected {} request",
                other.kind()
            ))),
        }
    }
}
