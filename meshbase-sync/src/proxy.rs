//! The replication endpoint towards one partner MeshBase.
//!
//! A [`Proxy`] owns the channel to its partner and two replica tables:
//! the replicas obtained *from* the partner (with their lock state and
//! refresh schedule) and the replicas the partner obtained *from us*. It
//! performs the requester side of every Xpriso exchange; the responder
//! side lives in [`crate::NetMeshBase`], which has the store and the
//! other proxies at hand.
//!
//! Proxies are created by the [`crate::ProxyManager`] only.

use crate::channel::{Channel, PendingReply};
use crate::config::NetMeshBaseConfig;
use crate::error::{SyncError, SyncResult};
use crate::lock::{LockState, LockTransitionError};
use crate::protocol::{FailedPath, MeshMessage, XprisoMessage};
use crate::schedule::{Clock, RefreshSchedule, RefreshState};
use crate::transport::MeshTransport;
use meshbase_store::{ChangeKind, ChangeSet, MeshObject, ObjectStore};
use meshbase_types::{
    CoherenceSpecification, MeshObjectIdentifier, NetMeshBaseIdentifier,
    NetMeshObjectAccessSpecification,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A replica obtained from the partner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaEntry {
    pub lock: LockState,
    pub schedule: RefreshSchedule,
    /// Version last received from the partner.
    pub version: u64,
}

/// A replica the partner obtained from us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServedEntry {
    pub lock: LockState,
    /// Version last sent to the partner.
    pub version: u64,
}

/// Result of [`Proxy::obtain_replicas`].
#[derive(Debug, Default)]
pub struct ObtainOutcome {
    /// Every object conveyed, as now stored locally.
    pub objects: Vec<MeshObject>,
    /// Paths the partner could not resolve.
    pub failed: Vec<FailedPath>,
}

/// Result of [`Proxy::resynchronize`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub changed: Vec<MeshObjectIdentifier>,
    pub unchanged: Vec<MeshObjectIdentifier>,
    /// Replicas the partner no longer serves; purged here.
    pub canceled: Vec<MeshObjectIdentifier>,
}

/// Persistent form of a proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalizedProxy {
    pub partner: NetMeshBaseIdentifier,
    pub coherence: CoherenceSpecification,
    pub created_ms: u64,
    pub updated_ms: u64,
    pub read_ms: u64,
    pub expires_ms: Option<u64>,
    pub obtained: Vec<(MeshObjectIdentifier, ReplicaEntry)>,
    pub served: Vec<(MeshObjectIdentifier, ServedEntry)>,
}

pub(crate) enum InboundDecision {
    Fresh,
    /// An exact retry of a request already answered.
    Replay(MeshMessage),
    /// Older than the newest request seen and no longer cached.
    Stale { last: u64 },
}

/// Sequencing of requests arriving from the partner.
pub(crate) struct InboundLog {
    session: Option<Uuid>,
    last_request_id: u64,
    responses: VecDeque<(u64, MeshMessage)>,
    capacity: usize,
}

impl InboundLog {
    fn new(capacity: usize) -> Self {
        Self {
            session: None,
            last_request_id: 0,
            responses: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn check(&mut self, session: Uuid, request_id: u64) -> InboundDecision {
        if self.session != Some(session) {
            self.session = Some(session);
            self.last_request_id = 0;
            self.responses.clear();
        }
        if request_id > self.last_request_id {
            return InboundDecision::Fresh;
        }
        self.responses
            .iter()
            .find(|(id, _)| *id == request_id)
            .map_or(
                InboundDecision::Stale {
                    last: self.last_request_id,
                },
                |(_, response)| InboundDecision::Replay(response.clone()),
            )
    }

    pub(crate) fn remember(&mut self, request_id: u64, response: MeshMessage) {
        self.last_request_id = self.last_request_id.max(request_id);
        self.responses.push_back((request_id, response));
        while self.responses.len() > self.capacity {
            self.responses.pop_front();
        }
    }
}

struct ProxyState {
    obtained: HashMap<MeshObjectIdentifier, ReplicaEntry>,
    served: HashMap<MeshObjectIdentifier, ServedEntry>,
    updated_ms: u64,
    read_ms: u64,
    quarantined: Option<String>,
    dead: bool,
}

/// Replication endpoint towards one partner.
pub struct Proxy {
    owner: NetMeshBaseIdentifier,
    partner: NetMeshBaseIdentifier,
    coherence: CoherenceSpecification,
    created_ms: u64,
    clock: Clock,
    channel: Channel,
    state: std::sync::Mutex<ProxyState>,
    inbound: tokio::sync::Mutex<InboundLog>,
}

impl Proxy {
    pub(crate) fn new(
        owner: NetMeshBaseIdentifier,
        partner: NetMeshBaseIdentifier,
        coherence: CoherenceSpecification,
        transport: Arc<dyn MeshTransport>,
        config: Arc<NetMeshBaseConfig>,
        clock: Clock,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let now = clock.now_ms();
        let cache = config.response_cache_size;
        let channel = Channel::spawn(partner.clone(), transport, config, shutdown);
        debug!("Created proxy {} -> {}", owner, partner);
        Self {
            owner,
            partner,
            coherence,
            created_ms: now,
            clock,
            channel,
            state: std::sync::Mutex::new(ProxyState {
                obtained: HashMap::new(),
                served: HashMap::new(),
                updated_ms: now,
                read_ms: now,
                quarantined: None,
                dead: false,
            }),
            inbound: tokio::sync::Mutex::new(InboundLog::new(cache)),
        }
    }

    /// Recreates a proxy from its persistent form with a fresh channel.
    pub(crate) fn restore(
        owner: NetMeshBaseIdentifier,
        externalized: ExternalizedProxy,
        transport: Arc<dyn MeshTransport>,
        config: Arc<NetMeshBaseConfig>,
        clock: Clock,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut proxy = Self::new(
            owner,
            externalized.partner,
            externalized.coherence,
            transport,
            config,
            clock,
            shutdown,
        );
        proxy.created_ms = externalized.created_ms;
        {
            let mut state = proxy.lock_state();
            state.obtained = externalized.obtained.into_iter().collect();
            state.served = externalized.served.into_iter().collect();
            state.updated_ms = externalized.updated_ms;
            state.read_ms = externalized.read_ms;
        }
        proxy
    }

    // ── Accessors ────────────────────────────────────────────────

    #[must_use]
    pub fn owner(&self) -> &NetMeshBaseIdentifier {
        &self.owner
    }

    #[must_use]
    pub fn partner(&self) -> &NetMeshBaseIdentifier {
        &self.partner
    }

    /// Coherence applied to replicas obtained without an explicit one.
    #[must_use]
    pub const fn coherence(&self) -> CoherenceSpecification {
        self.coherence
    }

    #[must_use]
    pub const fn time_created(&self) -> u64 {
        self.created_ms
    }

    /// Last successful exchange with the partner.
    #[must_use]
    pub fn time_updated(&self) -> u64 {
        self.lock_state().updated_ms
    }

    /// Last time a replica was served from the cache.
    #[must_use]
    pub fn time_read(&self) -> u64 {
        self.lock_state().read_ms
    }

    /// Earliest scheduled refresh, `None` if nothing is scheduled.
    #[must_use]
    pub fn time_expires(&self) -> Option<u64> {
        self.lock_state()
            .obtained
            .values()
            .filter_map(|entry| entry.schedule.next_check_ms())
            .min()
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.channel.consecutive_failures()
    }

    #[must_use]
    pub fn replica(&self, id: &MeshObjectIdentifier) -> Option<ReplicaEntry> {
        self.lock_state().obtained.get(id).cloned()
    }

    #[must_use]
    pub fn served(&self, id: &MeshObjectIdentifier) -> Option<ServedEntry> {
        self.lock_state().served.get(id).copied()
    }

    /// Replicas obtained from the partner, sorted.
    #[must_use]
    pub fn obtained_ids(&self) -> Vec<MeshObjectIdentifier> {
        let mut ids: Vec<_> = self.lock_state().obtained.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Replicas the partner holds from us, sorted.
    #[must_use]
    pub fn served_ids(&self) -> Vec<MeshObjectIdentifier> {
        let mut ids: Vec<_> = self.lock_state().served.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Refresh state of an obtained replica. Counts as a read.
    #[must_use]
    pub fn refresh_state(&self, id: &MeshObjectIdentifier) -> Option<RefreshState> {
        let now = self.clock.now_ms();
        let mut state = self.lock_state();
        let refresh = state.obtained.get(id).map(|entry| entry.schedule.state(now))?;
        state.read_ms = now;
        Some(refresh)
    }

    /// Obtained replicas whose next check has passed. Replicas whose lock
    /// we hold are authoritative here and never due.
    #[must_use]
    pub fn due_replicas(&self, now_ms: u64) -> Vec<MeshObjectIdentifier> {
        let mut due: Vec<_> = self
            .lock_state()
            .obtained
            .iter()
            .filter(|(_, entry)| !entry.lock.allows_local_writes())
            .filter(|(_, entry)| entry.schedule.state(now_ms) == RefreshState::Due)
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();
        due
    }

    /// Unconfirmed locks that have waited at least `delay_ms`.
    #[must_use]
    pub fn locks_due_for_reclaim(&self, now_ms: u64, delay_ms: u64) -> Vec<MeshObjectIdentifier> {
        let mut due: Vec<_> = self
            .lock_state()
            .obtained
            .iter()
            .filter(|(_, entry)| entry.lock.reclaim_due(now_ms, delay_ms))
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();
        due
    }

    #[must_use]
    pub fn quarantine_reason(&self) -> Option<String> {
        self.lock_state().quarantined.clone()
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.lock_state().dead
    }

    // ── Requester side ───────────────────────────────────────────

    /// Asks the partner for replicas of `paths`, which are relative to
    /// the partner. Conveyed objects are stored as replicas.
    pub async fn obtain_replicas(
        &self,
        store: &ObjectStore,
        paths: &[NetMeshObjectAccessSpecification],
        coherence: Option<CoherenceSpecification>,
    ) -> SyncResult<ObtainOutcome> {
        let mut request = self.new_request();
        request.requested_first_time = paths.to_vec();
        let response = self.exchange(request).await?;

        let objects = self
            .absorb(store, response.conveyed, coherence.unwrap_or(self.coherence))
            .await?;
        if !response.failed_paths.is_empty() {
            debug!(
                "{} could not resolve {} of {} paths",
                self.partner,
                response.failed_paths.len(),
                paths.len()
            );
        }
        Ok(ObtainOutcome {
            objects,
            failed: response.failed_paths,
        })
    }

    /// Refreshes obtained replicas and advances their schedules.
    pub async fn resynchronize(
        &self,
        store: &ObjectStore,
        ids: &[MeshObjectIdentifier],
    ) -> SyncResult<RefreshOutcome> {
        let mut request = self.new_request();
        request.requested_resynchronize = ids.to_vec();
        let response = self.exchange(request).await?;

        let now = self.clock.now_ms();
        let mut outcome = RefreshOutcome::default();
        let mut tx = store.begin_transaction().await;
        {
            let mut state = self.lock_state();
            for incoming in response.resynchronized {
                let changed = state
                    .obtained
                    .get(&incoming.id)
                    .is_none_or(|entry| incoming.version > entry.version);
                let entry = state
                    .obtained
                    .entry(incoming.id.clone())
                    .or_insert_with(|| ReplicaEntry {
                        lock: LockState::HeldRemotely,
                        schedule: RefreshSchedule::new(self.coherence, now),
                        version: incoming.version,
                    });
                entry.version = entry.version.max(incoming.version);
                if changed {
                    entry.schedule.on_changed(now);
                    outcome.changed.push(incoming.id.clone());
                } else {
                    entry.schedule.on_unchanged(now);
                    outcome.unchanged.push(incoming.id.clone());
                }
                let existing = tx.get(&incoming.id);
                if let Some(replica) = self.merge_replica(existing, incoming) {
                    tx.put_replica(replica);
                }
            }
            for id in response.requested_canceled {
                state.obtained.remove(&id);
                outcome.canceled.push(id);
            }
        }
        for id in &outcome.canceled {
            if tx.get(id).is_some_and(|o| o.is_replica()) {
                tx.purge_replica(id)?;
            }
        }
        let _ = tx.commit();
        debug!(
            "Resynchronized from {}: {} changed, {} unchanged, {} canceled",
            self.partner,
            outcome.changed.len(),
            outcome.unchanged.len(),
            outcome.canceled.len()
        );
        Ok(outcome)
    }

    /// Obtains write locks held by the partner. Returns the objects whose
    /// lock is now held here.
    ///
    /// If the acknowledgement cannot be delivered the locks become
    /// unconfirmed and writes stay blocked until they are reclaimed.
    pub async fn try_to_obtain_locks(
        &self,
        store: &ObjectStore,
        ids: &[MeshObjectIdentifier],
        timeout: Duration,
    ) -> SyncResult<Vec<MeshObjectIdentifier>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let requested: BTreeSet<_> = ids.iter().cloned().collect();

        let mut request = self.new_request();
        request.requested_locks = ids.to_vec();
        let response = tokio::time::timeout_at(deadline, self.exchange(request))
            .await
            .unwrap_or(Err(SyncError::Timeout))?;

        if let Some(stray) = response.pushed_locks.iter().find(|id| !requested.contains(*id)) {
            return Err(self.violation(format!("pushed lock {stray} that was not requested")));
        }
        self.absorb(store, response.conveyed, self.coherence).await?;
        let pushed = response.pushed_locks;
        if pushed.is_empty() {
            return Ok(pushed);
        }

        let mut acknowledgement = self.new_request();
        acknowledgement.lock_acknowledgements = pushed.clone();
        let delivered = tokio::time::timeout_at(deadline, self.exchange(acknowledgement))
            .await
            .unwrap_or(Err(SyncError::Timeout));

        let now = self.clock.now_ms();
        if let Err(e) = delivered {
            let mut state = self.lock_state();
            for id in &pushed {
                self.obtained_entry(&mut state, id, now).lock.mark_unconfirmed(now);
            }
            warn!(
                "Lock handshake with {} broke off, {} locks unconfirmed: {}",
                self.partner,
                pushed.len(),
                e
            );
            return Err(e);
        }

        self.take_locks(store, &pushed).await?;
        info!("Obtained {} locks from {}", pushed.len(), self.partner);
        Ok(pushed)
    }

    /// Takes the locks without the partner's consent, then tells the
    /// partner if it can be reached.
    pub async fn force_obtain_locks(
        &self,
        store: &ObjectStore,
        ids: &[MeshObjectIdentifier],
    ) -> SyncResult<()> {
        self.take_locks(store, ids).await?;
        warn!("Forcibly reclaimed {} locks from {}", ids.len(), self.partner);

        let mut notice = self.new_request();
        notice.reclaimed_locks = ids.to_vec();
        if let Err(e) = self.exchange(notice).await {
            warn!("Could not tell {} about reclaimed locks: {}", self.partner, e);
        }
        Ok(())
    }

    /// Drops replicas obtained from the partner, here and there.
    pub async fn cancel_replicas(
        &self,
        store: &ObjectStore,
        ids: &[MeshObjectIdentifier],
    ) -> SyncResult<()> {
        let mut tx = store.begin_transaction().await;
        for id in ids {
            if tx.get(id).is_some_and(|o| o.is_replica()) {
                tx.purge_replica(id)?;
            }
        }
        let _ = tx.commit();
        {
            let mut state = self.lock_state();
            for id in ids {
                state.obtained.remove(id);
            }
        }

        let mut request = self.new_request();
        request.requested_canceled = ids.to_vec();
        self.exchange(request).await.map(|_| ())
    }

    /// Queues the part of `change_set` the partner replicates. Returns
    /// `None` if nothing is relevant to the partner.
    pub fn send_changes(&self, change_set: &ChangeSet) -> SyncResult<Option<PendingReply>> {
        self.ensure_usable()?;
        let relevant = {
            let mut state = self.lock_state();
            let relevant: BTreeSet<_> = state
                .obtained
                .keys()
                .chain(state.served.keys())
                .cloned()
                .collect();
            for change in &change_set.changes {
                if change.kind == ChangeKind::Deleted {
                    state.obtained.remove(&change.object);
                    state.served.remove(&change.object);
                } else if let Some(served) = state.served.get_mut(&change.object) {
                    served.version = served.version.max(change.new_version);
                } else if let Some(obtained) = state.obtained.get_mut(&change.object) {
                    obtained.version = obtained.version.max(change.new_version);
                }
            }
            relevant
        };
        let restricted = change_set.restricted_to(&relevant);
        if restricted.is_empty() {
            return Ok(None);
        }
        debug!(
            "Pushing {} changes of transaction {} to {}",
            restricted.changes.len(),
            restricted.transaction_seq,
            self.partner
        );
        let mut request = self.new_request();
        request.change_set = Some(restricted);
        self.channel.enqueue(request).map(Some)
    }

    /// Tells the partner we are done, then dies.
    pub async fn initiate_cease_communications(&self) -> SyncResult<()> {
        let mut request = self.new_request();
        request.cease_communications = true;
        let result = self.exchange(request).await.map(|_| ());
        self.die();
        result
    }

    /// Stops the channel. Queued and in-flight requests fail.
    pub fn die(&self) {
        let mut state = self.lock_state();
        if !state.dead {
            state.dead = true;
            self.channel.close();
            debug!("Proxy {} -> {} died", self.owner, self.partner);
        }
    }

    /// Stops trusting the partner until released.
    pub fn quarantine(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Quarantining proxy to {}: {}", self.partner, reason);
        self.lock_state().quarantined = Some(reason);
    }

    /// Returns whether the proxy was quarantined.
    pub fn release_quarantine(&self) -> bool {
        let released = self.lock_state().quarantined.take().is_some();
        if released {
            info!("Released quarantine of proxy to {}", self.partner);
        }
        released
    }

    #[must_use]
    pub fn to_externalized(&self) -> ExternalizedProxy {
        let expires_ms = self.time_expires();
        let state = self.lock_state();
        let mut obtained: Vec<_> = state
            .obtained
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        obtained.sort_by(|a, b| a.0.cmp(&b.0));
        let mut served: Vec<_> = state
            .served
            .iter()
            .map(|(id, entry)| (id.clone(), *entry))
            .collect();
        served.sort_by(|a, b| a.0.cmp(&b.0));
        ExternalizedProxy {
            partner: self.partner.clone(),
            coherence: self.coherence,
            created_ms: self.created_ms,
            updated_ms: state.updated_ms,
            read_ms: state.read_ms,
            expires_ms,
            obtained,
            served,
        }
    }

    // ── Responder side ───────────────────────────────────────────

    pub(crate) async fn inbound(&self) -> tokio::sync::MutexGuard<'_, InboundLog> {
        self.inbound.lock().await
    }

    pub(crate) fn touch_updated(&self) {
        let now = self.clock.now_ms();
        self.lock_state().updated_ms = now;
    }

    /// Notes that `object` was sent to the partner.
    pub(crate) fn record_served(&self, object: &MeshObject) {
        let mut state = self.lock_state();
        let entry = state.served.entry(object.id.clone()).or_insert(ServedEntry {
            lock: LockState::HeldLocally,
            version: object.version,
        });
        entry.version = entry.version.max(object.version);
        if !object.has_lock() && entry.lock.allows_local_writes() {
            entry.lock = LockState::HeldRemotely;
        }
    }

    pub(crate) fn forget_served(&self, id: &MeshObjectIdentifier) {
        self.lock_state().served.remove(id);
    }

    pub(crate) fn propose_lock_release(
        &self,
        object: &MeshObject,
    ) -> Result<(), LockTransitionError> {
        self.record_served(object);
        let mut state = self.lock_state();
        let entry = state.served.entry(object.id.clone()).or_insert(ServedEntry {
            lock: LockState::HeldLocally,
            version: object.version,
        });
        if object.has_lock() {
            entry.lock = match entry.lock {
                LockState::HeldRemotely | LockState::Unconfirmed { .. } => LockState::HeldLocally,
                other => other,
            };
        }
        entry.lock.propose_release()
    }

    pub(crate) fn accept_lock_acknowledgement(
        &self,
        id: &MeshObjectIdentifier,
    ) -> Result<(), LockTransitionError> {
        let mut state = self.lock_state();
        match state.served.get_mut(id) {
            Some(entry) => entry.lock.accept_acknowledgement(),
            None => Err(LockTransitionError::NotProposed(LockState::HeldLocally)),
        }
    }

    /// The partner took a lock; it is held there now.
    pub(crate) fn lock_reclaimed_by_partner(&self, id: &MeshObjectIdentifier) {
        let mut state = self.lock_state();
        if let Some(entry) = state.served.get_mut(id) {
            entry.lock.surrender();
        }
        if let Some(entry) = state.obtained.get_mut(id) {
            entry.lock.surrender();
        }
    }

    /// Builds a protocol violation error and quarantines.
    pub(crate) fn violation(&self, reason: impl Into<String>) -> SyncError {
        let reason = reason.into();
        self.quarantine(reason.clone());
        SyncError::ProtocolViolation {
            partner: self.partner.to_string(),
            reason,
        }
    }

    // ── Internals ────────────────────────────────────────────────

    fn lock_state(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_request(&self) -> XprisoMessage {
        let mut request = XprisoMessage::new(self.owner.clone(), self.partner.clone());
        request.session = self.channel.session();
        request
    }

    fn ensure_usable(&self) -> SyncResult<()> {
        let state = self.lock_state();
        if state.dead {
            return Err(SyncError::ChannelClosed);
        }
        match &state.quarantined {
            Some(reason) => Err(SyncError::Quarantined {
                partner: self.partner.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn exchange(&self, request: XprisoMessage) -> SyncResult<XprisoMessage> {
        self.ensure_usable()?;
        match self.channel.request(request).await {
            Ok(response) => {
                self.touch_updated();
                Ok(response)
            }
            Err(SyncError::ProtocolViolation { partner, reason }) => {
                self.quarantine(reason.clone());
                Err(SyncError::ProtocolViolation { partner, reason })
            }
            Err(e) => Err(e),
        }
    }

    fn obtained_entry<'a>(
        &self,
        state: &'a mut ProxyState,
        id: &MeshObjectIdentifier,
        now: u64,
    ) -> &'a mut ReplicaEntry {
        state
            .obtained
            .entry(id.clone())
            .or_insert_with(|| ReplicaEntry {
                lock: LockState::HeldRemotely,
                schedule: RefreshSchedule::new(self.coherence, now),
                version: 0,
            })
    }

    /// Chooses what to store for an incoming copy of `existing`. Objects
    /// homed here and copies no newer than ours are kept as they are.
    fn merge_replica(
        &self,
        existing: Option<MeshObject>,
        incoming: MeshObject,
    ) -> Option<MeshObject> {
        match existing {
            Some(existing) if !existing.is_replica() => None,
            Some(existing) if existing.version >= incoming.version => None,
            existing => {
                let mut replica = incoming.to_conveyed();
                replica.proxy_towards_home = Some(self.partner.clone());
                replica.proxy_towards_lock = match existing {
                    Some(existing) => existing.proxy_towards_lock,
                    None => Some(self.partner.clone()),
                };
                Some(replica)
            }
        }
    }

    /// Stores conveyed objects as replicas and registers them as obtained.
    async fn absorb(
        &self,
        store: &ObjectStore,
        objects: Vec<MeshObject>,
        coherence: CoherenceSpecification,
    ) -> SyncResult<Vec<MeshObject>> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }
        let now = self.clock.now_ms();
        let mut tx = store.begin_transaction().await;
        let mut stored = Vec::with_capacity(objects.len());
        for incoming in objects {
            let existing = tx.get(&incoming.id);
            let is_ours = existing.as_ref().is_some_and(|o| !o.is_replica());
            let id = incoming.id.clone();
            let version = incoming.version;
            if let Some(replica) = self.merge_replica(existing, incoming) {
                tx.put_replica(replica);
            }
            if !is_ours {
                let mut state = self.lock_state();
                let entry = state
                    .obtained
                    .entry(id.clone())
                    .or_insert_with(|| ReplicaEntry {
                        lock: LockState::HeldRemotely,
                        schedule: RefreshSchedule::new(coherence, now),
                        version,
                    });
                entry.version = entry.version.max(version);
            }
            if let Some(object) = tx.get(&id) {
                stored.push(object);
            }
        }
        let _ = tx.commit();
        Ok(stored)
    }

    async fn take_locks(
        &self,
        store: &ObjectStore,
        ids: &[MeshObjectIdentifier],
    ) -> SyncResult<()> {
        let mut tx = store.begin_transaction().await;
        for id in ids {
            if tx.get(id).is_some() {
                tx.set_lock_holder(id, None)?;
            }
        }
        let _ = tx.commit();
        let now = self.clock.now_ms();
        let mut state = self.lock_state();
        for id in ids {
            self.obtained_entry(&mut state, id, now).lock.acquire();
        }
        Ok(())
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.channel.close();
    }
}
