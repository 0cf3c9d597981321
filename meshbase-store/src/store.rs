//! The object table and its transactions.
//!
//! Readers never block on a transaction: a transaction works on a private
//! overlay and publishes it in one step on commit, so a reader sees either
//! none or all of a transaction's changes. At most one transaction is open
//! per store at any time.

use crate::changes::{ApplyOutcome, Change, ChangeKind, ChangeSet};
use crate::error::{StoreError, StoreResult};
use crate::object::MeshObject;
use meshbase_types::{MeshObjectIdentifier, NetMeshBaseIdentifier};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

struct Shared {
    owner: NetMeshBaseIdentifier,
    objects: RwLock<HashMap<MeshObjectIdentifier, MeshObject>>,
    /// Held by the open transaction. Guards the last commit sequence.
    gate: Arc<Mutex<u64>>,
}

/// In-memory MeshObject table of one MeshBase. Cheap to clone.
#[derive(Clone)]
pub struct ObjectStore {
    shared: Arc<Shared>,
}

impl ObjectStore {
    /// Creates a store owned by `owner`, holding only its home object.
    #[must_use]
    pub fn new(owner: NetMeshBaseIdentifier) -> Self {
        let mut home = MeshObject::new(owner.home_object());
        home.version = 1;
        let mut objects = HashMap::new();
        objects.insert(home.id.clone(), home);
        Self {
            shared: Arc::new(Shared {
                owner,
                objects: RwLock::new(objects),
                gate: Arc::new(Mutex::new(0)),
            }),
        }
    }

    #[must_use]
    pub fn owner(&self) -> &NetMeshBaseIdentifier {
        &self.shared.owner
    }

    /// Looks up an object. Relative identifiers are resolved against the
    /// owner.
    #[must_use]
    pub fn get(&self, id: &MeshObjectIdentifier) -> Option<MeshObject> {
        let id = id.qualified_against(&self.shared.owner);
        self.read().get(&id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: &MeshObjectIdentifier) -> bool {
        let id = id.qualified_against(&self.shared.owner);
        self.read().contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    #[must_use]
    pub fn identifiers(&self) -> Vec<MeshObjectIdentifier> {
        let mut ids: Vec<_> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn home_object(&self) -> Option<MeshObject> {
        self.get(&self.shared.owner.home_object())
    }

    /// Opens a transaction, waiting for the current one to finish.
    pub async fn begin_transaction(&self) -> Transaction {
        let guard = Arc::clone(&self.shared.gate).lock_owned().await;
        Transaction::new(Arc::clone(&self.shared), guard)
    }

    /// Opens a transaction, failing if one is already open.
    pub fn try_begin_transaction(&self) -> StoreResult<Transaction> {
        let guard = Arc::clone(&self.shared.gate)
            .try_lock_owned()
            .map_err(|_| StoreError::TransactionActive(self.shared.owner.to_string()))?;
        Ok(Transaction::new(Arc::clone(&self.shared), guard))
    }

    /// Commits `tx`, which must have been opened on this store.
    pub fn commit_transaction(&self, tx: Transaction) -> StoreResult<ChangeSet> {
        self.check_owns(&tx)?;
        Ok(tx.commit())
    }

    /// Applies a partner's changeset inside `tx`.
    ///
    /// Per change: a change we have already seen is skipped, a change made
    /// against our current version is applied, anything else is a
    /// conflict. Changes to objects not held here are ignored. Applied
    /// changes are recorded in `tx` so they can be forwarded.
    pub fn apply_change_set(
        &self,
        tx: &mut Transaction,
        change_set: &ChangeSet,
    ) -> StoreResult<Vec<ApplyOutcome>> {
        self.check_owns(tx)?;
        let outcomes: Vec<ApplyOutcome> = change_set
            .changes
            .iter()
            .map(|change| tx.apply_remote(change))
            .collect();

        for (change, outcome) in change_set.changes.iter().zip(&outcomes) {
            if let ApplyOutcome::Conflict { local_version, base_version } = outcome {
                warn!(
                    "Conflict applying change to {} from {}: local version {}, base version {}",
                    change.object, change_set.origin, local_version, base_version
                );
            }
        }
        Ok(outcomes)
    }

    fn check_owns(&self, tx: &Transaction) -> StoreResult<()> {
        if Arc::ptr_eq(&self.shared, &tx.shared) {
            Ok(())
        } else {
            Err(StoreError::WrongStore {
                expected: tx.shared.owner.to_string(),
                actual: self.shared.owner.to_string(),
            })
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<MeshObjectIdentifier, MeshObject>> {
        self.shared.objects.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive write access to an [`ObjectStore`].
///
/// Dropping a transaction without committing discards every change made
/// through it.
pub struct Transaction {
    shared: Arc<Shared>,
    last_seq: OwnedMutexGuard<u64>,
    /// `None` marks a deletion.
    working: HashMap<MeshObjectIdentifier, Option<MeshObject>>,
    changes: Vec<Change>,
    committed: bool,
}

impl Transaction {
    fn new(shared: Arc<Shared>, last_seq: OwnedMutexGuard<u64>) -> Self {
        Self {
            shared,
            last_seq,
            working: HashMap::new(),
            changes: Vec::new(),
            committed: false,
        }
    }

    #[must_use]
    pub fn owner(&self) -> &NetMeshBaseIdentifier {
        &self.shared.owner
    }

    /// Reads an object as this transaction sees it.
    #[must_use]
    pub fn get(&self, id: &MeshObjectIdentifier) -> Option<MeshObject> {
        let id = id.qualified_against(&self.shared.owner);
        match self.working.get(&id) {
            Some(entry) => entry.clone(),
            None => self
                .shared
                .objects
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&id)
                .cloned(),
        }
    }

    /// Changes recorded so far, in order.
    #[must_use]
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    // ── Recorded mutations ─────────────────────────────────────────

    /// Creates a new locally-owned object.
    pub fn create(&mut self, id: MeshObjectIdentifier) -> StoreResult<MeshObjectIdentifier> {
        let id = id.qualified_against(&self.shared.owner);
        if self.get(&id).is_some() {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        self.record(MeshObject::new(id.clone()), ChangeKind::Created);
        Ok(id)
    }

    /// Deletes an object, unrelating it from its neighbours first.
    pub fn delete(&mut self, id: &MeshObjectIdentifier) -> StoreResult<()> {
        let object = self.writable(id)?;
        if object.id.is_home_object() {
            return Err(StoreError::InvalidOperation(format!(
                "cannot delete home object {}",
                object.id
            )));
        }
        for neighbor in object.neighbors.clone() {
            self.unrelate(&object.id, &neighbor)?;
        }
        let object = self.writable(id)?;
        let object_id = object.id.clone();
        self.record(object, ChangeKind::Deleted);
        self.working.insert(object_id, None);
        Ok(())
    }

    /// Sets a property. Setting the current value records nothing.
    pub fn set_property(
        &mut self,
        id: &MeshObjectIdentifier,
        name: &str,
        value: Value,
    ) -> StoreResult<()> {
        self.change_property(id, name, Some(value))
    }

    pub fn clear_property(&mut self, id: &MeshObjectIdentifier, name: &str) -> StoreResult<()> {
        self.change_property(id, name, None)
    }

    pub fn bless(&mut self, id: &MeshObjectIdentifier, type_name: &str) -> StoreResult<()> {
        let mut object = self.writable(id)?;
        if object.types.insert(type_name.to_string()) {
            self.record(
                object,
                ChangeKind::Blessed {
                    type_name: type_name.to_string(),
                },
            );
        }
        Ok(())
    }

    pub fn unbless(&mut self, id: &MeshObjectIdentifier, type_name: &str) -> StoreResult<()> {
        let mut object = self.writable(id)?;
        if object.types.remove(type_name) {
            self.record(
                object,
                ChangeKind::Unblessed {
                    type_name: type_name.to_string(),
                },
            );
        }
        Ok(())
    }

    /// Relates two objects. Both sides change, so both locks are needed.
    pub fn relate(&mut self, a: &MeshObjectIdentifier, b: &MeshObjectIdentifier) -> StoreResult<()> {
        let mut left = self.writable(a)?;
        let mut right = self.writable(b)?;
        if left.id == right.id {
            return Err(StoreError::InvalidOperation(format!(
                "cannot relate {} to itself",
                left.id
            )));
        }
        if left.neighbors.insert(right.id.clone()) {
            let neighbor = right.id.clone();
            self.record(left.clone(), ChangeKind::Related { neighbor });
        }
        if right.neighbors.insert(left.id.clone()) {
            let neighbor = left.id.clone();
            self.record(right, ChangeKind::Related { neighbor });
        }
        Ok(())
    }

    pub fn unrelate(&mut self, a: &MeshObjectIdentifier, b: &MeshObjectIdentifier) -> StoreResult<()> {
        let b = b.qualified_against(&self.shared.owner);
        let mut left = self.writable(a)?;
        if !left.neighbors.remove(&b) {
            return Ok(());
        }
        let left_id = left.id.clone();
        self.record(left, ChangeKind::Unrelated { neighbor: b.clone() });
        // The other side may be gone or locked elsewhere.
        if let Ok(mut right) = self.writable(&b) {
            if right.neighbors.remove(&left_id) {
                self.record(right, ChangeKind::Unrelated { neighbor: left_id });
            }
        }
        Ok(())
    }

    // ── Bookkeeping (not replicated) ───────────────────────────────

    /// Stores a replica obtained from a partner, replacing any older copy.
    pub fn put_replica(&mut self, replica: MeshObject) {
        self.working.insert(replica.id.clone(), Some(replica));
    }

    /// Removes a replica without recording a deletion.
    pub fn purge_replica(&mut self, id: &MeshObjectIdentifier) -> StoreResult<()> {
        let object = self
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !object.is_replica() {
            return Err(StoreError::InvalidOperation(format!(
                "{} is not a replica",
                object.id
            )));
        }
        self.working.insert(object.id, None);
        Ok(())
    }

    /// Moves the write lock. `None` means the lock is held here.
    pub fn set_lock_holder(
        &mut self,
        id: &MeshObjectIdentifier,
        holder: Option<NetMeshBaseIdentifier>,
    ) -> StoreResult<()> {
        let mut object = self
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        object.proxy_towards_lock = holder;
        self.working.insert(object.id.clone(), Some(object));
        Ok(())
    }

    /// Publishes every change atomically and returns the digest.
    #[must_use]
    pub fn commit(mut self) -> ChangeSet {
        {
            let mut objects = self
                .shared
                .objects
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, entry) in self.working.drain() {
                match entry {
                    Some(object) => {
                        objects.insert(id, object);
                    }
                    None => {
                        objects.remove(&id);
                    }
                }
            }
        }
        *self.last_seq += 1;
        self.committed = true;
        let change_set = ChangeSet {
            origin: self.shared.owner.clone(),
            transaction_seq: *self.last_seq,
            changes: std::mem::take(&mut self.changes),
        };
        debug!(
            "Committed transaction {} on {} with {} changes",
            change_set.transaction_seq,
            change_set.origin,
            change_set.changes.len()
        );
        change_set
    }

    // ── Internals ──────────────────────────────────────────────────

    fn change_property(
        &mut self,
        id: &MeshObjectIdentifier,
        name: &str,
        new: Option<Value>,
    ) -> StoreResult<()> {
        let mut object = self.writable(id)?;
        let old = object.properties.get(name).cloned();
        if old == new {
            return Ok(());
        }
        match &new {
            Some(value) => {
                object.properties.insert(name.to_string(), value.clone());
            }
            None => {
                object.properties.remove(name);
            }
        }
        self.record(
            object,
            ChangeKind::PropertyChanged {
                name: name.to_string(),
                old,
                new,
            },
        );
        Ok(())
    }

    /// Loads an object for a local write: it must exist and its lock must
    /// be held here.
    fn writable(&self, id: &MeshObjectIdentifier) -> StoreResult<MeshObject> {
        let object = self
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.qualified_against(&self.shared.owner).to_string()))?;
        match &object.proxy_towards_lock {
            None => Ok(object),
            Some(holder) => Err(StoreError::NotLockOwner {
                object: object.id.to_string(),
                holder: holder.to_string(),
            }),
        }
    }

    fn record(&mut self, mut object: MeshObject, kind: ChangeKind) {
        let base_version = object.version;
        object.version += 1;
        self.changes.push(Change {
            object: object.id.clone(),
            base_version,
            new_version: object.version,
            kind,
        });
        self.working.insert(object.id.clone(), Some(object));
    }

    fn apply_remote(&mut self, change: &Change) -> ApplyOutcome {
        let Some(mut object) = self.get(&change.object) else {
            return ApplyOutcome::Unknown;
        };
        if object.version >= change.new_version {
            return ApplyOutcome::Duplicate;
        }
        if object.version != change.base_version {
            return ApplyOutcome::Conflict {
                local_version: object.version,
                base_version: change.base_version,
            };
        }

        match &change.kind {
            ChangeKind::Created => {}
            ChangeKind::Deleted => {
                self.working.insert(object.id, None);
                self.changes.push(change.clone());
                return ApplyOutcome::Applied;
            }
            ChangeKind::PropertyChanged { name, new, .. } => match new {
                Some(value) => {
                    object.properties.insert(name.clone(), value.clone());
                }
                None => {
                    object.properties.remove(name);
                }
            },
            ChangeKind::Blessed { type_name } => {
                object.types.insert(type_name.clone());
            }
            ChangeKind::Unblessed { type_name } => {
                object.types.remove(type_name);
            }
            ChangeKind::Related { neighbor } => {
                object.neighbors.insert(neighbor.clone());
            }
            ChangeKind::Unrelated { neighbor } => {
                object.neighbors.remove(neighbor);
            }
        }
        object.version = change.new_version;
        self.working.insert(object.id.clone(), Some(object));
        self.changes.push(change.clone());
        ApplyOutcome::Applied
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.committed && !self.working.is_empty() {
            debug!(
                "Rolling back transaction on {} ({} objects touched)",
                self.shared.owner,
                self.working.len()
            );
        }
    }
}
