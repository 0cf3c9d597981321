//! Changeset digests exchanged between MeshBases.

use meshbase_types::{MeshObjectIdentifier, NetMeshBaseIdentifier};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// All changes made by one committed transaction, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// MeshBase that committed the transaction.
    pub origin: NetMeshBaseIdentifier,
    /// Per-store commit sequence of the transaction.
    pub transaction_seq: u64,
    pub changes: Vec<Change>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Objects touched by this changeset, without duplicates.
    #[must_use]
    pub fn touched(&self) -> BTreeSet<MeshObjectIdentifier> {
        self.changes.iter().map(|c| c.object.clone()).collect()
    }

    /// The subset of changes touching `objects`, order kept.
    #[must_use]
    pub fn restricted_to(&self, objects: &BTreeSet<MeshObjectIdentifier>) -> Self {
        Self {
            origin: self.origin.clone(),
            transaction_seq: self.transaction_seq,
            changes: self
                .changes
                .iter()
                .filter(|c| objects.contains(&c.object))
                .cloned()
                .collect(),
        }
    }
}

/// One change to one object. `base_version` is the version the change
/// was made against, `new_version` the version it produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub object: MeshObjectIdentifier,
    pub base_version: u64,
    pub new_version: u64,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Deleted,
    PropertyChanged {
        name: String,
        old: Option<Value>,
        new: Option<Value>,
    },
    Blessed { type_name: String },
    Unblessed { type_name: String },
    Related { neighbor: MeshObjectIdentifier },
    Unrelated { neighbor: MeshObjectIdentifier },
}

/// What happened to one incoming change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already seen: the local version is at or past the change.
    Duplicate,
    /// Made against a version we do not have.
    Conflict { local_version: u64, base_version: u64 },
    /// The object is not replicated here.
    Unknown,
}
