//! Replica records.

use meshbase_types::{MeshObjectIdentifier, NetMeshBaseIdentifier};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A MeshObject as held by one MeshBase: either the authoritative copy or
/// a replica of an object homed elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshObject {
    pub id: MeshObjectIdentifier,
    /// Entity types the object is blessed with.
    pub types: BTreeSet<String>,
    pub properties: BTreeMap<String, Value>,
    pub neighbors: BTreeSet<MeshObjectIdentifier>,
    /// Incremented by every change; compared to detect duplicates and
    /// conflicting concurrent edits.
    pub version: u64,
    /// Partner through which the write lock can be obtained. `None` if
    /// the lock is held here.
    pub proxy_towards_lock: Option<NetMeshBaseIdentifier>,
    /// Partner this replica was obtained from. `None` for objects homed here.
    pub proxy_towards_home: Option<NetMeshBaseIdentifier>,
}

impl MeshObject {
    /// A fresh, locally-owned object.
    #[must_use]
    pub fn new(id: MeshObjectIdentifier) -> Self {
        Self {
            id,
            types: BTreeSet::new(),
            properties: BTreeMap::new(),
            neighbors: BTreeSet::new(),
            version: 0,
            proxy_towards_lock: None,
            proxy_towards_home: None,
        }
    }

    #[must_use]
    pub const fn has_lock(&self) -> bool {
        self.proxy_towards_lock.is_none()
    }

    #[must_use]
    pub const fn is_replica(&self) -> bool {
        self.proxy_towards_home.is_some()
    }

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    #[must_use]
    pub fn is_blessed_by(&self, type_name: &str) -> bool {
        self.types.contains(type_name)
    }

    /// Copy suitable for sending to a partner: lock and home bookkeeping
    /// are local and stripped.
    #[must_use]
    pub fn to_conveyed(&self) -> Self {
        Self {
            proxy_towards_lock: None,
            proxy_towards_home: None,
            ..self.clone()
        }
    }
}
