//! In-memory MeshObject store for NetMeshBases.
//!
//! Holds authoritative objects and replicas, and serialises all local
//! mutation through [`Transaction`]s. Every committed transaction yields a
//! [`ChangeSet`] that the replication layer pushes to partners; incoming
//! changesets are applied back through a transaction so that readers never
//! observe half of a partner's batch.

mod changes;
mod error;
mod object;
mod store;

pub use changes::{ApplyOutcome, Change, ChangeKind, ChangeSet};
pub use error::{StoreError, StoreResult};
pub use object::MeshObject;
pub use store::{ObjectStore, Transaction};
