//! Replication between NetMeshBases.
//!
//! A [`NetMeshBase`] keeps one [`Proxy`] per partner MeshBase. Proxies
//! obtain replicas, keep them coherent on a per-replica schedule, move
//! write locks between MeshBases and push committed changes to every
//! partner that replicates the touched objects. Requests travel as
//! [`protocol::XprisoMessage`]s over any [`MeshTransport`]: the in-process
//! [`LocalNetwork`] or length-prefixed JSON over TCP ([`tcp`]).
//!
//! Multi-hop access paths are resolved by relaying: the first hop is asked
//! to resolve the rest of the path on our behalf. Failures report what was
//! resolved before the failing hop, see [`AccessError`].

mod channel;
pub mod codec;
mod config;
mod error;
mod lock;
mod meshbase;
pub mod protocol;
mod proxy;
mod proxy_store;
mod registry;
mod schedule;
pub mod tcp;
pub mod transport;

pub use channel::PendingReply;
pub use config::{NetMeshBaseConfig, RetryPolicy};
pub use error::{AccessError, SyncError, SyncResult};
pub use lock::{LockState, LockTransitionError};
pub use meshbase::NetMeshBase;
pub use protocol::{ErrorMessage, FailedPath, MeshMessage, XprisoMessage, PROTOCOL_VERSION};
pub use proxy::{ExternalizedProxy, ObtainOutcome, Proxy, RefreshOutcome, ReplicaEntry, ServedEntry};
pub use proxy_store::ProxyStore;
pub use registry::ProxyManager;
pub use schedule::{Clock, RefreshSchedule, RefreshState};
pub use tcp::{serve, AddressBook, TcpTransport};
pub use transport::{LocalNetwork, MeshTransport, MessageHandler, NameServer};
