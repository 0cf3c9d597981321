//! Xpriso protocol messages.
//!
//! Every exchange between two NetMeshBases is one request and one
//! response. A single [`XprisoMessage`] can carry any combination of
//! requests (new replicas, resynchronisation, locks, cancellation) and
//! payloads (conveyed objects, a changeset, lock transfers), so a partner
//! can piggy-back several concerns on one round-trip.
//!
//! Requests on one channel are numbered by the sender. The receiver uses
//! the numbering to detect duplicates and out-of-order delivery; the
//! session id changes whenever the sender restarts its channel.

use meshbase_store::{ChangeSet, MeshObject};
use meshbase_types::{
    MeshObjectIdentifier, NetMeshBaseAccessSpecification, NetMeshBaseIdentifier,
    NetMeshObjectAccessSpecification,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// A message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshMessage {
    /// Replication request or response.
    Xpriso(XprisoMessage),

    /// Ping for keepalive.
    Ping(u64),

    /// Pong response.
    Pong(u64),

    /// Error message.
    Error(ErrorMessage),
}

impl MeshMessage {
    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Xpriso(_) => "xpriso",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Error(_) => "error",
        }
    }
}

/// One Xpriso request or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XprisoMessage {
    pub version: u32,
    /// Sender's channel session.
    pub session: Uuid,
    /// Sender's sequence number for requests; 0 until the channel assigns one.
    pub request_id: u64,
    /// Set on responses: the request being answered.
    #[serde(default)]
    pub response_id: Option<u64>,
    pub sender: NetMeshBaseIdentifier,
    pub receiver: NetMeshBaseIdentifier,

    /// Paths, relative to the receiver, the sender wants replicas of.
    #[serde(default)]
    pub requested_first_time: Vec<NetMeshObjectAccessSpecification>,
    /// Replicas the sender no longer wants. On a response: replicas the
    /// responder can no longer serve.
    #[serde(default)]
    pub requested_canceled: Vec<MeshObjectIdentifier>,
    /// Objects sent in full.
    #[serde(default)]
    pub conveyed: Vec<MeshObject>,
    /// Changes made by one committed transaction.
    #[serde(default)]
    pub change_set: Option<ChangeSet>,

    /// Locks the sender asks for.
    #[serde(default)]
    pub requested_locks: Vec<MeshObjectIdentifier>,
    /// Locks the responder proposes to release to the requester.
    #[serde(default)]
    pub pushed_locks: Vec<MeshObjectIdentifier>,
    /// The sender accepts locks pushed to it earlier.
    #[serde(default)]
    pub lock_acknowledgements: Vec<MeshObjectIdentifier>,
    /// The sender has taken these locks without a handshake.
    #[serde(default)]
    pub reclaimed_locks: Vec<MeshObjectIdentifier>,

    /// Replicas the sender wants refreshed.
    #[serde(default)]
    pub requested_resynchronize: Vec<MeshObjectIdentifier>,
    /// Current state of replicas asked for by `requested_resynchronize`.
    #[serde(default)]
    pub resynchronized: Vec<MeshObject>,

    /// Requested paths the responder could not resolve.
    #[serde(default)]
    pub failed_paths: Vec<FailedPath>,

    /// The sender is shutting the channel down.
    #[serde(default)]
    pub cease_communications: bool,
}

impl XprisoMessage {
    /// An empty request from `sender` to `receiver`.
    #[must_use]
    pub fn new(sender: NetMeshBaseIdentifier, receiver: NetMeshBaseIdentifier) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            session: Uuid::nil(),
            request_id: 0,
            response_id: None,
            sender,
            receiver,
            requested_first_time: Vec::new(),
            requested_canceled: Vec::new(),
            conveyed: Vec::new(),
            change_set: None,
            requested_locks: Vec::new(),
            pushed_locks: Vec::new(),
            lock_acknowledgements: Vec::new(),
            reclaimed_locks: Vec::new(),
            requested_resynchronize: Vec::new(),
            resynchronized: Vec::new(),
            failed_paths: Vec::new(),
            cease_communications: false,
        }
    }

    /// An empty response to this request.
    #[must_use]
    pub fn reply(&self) -> Self {
        let mut reply = Self::new(self.receiver.clone(), self.sender.clone());
        reply.session = self.session;
        reply.response_id = Some(self.request_id);
        reply
    }

    /// Whether the message carries nothing besides its addressing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requested_first_time.is_empty()
            && self.requested_canceled.is_empty()
            && self.conveyed.is_empty()
            && self.change_set.is_none()
            && self.requested_locks.is_empty()
            && self.pushed_locks.is_empty()
            && self.lock_acknowledgements.is_empty()
            && self.reclaimed_locks.is_empty()
            && self.requested_resynchronize.is_empty()
            && self.resynchronized.is_empty()
            && self.failed_paths.is_empty()
            && !self.cease_communications
    }
}

/// A requested path the responder could not resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPath {
    /// The path as it was requested.
    pub path: NetMeshObjectAccessSpecification,
    /// Hops that failed further along. Empty if the responder itself failed.
    pub failed_hops: Vec<NetMeshBaseAccessSpecification>,
    /// One of the [`ErrorMessage`] codes.
    pub code: u32,
    pub reason: String,
}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code.
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorMessage {
    pub const VERSION_MISMATCH: u32 = 1;
    pub const UNKNOWN_OBJECT: u32 = 2;
    pub const RELAY_UNSUPPORTED: u32 = 3;
    pub const PROTOCOL_VIOLATION: u32 = 4;
    pub const DUPLICATE: u32 = 5;
    pub const QUARANTINED: u32 = 6;
    pub const ACCESS_FAILED: u32 = 7;
    pub const INTERNAL: u32 = 99;

    /// Creates a new error message.
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Version mismatch error.
    #[must_use]
    pub fn version_mismatch(expected: u32, got: u32) -> Self {
        Self::new(
            Self::VERSION_MISMATCH,
            format!("protocol version mismatch: expected {expected}, got {got}"),
        )
    }

    #[must_use]
    pub fn unknown_object(id: &MeshObjectIdentifier) -> Self {
        Self::new(Self::UNKNOWN_OBJECT, format!("unknown object: {id}"))
    }

    #[must_use]
    pub fn relay_unsupported(owner: &NetMeshBaseIdentifier) -> Self {
        Self::new(
            Self::RELAY_UNSUPPORTED,
            format!("{owner} does not relay requests"),
        )
    }

    pub fn protocol_violation(reason: impl Into<String>) -> Self {
        Self::new(Self::PROTOCOL_VIOLATION, reason)
    }

    #[must_use]
    pub fn duplicate(request_id: u64, last: u64) -> Self {
        Self::new(
            Self::DUPLICATE,
            format!("request {request_id} already superseded by {last}"),
        )
    }

    pub fn quarantined(reason: impl Into<String>) -> Self {
        Self::new(Self::QUARANTINED, reason)
    }

    /// Internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL, msg)
    }
}
