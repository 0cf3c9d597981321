//! Error types for the replication layer.

use meshbase_store::{MeshObject, StoreError};
use meshbase_types::{NetMeshBaseAccessSpecification, ParseError};
use thiserror::Error;

/// Result type for replication operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while talking to partner MeshBases.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// Protocol error (malformed or unexpected message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A partner broke the changeset or lock protocol.
    #[error("protocol violation by {partner}: {reason}")]
    ProtocolViolation { partner: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Persistence error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Malformed external form.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The partner answered with an error message.
    #[error("peer error {code}: {message}")]
    Peer { code: u32, message: String },

    /// A relaying partner could not reach the rest of the path.
    #[error("relay through {via} failed: {reason}")]
    RelayFailed { via: String, reason: String },

    /// No route to the partner.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// The proxy stopped trusting its partner.
    #[error("proxy to {partner} is quarantined: {reason}")]
    Quarantined { partner: String, reason: String },

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Whether the channel retries the request after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network(_))
    }

    /// Whether this error counts against the channel's failure limit.
    #[must_use]
    pub const fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network(_) | Self::PeerNotFound(_) | Self::ChannelClosed
        )
    }
}

/// Resolving an access path failed at some hop.
///
/// Carries whatever was resolved before the failing hop so callers can
/// degrade gracefully instead of discarding all progress.
#[derive(Debug, Error)]
#[error("access failed at {} hop(s): {cause}", .failed.len())]
pub struct AccessError {
    /// Objects obtained before the failure, closest hop first.
    pub partial: Vec<MeshObject>,
    /// The hops that could not be resolved.
    pub failed: Vec<NetMeshBaseAccessSpecification>,
    #[source]
    pub cause: SyncError,
}

impl AccessError {
    #[must_use]
    pub const fn new(
        partial: Vec<MeshObject>,
        failed: Vec<NetMeshBaseAccessSpecification>,
        cause: SyncError,
    ) -> Self {
        Self {
            partial,
            failed,
            cause,
        }
    }

    /// Failure at a single hop with nothing resolved.
    #[must_use]
    pub fn at_hop(hop: &NetMeshBaseAccessSpecification, cause: SyncError) -> Self {
        Self::new(Vec::new(), vec![hop.clone()], cause)
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, SyncError::Timeout)
    }
}
