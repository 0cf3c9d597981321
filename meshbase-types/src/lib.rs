//! Core type definitions for NetMeshBase replication.
//!
//! This crate defines the value types that locate and describe replicas
//! across independently-administered NetMeshBases:
//! - NetMeshBase identifiers and the factory that parses them
//! - MeshObject identifiers (home object, local and global forms)
//! - Coherence and scope policies
//! - Single-hop and multi-hop access specifications
//!
//! Everything here is immutable, side-effect free and safe to share across
//! threads. The replication engine that consumes these types lives in
//! `meshbase-sync`.

mod access;
mod coherence;
mod identifier;
mod object_access;
mod object_id;
mod scope;

pub use access::{NetMeshBaseAccessSpecification, COHERENCE_KEYWORD, SCOPE_KEYWORD};
pub use coherence::{
    CoherenceDefaults, CoherenceSpecification, ADAPTIVE_PERIODIC_TAG, ONE_TIME_ONLY_TAG,
    PERIODIC_TAG,
};
pub use identifier::{
    is_xri_global_context_symbol, NetMeshBaseIdentifier, NetMeshBaseIdentifierFactory, Protocol,
    DEFAULT_XRI_RESOLVER_PREFIX,
};
pub use object_access::{NetMeshObjectAccessSpecification, ESCAPED_HASH};
pub use object_id::{
    DefaultMeshObjectIdentifierFactory, MeshObjectIdentifier, MeshObjectIdentifierFactory,
    OBJECT_SEPARATOR,
};
pub use scope::{ScopeSpecification, SCOPE_TAG};

/// Result type alias for parsing operations.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Errors raised while parsing an external form.
///
/// Always recoverable by the caller: reject the input and ask for a
/// corrected one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid identifier {input:?}: {reason}")]
    InvalidIdentifier { input: String, reason: String },

    #[error("canonical identifier uses unknown protocol (need one of {supported}), is {input:?}")]
    UnsupportedProtocol { input: String, supported: String },

    #[error("invalid scope specification: {0}")]
    InvalidScope(String),

    #[error("invalid object identifier {input:?}: {reason}")]
    InvalidObjectIdentifier { input: String, reason: String },

    #[error("invalid URL argument: {0}")]
    InvalidArgument(String),
}

impl ParseError {
    pub(crate) fn identifier(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            input: input.into(),
            reason: reason.into(),
        }
    }
}
