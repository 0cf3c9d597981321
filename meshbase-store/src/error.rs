//! Error types for the object store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Another transaction is open on this store.
    #[error("a transaction is already active on {0}")]
    TransactionActive(String),

    /// The transaction was opened on a different store.
    #[error("transaction belongs to store {expected}, used with {actual}")]
    WrongStore { expected: String, actual: String },

    /// Object not found.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Object already exists.
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// The write lock for the object is held by another MeshBase.
    #[error("lock for {object} is held by {holder}")]
    NotLockOwner { object: String, holder: String },

    /// Operation not allowed on this object.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}
