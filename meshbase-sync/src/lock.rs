//! Write-lock handshake.
//!
//! A lock moves between two MeshBases in two phases: the holder proposes
//! to release it, the requester acknowledges. The holder stays
//! authoritative until the acknowledgement arrives; the requester may
//! write only after its acknowledgement was delivered. A requester whose
//! acknowledgement could not be delivered does not know who holds the
//! lock and must not write until the lock is reclaimed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where the write lock of one replicated object is, as seen by one side
/// of one proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    HeldLocally,
    HeldRemotely,
    /// We offered the lock to the partner and wait for its acknowledgement.
    ReleaseProposed,
    /// The handshake broke off; nobody knows where the lock is.
    Unconfirmed { since_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockTransitionError {
    #[error("lock is not held here ({0:?})")]
    NotHeld(LockState),
    #[error("acknowledgement without a proposed release ({0:?})")]
    NotProposed(LockState),
}

impl LockState {
    /// Whether the local side is authoritative.
    #[must_use]
    pub const fn allows_local_writes(&self) -> bool {
        matches!(self, Self::HeldLocally | Self::ReleaseProposed)
    }

    #[must_use]
    pub const fn is_unconfirmed(&self) -> bool {
        matches!(self, Self::Unconfirmed { .. })
    }

    /// Holder side: the partner asked for the lock. Proposing twice is
    /// allowed so a retried request gets the same answer.
    pub fn propose_release(&mut self) -> Result<(), LockTransitionError> {
        match self {
            Self::HeldLocally | Self::ReleaseProposed => {
                *self = Self::ReleaseProposed;
                Ok(())
            }
            other => Err(LockTransitionError::NotHeld(*other)),
        }
    }

    /// Holder side: the partner acknowledged our proposal.
    pub fn accept_acknowledgement(&mut self) -> Result<(), LockTransitionError> {
        match self {
            Self::ReleaseProposed => {
                *self = Self::HeldRemotely;
                Ok(())
            }
            other => Err(LockTransitionError::NotProposed(*other)),
        }
    }

    /// Requester side: our acknowledgement was delivered, or we reclaimed.
    pub fn acquire(&mut self) {
        *self = Self::HeldLocally;
    }

    /// Requester side: the acknowledgement could not be delivered.
    pub fn mark_unconfirmed(&mut self, now_ms: u64) {
        if !self.is_unconfirmed() {
            *self = Self::Unconfirmed { since_ms: now_ms };
        }
    }

    /// The partner took the lock.
    pub fn surrender(&mut self) {
        *self = Self::HeldRemotely;
    }

    /// Whether an unconfirmed lock has waited at least `delay_ms`.
    #[must_use]
    pub const fn reclaim_due(&self, now_ms: u64, delay_ms: u64) -> bool {
        match self {
            Self::Unconfirmed { since_ms } => now_ms >= (*since_ms).saturating_add(delay_ms),
            _ => false,
        }
    }
}
