//! Typed error hierarchy for the foundry engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — session/checkpoint store failures, including the
//!   optimistic-concurrency conflict (`StaleState`)
//! - `CapabilityError` — reviewer capability failures, split into
//!   transient (retryable) and permanent variants
//! - `EngineError` — step executor and human-boundary failures
//!
//! `StaleState` is not a user-facing failure: the caller is expected to
//! reload the session and retry the whole operation. `Rejected` capability
//! failures and checkpoint corruption terminate the session visibly.

use thiserror::Error;

use crate::session::{SessionId, SessionStatus};
use crate::store::CheckpointId;

/// Errors from the session and checkpoint store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {session_id} not found")]
    NotFound { session_id: SessionId },

    #[error("session {session_id} already exists")]
    AlreadyExists { session_id: SessionId },

    #[error("stale state for session {session_id}: expected version {expected}, found {actual}")]
    StaleState {
        session_id: SessionId,
        expected: u64,
        actual: u64,
    },

    #[error("checkpoint {checkpoint_id} not found")]
    CheckpointNotFound { checkpoint_id: CheckpointId },

    #[error("checkpoint parent conflict for session {session_id}: {detail}")]
    ParentConflict {
        session_id: SessionId,
        detail: String,
    },

    /// The stored snapshot can no longer be deserialized. `version` is the
    /// last committed version read from the session head, so the caller can
    /// still issue a versioned mutation to mark the session failed.
    #[error("checkpoint snapshot for session {session_id} is unreadable: {detail}")]
    Corruption {
        session_id: SessionId,
        version: u64,
        detail: String,
    },

    #[error("database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Failure modes of a reviewer capability call.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// The capability did not return within its configured bound.
    #[error("capability call timed out")]
    Timeout,

    /// Transient failure, retryable up to the configured bound.
    #[error("capability call failed: {0}")]
    Failure(String),

    /// Permanent failure. The session is driven to FAILED.
    #[error("capability rejected the request: {reason}")]
    Rejected { reason: String },
}

impl CapabilityError {
    /// Transient errors are retried; `Rejected` is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Failure(_))
    }
}

/// Errors from the workflow engine and the human-interrupt boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The requested operation is incompatible with the session's current
    /// status. The session is left unchanged.
    #[error("invalid transition: session {session_id} is {status}")]
    InvalidTransition {
        session_id: SessionId,
        status: SessionStatus,
    },

    /// Approval was requested for a force-escalated session while the
    /// session's configuration disallows escalated approval.
    #[error("approval blocked: session {session_id} was force-escalated past its iteration budget")]
    ApprovalBlocked { session_id: SessionId },
}
