//! Session and checkpoint persistence.
//!
//! The store is the only shared mutable resource in the system. All
//! mutation flows through `compare_and_swap` on the session's version
//! token, and every successful commit appends exactly one checkpoint in the
//! same critical section, so the chain and the session head can never
//! diverge. A session is the logical projection of the latest checkpoint
//! in its chain.
//!
//! Two implementations are provided: [`MemoryStore`] for tests and
//! transports that persist elsewhere, and [`SqliteStore`] for durable
//! single-node deployments.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::session::{Session, SessionId};

/// Stable identity of a checkpoint.
pub type CheckpointId = Uuid;

/// Version tag embedded in every serialized snapshot.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Immutable snapshot of a session at one committed mutation.
///
/// Checkpoints form a singly-linked append-only chain per session; the
/// chain is the audit trail and the resumability substrate. A forked
/// session's first checkpoint points at a checkpoint of the source
/// session, so ancestry is shared rather than copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: SessionId,
    pub checkpoint_id: CheckpointId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<CheckpointId>,
    pub snapshot: Session,
    pub created_at: DateTime<Utc>,
}

/// Read and atomically mutate sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Register a new session and write its genesis checkpoint. The session
    /// must be at version 0.
    async fn create(&self, session: Session) -> Result<Session, StoreError>;

    /// Load the session projected from the latest checkpoint.
    async fn load(&self, session_id: SessionId) -> Result<Session, StoreError>;

    /// Atomically commit `next` iff the stored version equals
    /// `expected_version`, else fail with `StaleState`.
    ///
    /// The store bumps the version and refreshes `updated_at` itself, so
    /// callers pass `next` with their domain mutations only. The checkpoint
    /// for the commit is appended in the same critical section; the
    /// returned pair is the committed session and its checkpoint id.
    async fn compare_and_swap(
        &self,
        session_id: SessionId,
        expected_version: u64,
        next: Session,
    ) -> Result<(Session, CheckpointId), StoreError>;
}

/// Append-only checkpoint chains.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a snapshot whose parent must be the current head of the
    /// session's chain, else fail with `ParentConflict`.
    async fn append(
        &self,
        session_id: SessionId,
        parent_checkpoint_id: Option<CheckpointId>,
        snapshot: Session,
    ) -> Result<CheckpointId, StoreError>;

    /// The head checkpoint of the session's chain.
    async fn latest(&self, session_id: SessionId) -> Result<Checkpoint, StoreError>;

    /// Full chain oldest-first, including ancestry shared with a fork
    /// source.
    async fn history(&self, session_id: SessionId) -> Result<Vec<Checkpoint>, StoreError>;

    /// Restartable page of the chain: up to `limit` checkpoints strictly
    /// after `after` (or from the oldest when `after` is `None`),
    /// oldest-first. Resume by passing the last returned checkpoint id.
    async fn history_page(
        &self,
        session_id: SessionId,
        after: Option<CheckpointId>,
        limit: usize,
    ) -> Result<Vec<Checkpoint>, StoreError>;

    /// Start a new session lineage from an existing checkpoint.
    ///
    /// The new session gets a fresh id and version 0 but otherwise equals
    /// the snapshot at `checkpoint_id`; its genesis checkpoint's parent is
    /// that checkpoint, so prior history stays reachable for audit.
    async fn fork_from(&self, checkpoint_id: CheckpointId) -> Result<Session, StoreError>;
}

/// Combined store surface consumed by the engine and the approval gate.
pub trait WorkflowStore: SessionStore + CheckpointStore {}

impl<T: SessionStore + CheckpointStore> WorkflowStore for T {}

/// Rebind a snapshot as the head of a forked lineage.
pub(crate) fn fork_session(snapshot: &Session) -> Session {
    let mut forked = snapshot.clone();
    forked.session_id = Uuid::new_v4();
    forked.version = 0;
    forked.updated_at = Utc::now();
    forked
}
