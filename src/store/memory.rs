//! In-memory store for tests and transports that persist elsewhere.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::session::{Session, SessionId};
use crate::store::{Checkpoint, CheckpointId, CheckpointStore, SessionStore, fork_session};

#[derive(Default)]
struct MemoryInner {
    /// Oldest-first checkpoint ids owned by each session. Shared ancestry
    /// from a fork lives in the source session's chain and is reached
    /// through parent links.
    chains: HashMap<SessionId, Vec<CheckpointId>>,
    /// All checkpoints across all sessions, by id.
    checkpoints: HashMap<CheckpointId, Checkpoint>,
}

impl MemoryInner {
    fn head(&self, session_id: SessionId) -> Option<&Checkpoint> {
        self.chains
            .get(&session_id)
            .and_then(|chain| chain.last())
            .and_then(|id| self.checkpoints.get(id))
    }

    fn push_checkpoint(
        &mut self,
        session_id: SessionId,
        parent_checkpoint_id: Option<CheckpointId>,
        snapshot: Session,
    ) -> CheckpointId {
        let checkpoint_id = Uuid::new_v4();
        self.checkpoints.insert(
            checkpoint_id,
            Checkpoint {
                session_id,
                checkpoint_id,
                parent_checkpoint_id,
                snapshot,
                created_at: Utc::now(),
            },
        );
        self.chains.entry(session_id).or_default().push(checkpoint_id);
        checkpoint_id
    }

    /// Walk parent links from the head back to the root, then reverse.
    fn full_history(&self, session_id: SessionId) -> Result<Vec<Checkpoint>, StoreError> {
        let head = self
            .head(session_id)
            .ok_or(StoreError::NotFound { session_id })?;
        let mut chain = Vec::new();
        let mut cursor = Some(head.checkpoint_id);
        while let Some(id) = cursor {
            let checkpoint = self
                .checkpoints
                .get(&id)
                .ok_or(StoreError::CheckpointNotFound { checkpoint_id: id })?;
            chain.push(checkpoint.clone());
            cursor = checkpoint.parent_checkpoint_id;
        }
        chain.reverse();
        Ok(chain)
    }
}

/// Non-durable store backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Database(anyhow!("store lock poisoned")))
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: Session) -> Result<Session, StoreError> {
        let mut inner = self.lock()?;
        let session_id = session.session_id;
        if inner.chains.contains_key(&session_id) {
            return Err(StoreError::AlreadyExists { session_id });
        }
        let mut genesis = session;
        genesis.version = 0;
        genesis.updated_at = Utc::now();
        inner.push_checkpoint(session_id, None, genesis.clone());
        Ok(genesis)
    }

    async fn load(&self, session_id: SessionId) -> Result<Session, StoreError> {
        let inner = self.lock()?;
        inner
            .head(session_id)
            .map(|checkpoint| checkpoint.snapshot.clone())
            .ok_or(StoreError::NotFound { session_id })
    }

    async fn compare_and_swap(
        &self,
        session_id: SessionId,
        expected_version: u64,
        next: Session,
    ) -> Result<(Session, CheckpointId), StoreError> {
        let mut inner = self.lock()?;
        let head = inner
            .head(session_id)
            .ok_or(StoreError::NotFound { session_id })?;
        let actual = head.snapshot.version;
        if actual != expected_version {
            return Err(StoreError::StaleState {
                session_id,
                expected: expected_version,
                actual,
            });
        }
        let parent = Some(head.checkpoint_id);
        let mut committed = next;
        committed.session_id = session_id;
        committed.version = expected_version + 1;
        committed.updated_at = Utc::now();
        let checkpoint_id = inner.push_checkpoint(session_id, parent, committed.clone());
        Ok((committed, checkpoint_id))
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn append(
        &self,
        session_id: SessionId,
        parent_checkpoint_id: Option<CheckpointId>,
        snapshot: Session,
    ) -> Result<CheckpointId, StoreError> {
        let mut inner = self.lock()?;
        let head_id = inner
            .chains
            .get(&session_id)
            .and_then(|chain| chain.last())
            .copied();
        if parent_checkpoint_id != head_id {
            return Err(StoreError::ParentConflict {
                session_id,
                detail: format!(
                    "parent {:?} is not the current head {:?}",
                    parent_checkpoint_id, head_id
                ),
            });
        }
        Ok(inner.push_checkpoint(session_id, parent_checkpoint_id, snapshot))
    }

    async fn latest(&self, session_id: SessionId) -> Result<Checkpoint, StoreError> {
        let inner = self.lock()?;
        inner
            .head(session_id)
            .cloned()
            .ok_or(StoreError::NotFound { session_id })
    }

    async fn history(&self, session_id: SessionId) -> Result<Vec<Checkpoint>, StoreError> {
        let inner = self.lock()?;
        inner.full_history(session_id)
    }

    async fn history_page(
        &self,
        session_id: SessionId,
        after: Option<CheckpointId>,
        limit: usize,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        let inner = self.lock()?;
        let chain = inner.full_history(session_id)?;
        let start = match after {
            Some(after_id) => {
                let position = chain
                    .iter()
                    .position(|c| c.checkpoint_id == after_id)
                    .ok_or(StoreError::CheckpointNotFound {
                        checkpoint_id: after_id,
                    })?;
                position + 1
            }
            None => 0,
        };
        Ok(chain.into_iter().skip(start).take(limit).collect())
    }

    async fn fork_from(&self, checkpoint_id: CheckpointId) -> Result<Session, StoreError> {
        let mut inner = self.lock()?;
        let source = inner
            .checkpoints
            .get(&checkpoint_id)
            .ok_or(StoreError::CheckpointNotFound { checkpoint_id })?;
        let forked = fork_session(&source.snapshot);
        inner.push_checkpoint(forked.session_id, Some(checkpoint_id), forked.clone());
        Ok(forked)
    }
}
