//! Workflow engine: the step executor.
//!
//! `step` executes exactly one supervisor transition for a session as a
//! single optimistic-concurrency attempt: load the session projected from
//! the latest checkpoint, compute the transition (which invokes at most one
//! reviewer capability against the immutable snapshot, with no lock held),
//! and commit the result together with a new checkpoint. A concurrent step
//! for the same session observes `StaleState` and must reload and retry.
//!
//! The engine never blocks waiting for a human: a session in
//! PENDING_HUMAN_REVIEW simply halts, and the approval gate resumes it
//! later through the same store.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::capability::{CapabilityRegistry, RoleContext, invoke_with_policy};
use crate::config::SessionConfig;
use crate::errors::{CapabilityError, EngineError, StoreError};
use crate::session::{Goal, Role, Session, SessionId, SessionStatus};
use crate::store::{CheckpointId, SessionStore, WorkflowStore};
use crate::supervisor::Supervisor;

/// Characters of the current draft included in a step notice.
const DRAFT_PREVIEW_CHARS: usize = 240;

/// Outcome of one `step` call.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// The committed session after the transition (or the unchanged
    /// session when no transition was available).
    pub session: Session,
    /// True when the caller should stop stepping: the session is awaiting
    /// a human signal or has reached a terminal state.
    pub halted: bool,
    /// Checkpoint written by this step; `None` when no transition occurred.
    pub checkpoint_id: Option<CheckpointId>,
}

/// Notification emitted after every committed mutation.
///
/// Delivery is at-least-once; consumers must be idempotent on
/// `(session_id, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNotice {
    pub session_id: SessionId,
    pub version: u64,
    pub status: SessionStatus,
    pub active_role: Role,
    pub iteration_count: u32,
    pub scores: BTreeMap<Role, f64>,
    pub draft_preview: String,
}

impl StepNotice {
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.session_id,
            version: session.version,
            status: session.status,
            active_role: session.active_role,
            iteration_count: session.iteration_count,
            scores: session.scores(),
            draft_preview: session.draft_preview(DRAFT_PREVIEW_CHARS),
        }
    }
}

/// Observer of committed steps.
pub trait StepObserver: Send + Sync {
    fn on_step(&self, notice: &StepNotice);
}

/// Drives sessions through the supervisor state machine.
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    registry: CapabilityRegistry,
    observers: Vec<Arc<dyn StepObserver>>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn WorkflowStore>, registry: CapabilityRegistry) -> Self {
        Self {
            store,
            registry,
            observers: Vec::new(),
        }
    }

    /// Register a step observer. Observers run synchronously after commit.
    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// The store backing this engine, shared with the approval gate.
    pub fn store(&self) -> Arc<dyn WorkflowStore> {
        self.store.clone()
    }

    /// Create a new session at the start of the pipeline and write its
    /// genesis checkpoint.
    pub async fn create_session(
        &self,
        goal: Goal,
        config: SessionConfig,
    ) -> Result<Session, EngineError> {
        let session = self.store.create(Session::new(goal, config)).await?;
        info!(session_id = %session.session_id, "session created");
        self.notify(&session);
        Ok(session)
    }

    /// Execute one supervisor transition.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn step(&self, session_id: SessionId) -> Result<StepResult, EngineError> {
        let observed = match self.store.load(session_id).await {
            Ok(session) => session,
            Err(StoreError::Corruption {
                session_id,
                version,
                detail,
            }) => return self.quarantine(session_id, version, &detail).await,
            Err(err) => return Err(err.into()),
        };

        if observed.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                session_id,
                status: observed.status,
            });
        }
        if observed.status.is_awaiting_human() {
            // No engine transition exists here; the session resumes through
            // the approval gate.
            return Ok(StepResult {
                session: observed,
                halted: true,
                checkpoint_id: None,
            });
        }

        let mut next = observed.clone();
        match observed.status {
            status if status.is_review() => {
                self.run_review(&observed, &mut next, status).await;
            }
            SessionStatus::Evaluate => {
                let evaluation = Supervisor::evaluate_gate(&observed);
                Supervisor::apply_gate(&mut next, &evaluation);
            }
            // Terminal and human-review states are handled above.
            _ => unreachable!("unhandled status {}", observed.status),
        }

        let (committed, checkpoint_id) = self
            .store
            .compare_and_swap(session_id, observed.version, next)
            .await?;
        info!(
            session_id = %session_id,
            version = committed.version,
            status = %committed.status,
            "step committed"
        );
        self.notify(&committed);

        Ok(StepResult {
            halted: committed.status.is_awaiting_human() || committed.status.is_terminal(),
            session: committed,
            checkpoint_id: Some(checkpoint_id),
        })
    }

    /// Run the caller-facing loop: step until halted or terminal, retrying
    /// stale reads. Intended for transports that drive a session in one
    /// task; concurrent drivers for the same session should call `step`
    /// directly and back off on `StaleState`.
    pub async fn run_to_halt(&self, session_id: SessionId) -> Result<StepResult, EngineError> {
        loop {
            match self.step(session_id).await {
                Ok(result) if result.halted => return Ok(result),
                Ok(_) => {}
                Err(EngineError::Store(StoreError::StaleState { .. })) => {
                    // Another driver committed first; reload and continue.
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Invoke the reviewer owning `status` and fold the outcome into
    /// `next`. A permanent capability failure drives the session to FAILED
    /// instead of surfacing as an engine error.
    async fn run_review(&self, observed: &Session, next: &mut Session, status: SessionStatus) {
        let role = match Supervisor::reviewer_for(status) {
            Some(role) => role,
            None => return,
        };
        let Some(capability) = self.registry.get(role) else {
            Supervisor::fail(
                next,
                Some(role),
                &format!("no capability registered for role {}", role),
            );
            return;
        };

        let context = RoleContext::for_session(observed, role);
        let outcome = invoke_with_policy(
            capability.as_ref(),
            observed,
            &context,
            observed.config.capability_timeout,
            observed.config.capability_retries,
        )
        .await;

        match outcome {
            Ok(delta) => Supervisor::apply_review(next, role, delta),
            Err(CapabilityError::Rejected { reason }) => {
                Supervisor::fail(next, Some(role), &reason);
            }
            // Transient errors are consumed by the retry policy; anything
            // else surfacing here is treated as permanent.
            Err(err) => Supervisor::fail(next, Some(role), &err.to_string()),
        }
    }

    /// Mark a session whose head snapshot is unreadable as FAILED, keeping
    /// the chain append-only. The tombstone carries no recovered state;
    /// operators can fork an earlier readable checkpoint to salvage work.
    async fn quarantine(
        &self,
        session_id: SessionId,
        version: u64,
        detail: &str,
    ) -> Result<StepResult, EngineError> {
        warn!(session_id = %session_id, version, detail, "checkpoint corruption detected");
        let tombstone = Session::failed_tombstone(
            session_id,
            &format!("checkpoint corruption: {}", detail),
        );
        let (committed, checkpoint_id) = self
            .store
            .compare_and_swap(session_id, version, tombstone)
            .await?;
        self.notify(&committed);
        Ok(StepResult {
            session: committed,
            halted: true,
            checkpoint_id: Some(checkpoint_id),
        })
    }

    fn notify(&self, session: &Session) {
        if self.observers.is_empty() {
            return;
        }
        let notice = StepNotice::from_session(session);
        for observer in &self.observers {
            observer.on_step(&notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityDelta, DebateMessage, ReviewerCapability};
    use crate::session::DebateMessageType;
    use crate::store::{CheckpointStore, MemoryStore};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct EchoCapability {
        role: Role,
    }

    #[async_trait]
    impl ReviewerCapability for EchoCapability {
        fn role(&self) -> Role {
            self.role
        }

        async fn evaluate(
            &self,
            _snapshot: &Session,
            _context: &RoleContext,
        ) -> Result<CapabilityDelta, CapabilityError> {
            Ok(CapabilityDelta::new(DebateMessage::broadcast(
                "ok",
                DebateMessageType::Agreement,
            ))
            .with_draft("draft", None)
            .with_finding(9.0, "fine"))
        }
    }

    fn full_registry() -> CapabilityRegistry {
        Role::reviewers()
            .into_iter()
            .fold(CapabilityRegistry::new(), |registry, role| {
                registry.register(Arc::new(EchoCapability { role }))
            })
    }

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(Arc::new(MemoryStore::new()), full_registry())
    }

    #[tokio::test]
    async fn test_step_unknown_session_fails() {
        let result = engine().step(Uuid::new_v4()).await;
        assert!(matches!(
            result,
            Err(EngineError::Store(StoreError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_step_on_terminal_session_is_invalid() {
        let engine = engine();
        let session = engine
            .create_session(Goal::new("t"), SessionConfig::default())
            .await
            .unwrap();
        let id = session.session_id;

        let mut next = session.clone();
        next.status = SessionStatus::Approved;
        engine
            .store()
            .compare_and_swap(id, 0, next)
            .await
            .unwrap();

        let result = engine.step(id).await;
        assert!(matches!(
            result,
            Err(EngineError::InvalidTransition {
                status: SessionStatus::Approved,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_step_on_pending_session_is_halted_noop() {
        let engine = engine();
        let session = engine
            .create_session(Goal::new("t"), SessionConfig::default())
            .await
            .unwrap();
        let id = session.session_id;

        let mut next = session.clone();
        next.status = SessionStatus::PendingHumanReview;
        engine
            .store()
            .compare_and_swap(id, 0, next)
            .await
            .unwrap();

        let result = engine.step(id).await.unwrap();
        assert!(result.halted);
        assert!(result.checkpoint_id.is_none());
        assert_eq!(result.session.version, 1);
    }

    #[tokio::test]
    async fn test_step_advances_pipeline_and_checkpoints() {
        let engine = engine();
        let session = engine
            .create_session(Goal::new("t"), SessionConfig::default())
            .await
            .unwrap();
        let id = session.session_id;

        let result = engine.step(id).await.unwrap();
        assert!(!result.halted);
        assert_eq!(result.session.status, SessionStatus::ClinicalReview);
        assert_eq!(result.session.version, 1);
        assert!(result.checkpoint_id.is_some());
        assert_eq!(engine.store().history(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_capability_fails_session() {
        let registry = CapabilityRegistry::new();
        let engine = WorkflowEngine::new(Arc::new(MemoryStore::new()), registry);
        let session = engine
            .create_session(Goal::new("t"), SessionConfig::default())
            .await
            .unwrap();

        let result = engine.step(session.session_id).await.unwrap();
        assert!(result.halted);
        assert_eq!(result.session.status, SessionStatus::Failed);
        let failure = result.session.failure.unwrap();
        assert_eq!(failure.role, Some(Role::Drafting));
        assert!(failure.reason.contains("no capability registered"));
    }
}
