//! Human-interrupt boundary.
//!
//! A session halted in PENDING_HUMAN_REVIEW resumes only through this
//! gate. Approve and reject are versioned mutations under the same
//! compare-and-swap discipline as engine steps, so a decision made against
//! a stale view is rejected rather than silently overwriting newer state.
//! Operator cancellation is exposed here as well and is valid from any
//! non-terminal status.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::errors::EngineError;
use crate::session::{
    DebateEntry, DebateMessageType, Role, RoutingDecision, Session, SessionId, SessionStatus,
};
use crate::store::{SessionStore, WorkflowStore};
use crate::supervisor::Supervisor;

/// Where an operator cancellation lands the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Rejected,
    Failed,
}

/// External approval interface over the shared store.
pub struct ApprovalGate {
    store: Arc<dyn WorkflowStore>,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// Approve a session awaiting human review.
    ///
    /// Optional edits replace the current draft as a new human-attributed
    /// version without re-entering the pipeline. Fails with
    /// `ApprovalBlocked` when the session was force-escalated and its
    /// configuration disallows escalated approval.
    pub async fn approve(
        &self,
        session_id: SessionId,
        expected_version: u64,
        feedback: Option<&str>,
        edits: Option<&str>,
    ) -> Result<Session, EngineError> {
        let session = self.load_awaiting(session_id).await?;
        if session.force_escalated && !session.config.allow_escalated_approval {
            return Err(EngineError::ApprovalBlocked { session_id });
        }

        let mut next = session;
        if let Some(edits) = edits {
            next.record_draft(edits, Role::Human, Some("edits applied at approval".into()));
        }
        if let Some(feedback) = feedback {
            next.human_feedback = Some(feedback.to_string());
        }
        Self::record_verdict(
            &mut next,
            SessionStatus::Approved,
            "approved by human reviewer",
        );
        next.status = SessionStatus::Approved;
        next.active_role = Role::Human;

        let (committed, _) = self
            .store
            .compare_and_swap(session_id, expected_version, next)
            .await?;
        info!(session_id = %session_id, "session approved");
        Ok(committed)
    }

    /// Reject a session awaiting human review, sending it back through the
    /// pipeline with the reviewer's feedback in context.
    ///
    /// The iteration counter advances but never past the configured bound.
    pub async fn reject(
        &self,
        session_id: SessionId,
        expected_version: u64,
        feedback: &str,
        edits: Option<&str>,
    ) -> Result<Session, EngineError> {
        let session = self.load_awaiting(session_id).await?;

        let mut next = session;
        if let Some(edits) = edits {
            next.record_draft(edits, Role::Human, Some("revision sent back for review".into()));
        }
        next.human_feedback = Some(feedback.to_string());
        next.revision_notes
            .push(format!("human reviewer: {}", feedback));
        next.iteration_count = (next.iteration_count + 1).min(next.max_iterations);
        Self::record_verdict(
            &mut next,
            SessionStatus::Drafting,
            &format!("rejected by human reviewer: {}", feedback),
        );
        next.status = SessionStatus::Drafting;
        next.active_role = Role::Drafting;

        let (committed, _) = self
            .store
            .compare_and_swap(session_id, expected_version, next)
            .await?;
        info!(
            session_id = %session_id,
            iteration = committed.iteration_count,
            "session rejected back to drafting"
        );
        Ok(committed)
    }

    /// Force a session out of the pipeline from any non-terminal status.
    pub async fn cancel(
        &self,
        session_id: SessionId,
        expected_version: u64,
        outcome: CancelOutcome,
        reason: &str,
    ) -> Result<Session, EngineError> {
        let session = self.store.load(session_id).await?;
        if session.is_terminal() {
            return Err(EngineError::InvalidTransition {
                session_id,
                status: session.status,
            });
        }

        let mut next = session;
        match outcome {
            CancelOutcome::Failed => {
                Supervisor::fail(&mut next, None, &format!("cancelled by operator: {}", reason));
            }
            CancelOutcome::Rejected => {
                next.decisions.push(RoutingDecision {
                    decision: SessionStatus::Rejected,
                    reasoning: format!("cancelled by operator: {}", reason),
                    iteration: next.iteration_count,
                    forced: true,
                    decided_at: Utc::now(),
                });
                next.status = SessionStatus::Rejected;
                next.active_role = Role::Supervisor;
            }
        }

        let (committed, _) = self
            .store
            .compare_and_swap(session_id, expected_version, next)
            .await?;
        info!(
            session_id = %session_id,
            status = %committed.status,
            "session cancelled by operator"
        );
        Ok(committed)
    }

    async fn load_awaiting(&self, session_id: SessionId) -> Result<Session, EngineError> {
        let session = self.store.load(session_id).await?;
        if !session.status.is_awaiting_human() {
            return Err(EngineError::InvalidTransition {
                session_id,
                status: session.status,
            });
        }
        Ok(session)
    }

    fn record_verdict(session: &mut Session, decision: SessionStatus, reasoning: &str) {
        let now = Utc::now();
        session.decisions.push(RoutingDecision {
            decision,
            reasoning: reasoning.to_string(),
            iteration: session.iteration_count,
            forced: session.force_escalated,
            decided_at: now,
        });
        session.debate_log.push(DebateEntry {
            from_role: Role::Human,
            to_role: None,
            message: reasoning.to_string(),
            message_type: DebateMessageType::Suggestion,
            iteration: session.iteration_count,
            timestamp: now,
        });
    }
}
