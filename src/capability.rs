//! Reviewer capability interface.
//!
//! Each pipeline role (drafting, clinical critic, safety guardian, empathy)
//! is an external collaborator behind a single trait. A capability receives
//! an immutable session snapshot plus a distilled [`RoleContext`] and
//! returns a proposed [`CapabilityDelta`]; it never mutates session state
//! itself. The supervisor applies the delta at commit time.
//!
//! Calls are wrapped in a wall-clock timeout and a bounded transient-retry
//! loop. Exhausting the retry budget escalates the failure to
//! [`CapabilityError::Rejected`], which drives the session to FAILED.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ScoreThresholds;
use crate::errors::CapabilityError;
use crate::session::{DebateMessageType, FlagSeverity, FlagType, Role, Session};

/// Distilled per-call context handed to a capability alongside the full
/// session snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleContext {
    pub role: Role,
    pub iteration: u32,
    pub thresholds: ScoreThresholds,
    /// Aggregated gate feedback and human rejection feedback from earlier
    /// passes, oldest first.
    pub revision_notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_feedback: Option<String>,
}

impl RoleContext {
    /// Build the context for invoking `role` against `session`.
    pub fn for_session(session: &Session, role: Role) -> Self {
        Self {
            role,
            iteration: session.iteration_count,
            thresholds: session.config.thresholds,
            revision_notes: session.revision_notes.clone(),
            human_feedback: session.human_feedback.clone(),
        }
    }
}

/// A proposed replacement draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftProposal {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes_summary: Option<String>,
}

/// A proposed finding; the supervisor stamps role, iteration, and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingProposal {
    /// 0-10 scale; clamped on application.
    pub score: f64,
    pub narrative: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// A proposed safety flag; the supervisor assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagProposal {
    pub flag_type: FlagType,
    pub severity: FlagSeverity,
    pub details: String,
}

/// The debate message every capability call contributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_role: Option<Role>,
    pub message: String,
    pub message_type: DebateMessageType,
}

impl DebateMessage {
    /// Broadcast message with the given type.
    pub fn broadcast(message: impl Into<String>, message_type: DebateMessageType) -> Self {
        Self {
            to_role: None,
            message: message.into(),
            message_type,
        }
    }
}

/// The delta a capability proposes for one pipeline pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_draft: Option<DraftProposal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finding: Option<FindingProposal>,
    #[serde(default)]
    pub flags: Vec<FlagProposal>,
    pub debate_message: DebateMessage,
}

impl CapabilityDelta {
    /// Delta carrying only a debate message.
    pub fn new(debate_message: DebateMessage) -> Self {
        Self {
            updated_draft: None,
            finding: None,
            flags: Vec::new(),
            debate_message,
        }
    }

    pub fn with_draft(mut self, content: impl Into<String>, summary: Option<String>) -> Self {
        self.updated_draft = Some(DraftProposal {
            content: content.into(),
            changes_summary: summary,
        });
        self
    }

    pub fn with_finding(mut self, score: f64, narrative: impl Into<String>) -> Self {
        self.finding = Some(FindingProposal {
            score,
            narrative: narrative.into(),
            suggestions: Vec::new(),
        });
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        if let Some(ref mut finding) = self.finding {
            finding.suggestions = suggestions;
        }
        self
    }

    pub fn with_flag(mut self, flag_type: FlagType, severity: FlagSeverity, details: &str) -> Self {
        self.flags.push(FlagProposal {
            flag_type,
            severity,
            details: details.to_string(),
        });
        self
    }
}

/// External evaluator for one reviewer role.
#[async_trait]
pub trait ReviewerCapability: Send + Sync {
    /// The role this capability implements.
    fn role(&self) -> Role;

    /// Evaluate the snapshot and return a proposed delta.
    ///
    /// Implementations must not hold references into the snapshot beyond
    /// the call and must signal failures through [`CapabilityError`]
    /// rather than panicking.
    async fn evaluate(
        &self,
        snapshot: &Session,
        context: &RoleContext,
    ) -> Result<CapabilityDelta, CapabilityError>;
}

/// Static registry mapping the closed reviewer-role set to capability
/// implementations.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<Role, Arc<dyn ReviewerCapability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own role. Non-reviewer roles are
    /// ignored; supervisor and human actions never dispatch through the
    /// registry.
    pub fn register(mut self, capability: Arc<dyn ReviewerCapability>) -> Self {
        let role = capability.role();
        if role.is_reviewer() {
            self.capabilities.insert(role, capability);
        } else {
            warn!(role = %role, "ignoring capability registration for non-reviewer role");
        }
        self
    }

    pub fn get(&self, role: Role) -> Option<Arc<dyn ReviewerCapability>> {
        self.capabilities.get(&role).cloned()
    }

    /// Check if all four reviewer roles are registered.
    pub fn is_complete(&self) -> bool {
        Role::reviewers()
            .iter()
            .all(|role| self.capabilities.contains_key(role))
    }

    /// Roles still missing a capability.
    pub fn missing_roles(&self) -> Vec<Role> {
        Role::reviewers()
            .into_iter()
            .filter(|role| !self.capabilities.contains_key(role))
            .collect()
    }
}

/// Invoke a capability under the session's timeout and retry policy.
///
/// Transient failures (timeout, `Failure`) are retried up to `retries`
/// additional attempts. A `Rejected` failure is returned immediately.
/// Exhausting the transient budget escalates to `Rejected`.
pub(crate) async fn invoke_with_policy(
    capability: &dyn ReviewerCapability,
    snapshot: &Session,
    context: &RoleContext,
    timeout: Duration,
    retries: u32,
) -> Result<CapabilityDelta, CapabilityError> {
    let attempts = retries.saturating_add(1);
    let mut last_transient = String::new();

    for attempt in 1..=attempts {
        let outcome = tokio::time::timeout(timeout, capability.evaluate(snapshot, context)).await;
        match outcome {
            Ok(Ok(delta)) => return Ok(delta),
            Ok(Err(err)) if err.is_transient() => {
                warn!(
                    role = %context.role,
                    attempt,
                    attempts,
                    error = %err,
                    "transient capability failure"
                );
                last_transient = err.to_string();
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                warn!(
                    role = %context.role,
                    attempt,
                    attempts,
                    timeout_secs = timeout.as_secs(),
                    "capability call timed out"
                );
                last_transient = CapabilityError::Timeout.to_string();
            }
        }
    }

    Err(CapabilityError::Rejected {
        reason: format!(
            "transient failure budget exhausted after {} attempts: {}",
            attempts, last_transient
        ),
    })
}
