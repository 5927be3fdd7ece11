//! Session state model.
//!
//! A [`Session`] is one end-to-end run of the drafting/review pipeline for a
//! single request. It is mutated exclusively through the workflow engine and
//! the approval gate; every committed mutation bumps `version` and produces
//! a new checkpoint, so a session is always the logical projection of the
//! latest checkpoint in its chain.
//!
//! ## Invariants
//!
//! - `iteration_count <= max_iterations` at all times; forced escalation
//!   reaches the bound and halts, it never exceeds it.
//! - `draft_history` versions are strictly increasing with no gaps.
//! - `status` only changes along the edges in [`crate::supervisor`].
//! - `version` strictly increases on every persisted mutation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SessionConfig;

/// Stable identity of a session.
pub type SessionId = Uuid;

/// Roles that can act on a session.
///
/// The four reviewer roles form the fixed pipeline; `Supervisor` and `Human`
/// appear in the debate log and draft history but are never dispatched
/// through the capability registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Drafting,
    ClinicalCritic,
    SafetyGuardian,
    Empathy,
    Supervisor,
    Human,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drafting => "drafting",
            Self::ClinicalCritic => "clinical_critic",
            Self::SafetyGuardian => "safety_guardian",
            Self::Empathy => "empathy",
            Self::Supervisor => "supervisor",
            Self::Human => "human",
        }
    }

    /// Check if this role is dispatched through the capability registry.
    pub fn is_reviewer(&self) -> bool {
        matches!(
            self,
            Self::Drafting | Self::ClinicalCritic | Self::SafetyGuardian | Self::Empathy
        )
    }

    /// The closed set of reviewer roles, in pipeline order.
    pub fn reviewers() -> [Role; 4] {
        [
            Self::Drafting,
            Self::ClinicalCritic,
            Self::SafetyGuardian,
            Self::Empathy,
        ]
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drafting" => Ok(Self::Drafting),
            "clinical_critic" => Ok(Self::ClinicalCritic),
            "safety_guardian" => Ok(Self::SafetyGuardian),
            "empathy" => Ok(Self::Empathy),
            "supervisor" => Ok(Self::Supervisor),
            "human" => Ok(Self::Human),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Workflow status of a session.
///
/// `HumanEditing` is a presentation-layer alias of `PendingHumanReview` used
/// while an editor composes edits; the engine never produces it and treats
/// it exactly like `PendingHumanReview`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Drafting,
    ClinicalReview,
    SafetyReview,
    EmpathyReview,
    Evaluate,
    PendingHumanReview,
    HumanEditing,
    Approved,
    Rejected,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drafting => "drafting",
            Self::ClinicalReview => "clinical_review",
            Self::SafetyReview => "safety_review",
            Self::EmpathyReview => "empathy_review",
            Self::Evaluate => "evaluate",
            Self::PendingHumanReview => "pending_human_review",
            Self::HumanEditing => "human_editing",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }

    /// Terminal states accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Failed)
    }

    /// Check if the session is halted awaiting an external human signal.
    pub fn is_awaiting_human(&self) -> bool {
        matches!(self, Self::PendingHumanReview | Self::HumanEditing)
    }

    /// Check if this is one of the four capability-driven review states.
    pub fn is_review(&self) -> bool {
        matches!(
            self,
            Self::Drafting | Self::ClinicalReview | Self::SafetyReview | Self::EmpathyReview
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drafting" => Ok(Self::Drafting),
            "clinical_review" => Ok(Self::ClinicalReview),
            "safety_review" => Ok(Self::SafetyReview),
            "empathy_review" => Ok(Self::EmpathyReview),
            "evaluate" => Ok(Self::Evaluate),
            "pending_human_review" => Ok(Self::PendingHumanReview),
            "human_editing" => Ok(Self::HumanEditing),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// The original request a session works toward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    /// The request text.
    pub intent: String,
    /// Optional additional context supplied at intake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Goal {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// One versioned entry in the draft history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftVersion {
    /// Strictly increasing, 1-based.
    pub version: u32,
    pub content: String,
    /// Role that contributed this version.
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes_summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Most recent structured feedback from one reviewer role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub role: Role,
    /// 0-10 scale.
    pub score: f64,
    pub narrative: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// Iteration this finding belongs to. Gate evaluation only counts
    /// findings from the current iteration.
    pub iteration: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Severity of a safety flag. Ordering follows declaration order, so
/// `Critical` compares greatest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FlagSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FlagSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// High and critical flags block the quality gate.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for FlagSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kinds of safety concern a flag can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    SelfHarmRisk,
    MedicalAdviceViolation,
    EthicalPolicyBreach,
    InappropriateContent,
    TriggeringLanguage,
    ProfessionalBoundaryIssue,
}

/// A safety concern raised during review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyFlag {
    pub id: Uuid,
    pub flag_type: FlagType,
    pub severity: FlagSeverity,
    pub details: String,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
    pub flagged_at: DateTime<Utc>,
}

/// Classification of a debate message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateMessageType {
    Critique,
    Suggestion,
    Agreement,
    Disagreement,
    Question,
}

/// One inter-role message in the append-only debate log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateEntry {
    pub from_role: Role,
    /// None means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_role: Option<Role>,
    pub message: String,
    pub message_type: DebateMessageType,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
}

/// Record of one supervisor or human routing outcome, kept for operator
/// visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// The status the session was routed to.
    pub decision: SessionStatus,
    pub reasoning: String,
    /// Iteration that was evaluated when the decision was made.
    pub iteration: u32,
    /// True for forced escalation and operator cancellation.
    #[serde(default)]
    pub forced: bool,
    pub decided_at: DateTime<Utc>,
}

/// Why a session reached FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// The role whose capability failed, if the failure came from a
    /// capability call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub reason: String,
}

/// One end-to-end run of the drafting/review pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub goal: Goal,
    pub current_draft: String,
    /// Append-only, strictly increasing versions.
    pub draft_history: Vec<DraftVersion>,
    /// Most recent finding per role.
    pub review_findings: BTreeMap<Role, ReviewFinding>,
    pub unresolved_flags: Vec<SafetyFlag>,
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub status: SessionStatus,
    /// The role expected to act next.
    pub active_role: Role,
    /// Append-only inter-role debate log.
    pub debate_log: Vec<DebateEntry>,
    /// Append-only routing decision log.
    pub decisions: Vec<RoutingDecision>,
    /// Feedback context carried into the next drafting pass.
    pub revision_notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_feedback: Option<String>,
    /// Set when the iteration budget was exhausted without meeting the
    /// thresholds and the session was halted for review anyway.
    #[serde(default)]
    pub force_escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    /// Monotonic concurrency-control token, bumped by the store on commit.
    pub version: u64,
    /// Frozen at creation time.
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a fresh session at the start of the pipeline.
    pub fn new(goal: Goal, config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            goal,
            current_draft: String::new(),
            draft_history: Vec::new(),
            review_findings: BTreeMap::new(),
            unresolved_flags: Vec::new(),
            iteration_count: 0,
            max_iterations: config.max_iterations,
            status: SessionStatus::Drafting,
            active_role: Role::Drafting,
            debate_log: Vec::new(),
            decisions: Vec::new(),
            revision_notes: Vec::new(),
            human_feedback: None,
            force_escalated: false,
            failure: None,
            version: 0,
            config,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replacement snapshot for a session whose stored snapshot can no
    /// longer be read. Carries no recovered state, only the identity and
    /// the failure reason.
    pub fn failed_tombstone(session_id: SessionId, reason: &str) -> Self {
        let mut session = Self::new(Goal::new(""), SessionConfig::default());
        session.session_id = session_id;
        session.status = SessionStatus::Failed;
        session.failure = Some(FailureInfo {
            role: None,
            reason: reason.to_string(),
        });
        session
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Next draft version number. 1-based, gapless.
    pub fn next_draft_version(&self) -> u32 {
        self.draft_history.last().map_or(1, |d| d.version + 1)
    }

    /// Append a new draft version and make it current.
    pub fn record_draft(
        &mut self,
        content: impl Into<String>,
        role: Role,
        changes_summary: Option<String>,
    ) {
        let content = content.into();
        self.draft_history.push(DraftVersion {
            version: self.next_draft_version(),
            content: content.clone(),
            role,
            changes_summary,
            created_at: Utc::now(),
        });
        self.current_draft = content;
    }

    /// Replace the most recent finding for the finding's role.
    pub fn record_finding(&mut self, finding: ReviewFinding) {
        self.review_findings.insert(finding.role, finding);
    }

    /// Finding for a role, only if it belongs to the given iteration.
    pub fn finding_for_iteration(&self, role: Role, iteration: u32) -> Option<&ReviewFinding> {
        self.review_findings
            .get(&role)
            .filter(|f| f.iteration == iteration)
    }

    /// Highest severity among unresolved flags, if any.
    pub fn max_unresolved_severity(&self) -> Option<FlagSeverity> {
        self.unresolved_flags
            .iter()
            .filter(|f| !f.resolved)
            .map(|f| f.severity)
            .max()
    }

    /// Check if any unresolved flag blocks the quality gate.
    pub fn has_blocking_flags(&self) -> bool {
        self.max_unresolved_severity()
            .is_some_and(|s| s.is_blocking())
    }

    /// Latest score per role, for notifications and operator views.
    pub fn scores(&self) -> BTreeMap<Role, f64> {
        self.review_findings
            .iter()
            .map(|(role, finding)| (*role, finding.score))
            .collect()
    }

    /// First `max_chars` characters of the current draft.
    pub fn draft_preview(&self, max_chars: usize) -> String {
        self.current_draft.chars().take(max_chars).collect()
    }
}
