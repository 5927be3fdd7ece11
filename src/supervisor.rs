//! Supervisor state machine.
//!
//! The supervisor owns the routing policy: which role acts in each status,
//! which status follows a completed review, and what the quality gate
//! decides at EVALUATE. All legal edges are enumerated in a static
//! transition table so every path is checkable; the engine and the approval
//! gate both validate against it before committing.
//!
//! Gate policy: the thresholds are evaluated against findings of the
//! current iteration only, and any unresolved flag of high or critical
//! severity blocks promotion regardless of scores.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::capability::CapabilityDelta;
use crate::session::{
    DebateEntry, DebateMessageType, FailureInfo, ReviewFinding, Role, RoutingDecision, SafetyFlag,
    Session, SessionStatus,
};
use uuid::Uuid;

/// Outcome of the quality gate at EVALUATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Thresholds met, no blocking flags. Halt for human review.
    Promote,
    /// Thresholds unmet, iteration budget remains. Another pass.
    Revise,
    /// Thresholds unmet, iteration budget exhausted. Halt for human review
    /// with the forced-escalation marker set.
    Escalate,
}

/// Gate outcome plus the evidence behind it.
#[derive(Debug, Clone)]
pub struct GateEvaluation {
    pub outcome: GateOutcome,
    /// Human-readable reasons the gate did not pass; empty on `Promote`.
    pub unmet: Vec<String>,
}

impl GateEvaluation {
    /// One-line reasoning string for logs and the decision record.
    pub fn reasoning(&self) -> String {
        match self.outcome {
            GateOutcome::Promote => "all thresholds met with no blocking flags".to_string(),
            GateOutcome::Revise => format!("thresholds unmet: {}", self.unmet.join("; ")),
            GateOutcome::Escalate => format!(
                "iteration budget exhausted with thresholds unmet: {}",
                self.unmet.join("; ")
            ),
        }
    }
}

/// Stateless routing and gating policy.
pub struct Supervisor;

impl Supervisor {
    /// Statuses reachable from `from` in one committed mutation.
    ///
    /// FAILED is reachable from every non-terminal status (capability
    /// rejection, corruption, operator cancellation); REJECTED is reachable
    /// from every non-terminal status via operator cancellation and from
    /// the human-review states via an explicit reject.
    pub fn successors(from: SessionStatus) -> &'static [SessionStatus] {
        use SessionStatus::*;
        match from {
            Drafting => &[ClinicalReview, Failed, Rejected],
            ClinicalReview => &[SafetyReview, Failed, Rejected],
            SafetyReview => &[EmpathyReview, Failed, Rejected],
            EmpathyReview => &[Evaluate, Failed, Rejected],
            Evaluate => &[PendingHumanReview, Drafting, Failed, Rejected],
            PendingHumanReview | HumanEditing => &[Approved, Drafting, Rejected, Failed],
            Approved | Rejected | Failed => &[],
        }
    }

    /// Check if `from -> to` is a legal edge.
    pub fn edge_allowed(from: SessionStatus, to: SessionStatus) -> bool {
        Self::successors(from).contains(&to)
    }

    /// The reviewer role that acts while the session is in `status`.
    pub fn reviewer_for(status: SessionStatus) -> Option<Role> {
        match status {
            SessionStatus::Drafting => Some(Role::Drafting),
            SessionStatus::ClinicalReview => Some(Role::ClinicalCritic),
            SessionStatus::SafetyReview => Some(Role::SafetyGuardian),
            SessionStatus::EmpathyReview => Some(Role::Empathy),
            _ => None,
        }
    }

    /// The status that follows a completed review pass in `status`.
    fn status_after_review(status: SessionStatus) -> Option<SessionStatus> {
        match status {
            SessionStatus::Drafting => Some(SessionStatus::ClinicalReview),
            SessionStatus::ClinicalReview => Some(SessionStatus::SafetyReview),
            SessionStatus::SafetyReview => Some(SessionStatus::EmpathyReview),
            SessionStatus::EmpathyReview => Some(SessionStatus::Evaluate),
            _ => None,
        }
    }

    /// Merge a capability delta into the session and advance to the next
    /// pipeline status.
    ///
    /// Stamps proposals with the acting role, current iteration, fresh flag
    /// ids, and timestamps. Scores are clamped to the 0-10 scale.
    pub fn apply_review(session: &mut Session, role: Role, delta: CapabilityDelta) {
        let iteration = session.iteration_count;
        let now = Utc::now();

        if let Some(draft) = delta.updated_draft {
            session.record_draft(draft.content, role, draft.changes_summary);
        }
        if let Some(proposal) = delta.finding {
            session.record_finding(ReviewFinding {
                role,
                score: proposal.score.clamp(0.0, 10.0),
                narrative: proposal.narrative,
                suggestions: proposal.suggestions,
                iteration,
                recorded_at: now,
            });
        }
        for flag in delta.flags {
            session.unresolved_flags.push(SafetyFlag {
                id: Uuid::new_v4(),
                flag_type: flag.flag_type,
                severity: flag.severity,
                details: flag.details,
                resolved: false,
                resolution_notes: None,
                flagged_at: now,
            });
        }
        session.debate_log.push(DebateEntry {
            from_role: role,
            to_role: delta.debate_message.to_role,
            message: delta.debate_message.message,
            message_type: delta.debate_message.message_type,
            iteration,
            timestamp: now,
        });

        let next = Self::status_after_review(session.status)
            .unwrap_or(session.status);
        debug!(
            session_id = %session.session_id,
            role = %role,
            from = %session.status,
            to = %next,
            "review pass applied"
        );
        session.status = next;
        session.active_role = Self::reviewer_for(next).unwrap_or(Role::Supervisor);
    }

    /// Evaluate the quality gate against the current iteration's findings.
    pub fn evaluate_gate(session: &Session) -> GateEvaluation {
        let thresholds = &session.config.thresholds;
        let iteration = session.iteration_count;
        let mut unmet = Vec::new();

        let required = [
            (Role::SafetyGuardian, thresholds.safety),
            (Role::ClinicalCritic, thresholds.clinical),
            (Role::Empathy, thresholds.empathy),
        ];
        for (role, minimum) in required {
            match session.finding_for_iteration(role, iteration) {
                Some(finding) if finding.score >= minimum => {}
                Some(finding) => unmet.push(format!(
                    "{} score {:.1} below threshold {:.1}",
                    role, finding.score, minimum
                )),
                None => unmet.push(format!(
                    "no {} finding recorded for iteration {}",
                    role, iteration
                )),
            }
        }

        if let Some(severity) = session.max_unresolved_severity() {
            if severity.is_blocking() {
                unmet.push(format!("unresolved {} severity safety flag", severity));
            }
        }

        let outcome = if unmet.is_empty() {
            GateOutcome::Promote
        } else if session.iteration_count < session.max_iterations {
            GateOutcome::Revise
        } else {
            GateOutcome::Escalate
        };

        GateEvaluation { outcome, unmet }
    }

    /// Apply a gate evaluation at EVALUATE.
    ///
    /// `Revise` increments the iteration counter and appends the aggregated
    /// findings to the revision notes for the next pass. `Escalate` halts at
    /// the bound without incrementing and sets the forced marker.
    pub fn apply_gate(session: &mut Session, evaluation: &GateEvaluation) {
        let evaluated_iteration = session.iteration_count;
        let now = Utc::now();
        let reasoning = evaluation.reasoning();

        let decision = match evaluation.outcome {
            GateOutcome::Promote => {
                info!(
                    session_id = %session.session_id,
                    iteration = evaluated_iteration,
                    "gate passed, halting for human review"
                );
                session.status = SessionStatus::PendingHumanReview;
                session.active_role = Role::Human;
                SessionStatus::PendingHumanReview
            }
            GateOutcome::Revise => {
                let note = Self::revision_note(session, evaluated_iteration, &evaluation.unmet);
                session.iteration_count += 1;
                session.revision_notes.push(note);
                debug!(
                    session_id = %session.session_id,
                    iteration = session.iteration_count,
                    "gate unmet, routing back to drafting"
                );
                session.status = SessionStatus::Drafting;
                session.active_role = Role::Drafting;
                SessionStatus::Drafting
            }
            GateOutcome::Escalate => {
                warn!(
                    session_id = %session.session_id,
                    iteration = evaluated_iteration,
                    max_iterations = session.max_iterations,
                    "iteration budget exhausted, forcing human review"
                );
                session.force_escalated = true;
                session.status = SessionStatus::PendingHumanReview;
                session.active_role = Role::Human;
                SessionStatus::PendingHumanReview
            }
        };

        session.decisions.push(RoutingDecision {
            decision,
            reasoning: reasoning.clone(),
            iteration: evaluated_iteration,
            forced: evaluation.outcome == GateOutcome::Escalate,
            decided_at: now,
        });
        session.debate_log.push(DebateEntry {
            from_role: Role::Supervisor,
            to_role: None,
            message: reasoning,
            message_type: DebateMessageType::Suggestion,
            iteration: evaluated_iteration,
            timestamp: now,
        });
    }

    /// Drive the session to FAILED, recording the failing role and reason.
    pub fn fail(session: &mut Session, role: Option<Role>, reason: &str) {
        warn!(
            session_id = %session.session_id,
            role = role.map(|r| r.as_str()).unwrap_or("none"),
            reason,
            "session failed"
        );
        session.decisions.push(RoutingDecision {
            decision: SessionStatus::Failed,
            reasoning: reason.to_string(),
            iteration: session.iteration_count,
            forced: false,
            decided_at: Utc::now(),
        });
        session.status = SessionStatus::Failed;
        session.active_role = Role::Supervisor;
        session.failure = Some(FailureInfo {
            role,
            reason: reason.to_string(),
        });
    }

    /// Aggregate the evaluated iteration's findings into one note the next
    /// drafting pass can act on.
    fn revision_note(session: &Session, iteration: u32, unmet: &[String]) -> String {
        let mut parts = vec![format!(
            "iteration {} gate: {}",
            iteration,
            unmet.join("; ")
        )];
        for role in [Role::ClinicalCritic, Role::SafetyGuardian, Role::Empathy] {
            if let Some(finding) = session.finding_for_iteration(role, iteration) {
                if !finding.suggestions.is_empty() {
                    parts.push(format!(
                        "{} suggests: {}",
                        role,
                        finding.suggestions.join("; ")
                    ));
                }
            }
        }
        parts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityDelta, DebateMessage};
    use crate::config::SessionConfig;
    use crate::session::{FlagSeverity, FlagType, Goal};
    use chrono::Utc;

    fn make_session() -> Session {
        Session::new(Goal::new("draft a wind-down routine"), SessionConfig::default())
    }

    fn finding(role: Role, score: f64, iteration: u32) -> ReviewFinding {
        ReviewFinding {
            role,
            score,
            narrative: "narrative".into(),
            suggestions: vec![],
            iteration,
            recorded_at: Utc::now(),
        }
    }

    fn record_passing_findings(session: &mut Session, iteration: u32) {
        session.record_finding(finding(Role::SafetyGuardian, 8.0, iteration));
        session.record_finding(finding(Role::ClinicalCritic, 7.0, iteration));
        session.record_finding(finding(Role::Empathy, 7.0, iteration));
    }

    #[test]
    fn test_successors_review_chain() {
        assert!(Supervisor::edge_allowed(
            SessionStatus::Drafting,
            SessionStatus::ClinicalReview
        ));
        assert!(Supervisor::edge_allowed(
            SessionStatus::ClinicalReview,
            SessionStatus::SafetyReview
        ));
        assert!(Supervisor::edge_allowed(
            SessionStatus::SafetyReview,
            SessionStatus::EmpathyReview
        ));
        assert!(Supervisor::edge_allowed(
            SessionStatus::EmpathyReview,
            SessionStatus::Evaluate
        ));
        assert!(!Supervisor::edge_allowed(
            SessionStatus::Drafting,
            SessionStatus::Evaluate
        ));
    }

    #[test]
    fn test_terminal_states_have_no_successors() {
        assert!(Supervisor::successors(SessionStatus::Approved).is_empty());
        assert!(Supervisor::successors(SessionStatus::Rejected).is_empty());
        assert!(Supervisor::successors(SessionStatus::Failed).is_empty());
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal() {
        for status in [
            SessionStatus::Drafting,
            SessionStatus::ClinicalReview,
            SessionStatus::SafetyReview,
            SessionStatus::EmpathyReview,
            SessionStatus::Evaluate,
            SessionStatus::PendingHumanReview,
            SessionStatus::HumanEditing,
        ] {
            assert!(
                Supervisor::edge_allowed(status, SessionStatus::Failed),
                "Failed should be reachable from {}",
                status
            );
        }
    }

    #[test]
    fn test_reviewer_for_pipeline_states() {
        assert_eq!(
            Supervisor::reviewer_for(SessionStatus::Drafting),
            Some(Role::Drafting)
        );
        assert_eq!(
            Supervisor::reviewer_for(SessionStatus::ClinicalReview),
            Some(Role::ClinicalCritic)
        );
        assert_eq!(
            Supervisor::reviewer_for(SessionStatus::SafetyReview),
            Some(Role::SafetyGuardian)
        );
        assert_eq!(
            Supervisor::reviewer_for(SessionStatus::EmpathyReview),
            Some(Role::Empathy)
        );
        assert_eq!(Supervisor::reviewer_for(SessionStatus::Evaluate), None);
    }

    #[test]
    fn test_apply_review_advances_and_stamps() {
        let mut session = make_session();
        let delta = CapabilityDelta::new(DebateMessage::broadcast(
            "first draft ready",
            DebateMessageType::Suggestion,
        ))
        .with_draft("calming routine draft", None);

        Supervisor::apply_review(&mut session, Role::Drafting, delta);

        assert_eq!(session.status, SessionStatus::ClinicalReview);
        assert_eq!(session.active_role, Role::ClinicalCritic);
        assert_eq!(session.draft_history.len(), 1);
        assert_eq!(session.current_draft, "calming routine draft");
        assert_eq!(session.debate_log.len(), 1);
        assert_eq!(session.debate_log[0].iteration, 0);
    }

    #[test]
    fn test_apply_review_clamps_scores() {
        let mut session = make_session();
        session.status = SessionStatus::ClinicalReview;
        let delta = CapabilityDelta::new(DebateMessage::broadcast(
            "off the charts",
            DebateMessageType::Agreement,
        ))
        .with_finding(14.0, "excellent");

        Supervisor::apply_review(&mut session, Role::ClinicalCritic, delta);
        assert_eq!(
            session.review_findings[&Role::ClinicalCritic].score,
            10.0
        );
    }

    #[test]
    fn test_apply_review_stamps_flags_unresolved() {
        let mut session = make_session();
        session.status = SessionStatus::SafetyReview;
        let delta = CapabilityDelta::new(DebateMessage::broadcast(
            "flagging phrasing",
            DebateMessageType::Critique,
        ))
        .with_flag(
            FlagType::TriggeringLanguage,
            FlagSeverity::Medium,
            "step two phrasing",
        );

        Supervisor::apply_review(&mut session, Role::SafetyGuardian, delta);
        assert_eq!(session.unresolved_flags.len(), 1);
        assert!(!session.unresolved_flags[0].resolved);
        assert_eq!(session.status, SessionStatus::EmpathyReview);
    }

    #[test]
    fn test_gate_promotes_when_all_met() {
        let mut session = make_session();
        session.status = SessionStatus::Evaluate;
        record_passing_findings(&mut session, 0);

        let evaluation = Supervisor::evaluate_gate(&session);
        assert_eq!(evaluation.outcome, GateOutcome::Promote);
        assert!(evaluation.unmet.is_empty());
    }

    #[test]
    fn test_gate_revises_on_low_score() {
        let mut session = make_session();
        session.status = SessionStatus::Evaluate;
        record_passing_findings(&mut session, 0);
        session.record_finding(finding(Role::SafetyGuardian, 5.0, 0));

        let evaluation = Supervisor::evaluate_gate(&session);
        assert_eq!(evaluation.outcome, GateOutcome::Revise);
        assert_eq!(evaluation.unmet.len(), 1);
        assert!(evaluation.unmet[0].contains("safety_guardian"));
    }

    #[test]
    fn test_gate_ignores_stale_findings() {
        let mut session = make_session();
        session.status = SessionStatus::Evaluate;
        // Findings from iteration 0 only; the session has moved on.
        record_passing_findings(&mut session, 0);
        session.iteration_count = 1;

        let evaluation = Supervisor::evaluate_gate(&session);
        assert_eq!(evaluation.outcome, GateOutcome::Revise);
        assert_eq!(evaluation.unmet.len(), 3);
    }

    #[test]
    fn test_gate_blocked_by_high_severity_flag() {
        let mut session = make_session();
        session.status = SessionStatus::Evaluate;
        record_passing_findings(&mut session, 0);
        session.unresolved_flags.push(SafetyFlag {
            id: Uuid::new_v4(),
            flag_type: FlagType::SelfHarmRisk,
            severity: FlagSeverity::High,
            details: "needs escalation guidance".into(),
            resolved: false,
            resolution_notes: None,
            flagged_at: Utc::now(),
        });

        let evaluation = Supervisor::evaluate_gate(&session);
        assert_eq!(evaluation.outcome, GateOutcome::Revise);
        assert!(evaluation.unmet.iter().any(|u| u.contains("high")));
    }

    #[test]
    fn test_gate_max_severity_governs() {
        let mut session = make_session();
        session.status = SessionStatus::Evaluate;
        record_passing_findings(&mut session, 0);
        for severity in [FlagSeverity::Low, FlagSeverity::Critical] {
            session.unresolved_flags.push(SafetyFlag {
                id: Uuid::new_v4(),
                flag_type: FlagType::EthicalPolicyBreach,
                severity,
                details: "flag".into(),
                resolved: false,
                resolution_notes: None,
                flagged_at: Utc::now(),
            });
        }

        let evaluation = Supervisor::evaluate_gate(&session);
        assert!(evaluation.unmet.iter().any(|u| u.contains("critical")));
    }

    #[test]
    fn test_gate_resolved_flags_do_not_block() {
        let mut session = make_session();
        session.status = SessionStatus::Evaluate;
        record_passing_findings(&mut session, 0);
        session.unresolved_flags.push(SafetyFlag {
            id: Uuid::new_v4(),
            flag_type: FlagType::MedicalAdviceViolation,
            severity: FlagSeverity::Critical,
            details: "resolved in v2".into(),
            resolved: true,
            resolution_notes: Some("rephrased as general guidance".into()),
            flagged_at: Utc::now(),
        });

        let evaluation = Supervisor::evaluate_gate(&session);
        assert_eq!(evaluation.outcome, GateOutcome::Promote);
    }

    #[test]
    fn test_apply_gate_revise_increments_and_notes() {
        let mut session = make_session();
        session.status = SessionStatus::Evaluate;
        session.record_finding(ReviewFinding {
            suggestions: vec!["soften the opening".into()],
            ..finding(Role::ClinicalCritic, 4.0, 0)
        });

        let evaluation = Supervisor::evaluate_gate(&session);
        Supervisor::apply_gate(&mut session, &evaluation);

        assert_eq!(session.status, SessionStatus::Drafting);
        assert_eq!(session.iteration_count, 1);
        assert_eq!(session.revision_notes.len(), 1);
        assert!(session.revision_notes[0].contains("soften the opening"));
        assert_eq!(session.decisions.len(), 1);
        assert!(!session.decisions[0].forced);
        assert_eq!(session.decisions[0].iteration, 0);
    }

    #[test]
    fn test_apply_gate_escalates_at_bound_without_increment() {
        let mut session = make_session();
        session.status = SessionStatus::Evaluate;
        session.iteration_count = session.max_iterations;

        let evaluation = Supervisor::evaluate_gate(&session);
        assert_eq!(evaluation.outcome, GateOutcome::Escalate);
        Supervisor::apply_gate(&mut session, &evaluation);

        assert_eq!(session.status, SessionStatus::PendingHumanReview);
        assert_eq!(session.iteration_count, session.max_iterations);
        assert!(session.force_escalated);
        assert!(session.decisions[0].forced);
    }

    #[test]
    fn test_apply_gate_promote_halts() {
        let mut session = make_session();
        session.status = SessionStatus::Evaluate;
        record_passing_findings(&mut session, 0);

        let evaluation = Supervisor::evaluate_gate(&session);
        Supervisor::apply_gate(&mut session, &evaluation);

        assert_eq!(session.status, SessionStatus::PendingHumanReview);
        assert_eq!(session.active_role, Role::Human);
        assert_eq!(session.iteration_count, 0);
        assert!(!session.force_escalated);
    }

    #[test]
    fn test_fail_records_role_and_reason() {
        let mut session = make_session();
        session.status = SessionStatus::SafetyReview;

        Supervisor::fail(&mut session, Some(Role::SafetyGuardian), "capability rejected");

        assert_eq!(session.status, SessionStatus::Failed);
        let failure = session.failure.as_ref().unwrap();
        assert_eq!(failure.role, Some(Role::SafetyGuardian));
        assert_eq!(failure.reason, "capability rejected");
    }
}
