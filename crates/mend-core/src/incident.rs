//! Incident records
//!
//! An [`Incident`] is opened by the first failing event of a workflow that is
//! not already tracked. Only the orchestrator mutates it; every phase change
//! goes through [`Incident::transition`] so the table in
//! [`state_machine`](crate::state_machine) is always enforced.

use crate::error::StateMachineError;
use crate::state_machine::validate_transition;
use chrono::{DateTime, Utc};
use mend_classifier::ErrorContext;
use mend_model::{
    ErrorCategory, Event, ExecutionId, FixId, IncidentId, Severity, StepRef, TargetId,
};
use mend_repair::RepairStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Incident lifecycle phase
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for a trigger and the cooldown
    #[default]
    Monitoring,
    /// Being classified, or parked after a low-confidence analysis
    Analyzing,
    /// Waiting for an operator decision
    PendingApproval,
    /// A fix is being applied
    Fixing,
    /// Verifying an applied fix
    Testing,
    /// Fixed
    Resolved,
    /// Handed to an operator
    Escalated,
}

impl Phase {
    /// Whether no further transitions are possible
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Escalated)
    }

    /// Stable snake_case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Monitoring => "monitoring",
            Self::Analyzing => "analyzing",
            Self::PendingApproval => "pending_approval",
            Self::Fixing => "fixing",
            Self::Testing => "testing",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open request for an operator decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Strategy awaiting approval
    pub strategy: RepairStrategy,
    /// Classification confidence
    pub confidence: f64,
    /// Why approval was needed
    pub reason: String,
    /// When the request was raised
    pub requested_at: DateTime<Utc>,
}

/// Verification run in flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    /// Run started on the target
    pub execution_id: ExecutionId,
    /// Fix being verified
    pub fix_id: FixId,
    /// When the run was started
    pub started_at: DateTime<Utc>,
}

/// A tracked failure needing remediation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// Incident id
    pub id: IncidentId,
    /// Failing workflow
    pub target_id: TargetId,
    /// Execution that last failed
    pub execution_id: Option<ExecutionId>,
    /// Estimated severity
    pub severity: Severity,
    /// Latest classification
    pub category: ErrorCategory,
    /// Latest error text
    pub description: String,
    /// Latest engine error class
    pub error_type: Option<String>,
    /// Latest failing step
    pub step: Option<StepRef>,
    /// When the incident was opened
    pub created_at: DateTime<Utc>,
    /// Current phase
    pub phase: Phase,
    /// Fix attempts made
    pub attempts: u32,
    /// Start of the latest fix attempt
    pub last_attempt: Option<DateTime<Utc>>,
    /// Latest analysis pass
    pub last_analysis: Option<DateTime<Utc>>,
    /// Latest classification confidence
    pub confidence: Option<f64>,
    /// A failing event or a retry is waiting to be analysed
    pub pending_trigger: bool,
    /// Whether the incident was resolved
    pub resolved: bool,
    /// Resolution time
    pub resolved_at: Option<DateTime<Utc>>,
    /// Whether the incident was escalated
    pub escalated: bool,
    /// Escalation time
    pub escalated_at: Option<DateTime<Utc>>,
    /// Open approval request
    pub approval: Option<ApprovalRequest>,
    /// Strategy chosen for the next or current fix
    pub strategy: Option<RepairStrategy>,
    /// Latest fix applied
    pub last_fix: Option<FixId>,
    /// Verification run in flight
    pub verification: Option<Verification>,
}

impl Incident {
    /// Open an incident from a failing event
    #[must_use]
    pub fn open(event: &Event, now: DateTime<Utc>) -> Self {
        let description = event.error_text.clone().unwrap_or_default();
        Self {
            id: IncidentId::new(),
            target_id: event.target_id.clone(),
            execution_id: event.execution_id.clone(),
            severity: Severity::from_error_text(&description),
            category: ErrorCategory::Unknown,
            description,
            error_type: event.error_type.clone(),
            step: event.step.clone(),
            created_at: now,
            phase: Phase::Monitoring,
            attempts: 0,
            last_attempt: None,
            last_analysis: None,
            confidence: None,
            pending_trigger: true,
            resolved: false,
            resolved_at: None,
            escalated: false,
            escalated_at: None,
            approval: None,
            strategy: None,
            last_fix: None,
            verification: None,
        }
    }

    /// Fold a further failing event into the incident and arm a trigger
    pub fn observe(&mut self, event: &Event) {
        if let Some(text) = &event.error_text {
            self.description.clone_from(text);
        }
        if event.execution_id.is_some() {
            self.execution_id.clone_from(&event.execution_id);
        }
        if event.error_type.is_some() {
            self.error_type.clone_from(&event.error_type);
        }
        if event.step.is_some() {
            self.step.clone_from(&event.step);
        }
        self.pending_trigger = true;
    }

    /// Move to `to`, returning the previous phase
    ///
    /// # Errors
    /// Returns error if the transition is not allowed
    pub fn transition(&mut self, to: Phase) -> Result<Phase, StateMachineError> {
        validate_transition(self.phase, to)?;
        let from = self.phase;
        self.phase = to;
        Ok(from)
    }

    /// Whether the incident is resolved or escalated
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Later of the last attempt and the last analysis
    #[must_use]
    pub fn cooldown_anchor(&self) -> Option<DateTime<Utc>> {
        self.last_attempt.max(self.last_analysis)
    }

    /// Whether a new analysis pass may start at `now`
    #[must_use]
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
        self.cooldown_anchor().map_or(true, |at| now - at >= cooldown)
    }

    /// Whether analysis should run at `now`
    #[must_use]
    pub fn ready_for_analysis(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
        matches!(self.phase, Phase::Monitoring | Phase::Analyzing)
            && self.pending_trigger
            && self.cooldown_elapsed(now, cooldown)
    }

    /// Classifier input for the latest failure
    #[must_use]
    pub fn error_context(&self) -> ErrorContext {
        let mut ctx = ErrorContext::new(self.target_id.clone(), self.description.clone());
        if let Some(t) = &self.error_type {
            ctx = ctx.with_error_type(t.clone());
        }
        if let Some(step) = &self.step {
            ctx = ctx.with_step(step.name.clone(), step.step_type.clone());
        }
        ctx
    }

    /// Time from opening to resolution
    #[must_use]
    pub fn resolution_time(&self) -> Option<chrono::Duration> {
        self.resolved_at.map(|at| at - self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mend_model::{ExecutionInfo, ExecutionStatus, StepError};

    fn failing_event(text: &str) -> Event {
        let now = Utc::now();
        let info = ExecutionInfo {
            id: ExecutionId::from("e1"),
            target_id: TargetId::from("wf"),
            status: ExecutionStatus::Error,
            finished: true,
            started_at: now,
            stopped_at: Some(now),
        };
        let error = StepError::new("HTTP", "NodeApiError", text).with_step_type("n8n-nodes-base.httpRequest");
        Event::from_execution(&info, Some(&error)).unwrap()
    }

    #[test]
    fn open_sets_severity_and_trigger() {
        let incident = Incident::open(&failing_event("Request timeout after 30s"), Utc::now());
        assert_eq!(incident.phase, Phase::Monitoring);
        assert_eq!(incident.severity, Severity::Medium);
        assert_eq!(incident.category, ErrorCategory::Unknown);
        assert!(incident.pending_trigger);
        assert_eq!(incident.step.as_ref().unwrap().name, "HTTP");
    }

    #[test]
    fn cooldown_uses_later_of_attempt_and_analysis() {
        let now = Utc::now();
        let mut incident = Incident::open(&failing_event("boom"), now);
        let cooldown = Duration::seconds(60);
        assert!(incident.cooldown_elapsed(now, cooldown));

        incident.last_attempt = Some(now - Duration::seconds(120));
        incident.last_analysis = Some(now - Duration::seconds(30));
        assert!(!incident.cooldown_elapsed(now, cooldown));
        assert!(incident.cooldown_elapsed(now + Duration::seconds(30), cooldown));
    }

    #[test]
    fn transition_rejects_skips() {
        let mut incident = Incident::open(&failing_event("boom"), Utc::now());
        assert!(incident.transition(Phase::Fixing).is_err());
        assert_eq!(incident.transition(Phase::Analyzing), Ok(Phase::Monitoring));
        assert_eq!(incident.phase, Phase::Analyzing);
    }

    #[test]
    fn error_context_carries_step() {
        let incident = Incident::open(&failing_event("ECONNREFUSED"), Utc::now());
        let ctx = incident.error_context();
        assert_eq!(ctx.error_type.as_deref(), Some("NodeApiError"));
        assert_eq!(ctx.step_type.as_deref(), Some("n8n-nodes-base.httpRequest"));
    }
}
