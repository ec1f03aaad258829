//! Observed facts about executions
//!
//! Events are produced by the monitor and consumed by the orchestrator.
//! They are immutable once created.

use crate::execution::{ExecutionInfo, StepError};
use crate::ids::{EventId, ExecutionId, TargetId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// Execution began
    Started,
    /// Execution finished successfully
    Completed,
    /// Execution failed
    Failed,
    /// Execution exceeded its time budget
    Timeout,
    /// Synthetic fleet-level signal
    SystemAnomaly,
}

/// Kind of anomaly behind a [`EventOutcome::SystemAnomaly`] event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyKind {
    /// One execution ran far longer than the rolling mean
    SlowExecution {
        /// Observed duration
        duration_ms: u64,
        /// Rolling mean at the time
        mean_ms: u64,
    },
    /// A target failed several times in a row
    ConsecutiveFailures {
        /// Length of the failure streak
        count: u32,
    },
    /// Fleet-wide failure fraction crossed the threshold
    ErrorRate {
        /// Failure fraction over the window
        rate: f64,
    },
}

impl AnomalyKind {
    /// Short label for metrics and audit
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::SlowExecution { .. } => "slow_execution",
            Self::ConsecutiveFailures { .. } => "consecutive_failures",
            Self::ErrorRate { .. } => "error_rate",
        }
    }
}

/// Reference to the step an error came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    /// Step display name
    pub name: String,
    /// Step type, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
}

/// A single observed fact about an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier
    pub id: EventId,
    /// Workflow concerned
    pub target_id: TargetId,
    /// Execution concerned, absent for fleet anomalies
    pub execution_id: Option<ExecutionId>,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Outcome
    pub outcome: EventOutcome,
    /// Error message for failures
    pub error_text: Option<String>,
    /// Engine error class for failures
    pub error_type: Option<String>,
    /// Failing step
    pub step: Option<StepRef>,
    /// Execution duration when known
    pub duration_ms: Option<u64>,
    /// Anomaly detail for synthetic events
    pub anomaly: Option<AnomalyKind>,
}

impl Event {
    /// Build the event describing an execution record
    ///
    /// Returns `None` for statuses that carry no signal (canceled, waiting).
    #[must_use]
    pub fn from_execution(info: &ExecutionInfo, error: Option<&StepError>) -> Option<Self> {
        use crate::execution::ExecutionStatus as S;
        let outcome = match info.status {
            S::Running => EventOutcome::Started,
            S::Success => EventOutcome::Completed,
            S::Error | S::Crashed => EventOutcome::Failed,
            S::Timeout => EventOutcome::Timeout,
            S::Waiting | S::Canceled => return None,
        };
        let is_failure = matches!(outcome, EventOutcome::Failed | EventOutcome::Timeout);
        let (error_text, error_type, step) = match (is_failure, error) {
            (true, Some(e)) => (
                Some(e.error.message.clone()),
                Some(e.error.error_type.clone()),
                Some(StepRef {
                    name: e.step.clone(),
                    step_type: e.step_type.clone(),
                }),
            ),
            (true, None) => (Some(format!("execution {:?}", info.status).to_lowercase()), None, None),
            _ => (None, None, None),
        };
        Some(Self {
            id: EventId::new(),
            target_id: info.target_id.clone(),
            execution_id: Some(info.id.clone()),
            timestamp: info.observed_at(),
            outcome,
            error_text,
            error_type,
            step,
            duration_ms: info.duration_ms(),
            anomaly: None,
        })
    }

    /// Build a synthetic anomaly event
    #[must_use]
    pub fn anomaly(target_id: TargetId, kind: AnomalyKind, at: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            target_id,
            execution_id: None,
            timestamp: at,
            outcome: EventOutcome::SystemAnomaly,
            error_text: None,
            error_type: None,
            step: None,
            duration_ms: None,
            anomaly: Some(kind),
        }
    }

    /// Whether this event reports an execution failure
    #[inline]
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, EventOutcome::Failed | EventOutcome::Timeout)
    }
}
