//! Execution records reported by the workflow engine

use crate::ids::{ExecutionId, TargetId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine-reported status of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Still in progress
    Running,
    /// Waiting on an external trigger
    Waiting,
    /// Finished without error
    Success,
    /// Finished with an error
    Error,
    /// The worker died mid-run
    Crashed,
    /// Exceeded its time budget
    Timeout,
    /// Stopped by an operator
    Canceled,
}

impl ExecutionStatus {
    /// Whether the execution has reached a final status
    #[inline]
    #[must_use]
    pub const fn is_finished(self) -> bool {
        !matches!(self, Self::Running | Self::Waiting)
    }

    /// Whether this status counts as a failure
    #[inline]
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::Crashed | Self::Timeout)
    }
}

/// Summary of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Execution identifier
    pub id: ExecutionId,
    /// Workflow that ran
    pub target_id: TargetId,
    /// Current status
    pub status: ExecutionStatus,
    /// Whether the engine marked it finished
    pub finished: bool,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Stop time, absent while running
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ExecutionInfo {
    /// Timestamp used for watermarking: stop time, falling back to start
    #[inline]
    #[must_use]
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.stopped_at.unwrap_or(self.started_at)
    }

    /// Wall-clock duration in milliseconds, once stopped
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        let stopped = self.stopped_at?;
        u64::try_from((stopped - self.started_at).num_milliseconds()).ok()
    }

    /// Whether the run is over
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.finished || self.status.is_finished()
    }
}

/// Error detail attached to a failing step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Engine error class, e.g. `NodeOperationError`
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Human-readable message
    pub message: String,
}

/// One step-level error from a failed execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    /// Name of the failing step
    pub step: String,
    /// Step type, when the engine reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    /// The error itself
    pub error: ErrorDetail,
}

impl StepError {
    /// Construct a step error
    #[must_use]
    pub fn new(step: impl Into<String>, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            step_type: None,
            error: ErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }

    /// Attach the step type
    #[inline]
    #[must_use]
    pub fn with_step_type(mut self, step_type: impl Into<String>) -> Self {
        self.step_type = Some(step_type.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn duration_and_watermark_timestamp() {
        let start = Utc::now();
        let info = ExecutionInfo {
            id: ExecutionId::from("1"),
            target_id: TargetId::from("wf"),
            status: ExecutionStatus::Error,
            finished: true,
            started_at: start,
            stopped_at: Some(start + Duration::milliseconds(1500)),
        };
        assert_eq!(info.duration_ms(), Some(1500));
        assert_eq!(info.observed_at(), start + Duration::milliseconds(1500));
        assert!(info.is_done());
        assert!(info.status.is_failure());
    }

    #[test]
    fn step_error_uses_engine_field_names() {
        let json = r#"{"step":"HTTP","error":{"type":"NodeApiError","message":"boom"}}"#;
        let err: StepError = serde_json::from_str(json).unwrap();
        assert_eq!(err.error.error_type, "NodeApiError");
        assert!(err.step_type.is_none());
    }
}
