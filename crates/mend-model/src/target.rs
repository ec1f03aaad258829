//! Collaborator seams: the workflow engine and the notification sink
//!
//! The loop never talks to a transport directly. Whatever sits behind
//! [`TargetSystem`] (REST, SQL, SSH) is an external concern.

use crate::category::NotificationLevel;
use crate::execution::{ExecutionInfo, StepError};
use crate::ids::{ExecutionId, TargetId};
use crate::state::TargetState;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Errors reported by a [`TargetSystem`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum TargetError {
    /// The engine could not be reached
    #[error("target system unreachable: {0}")]
    Unreachable(String),

    /// The call did not finish in time
    #[error("{operation} timed out after {secs}s")]
    Timeout {
        /// Operation name
        operation: String,
        /// Budget that was exceeded
        secs: u64,
    },

    /// Unknown workflow or execution
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine refused a write
    #[error("write rejected: {0}")]
    Rejected(String),

    /// Malformed payload
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl TargetError {
    /// Create a timeout error
    #[inline]
    pub fn timeout(operation: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            secs,
        }
    }

    /// Transient errors are retried through the attempt/cooldown mechanism
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout { .. })
    }
}

/// The remote workflow engine
#[async_trait]
pub trait TargetSystem: Send + Sync {
    /// Most recent executions across all workflows, newest first
    async fn list_recent_executions(&self, limit: usize) -> Result<Vec<ExecutionInfo>, TargetError>;

    /// Step-level errors of one execution
    async fn get_execution_errors(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<StepError>, TargetError>;

    /// Current workflow definition
    async fn get_target_state(&self, target: &TargetId) -> Result<TargetState, TargetError>;

    /// Replace the workflow definition
    async fn update_target_state(
        &self,
        target: &TargetId,
        state: &TargetState,
    ) -> Result<(), TargetError>;

    /// Start a run, returning its execution id
    async fn execute_target(&self, target: &TargetId, input: &Value)
        -> Result<ExecutionId, TargetError>;

    /// Enable or disable a workflow
    async fn set_active(&self, target: &TargetId, active: bool) -> Result<(), TargetError>;

    /// Current record of a single execution
    async fn execution_status(&self, execution_id: &ExecutionId)
        -> Result<ExecutionInfo, TargetError>;

    /// Liveness probe
    async fn health_check(&self) -> Result<(), TargetError> {
        self.list_recent_executions(1).await.map(|_| ())
    }
}

/// Run a target call under a deadline
///
/// An elapsed deadline becomes [`TargetError::Timeout`]; the inner future is
/// dropped, which cancels it.
///
/// # Errors
/// Returns the call's own error or a timeout
pub async fn with_deadline<T, F>(operation: &str, limit: Duration, call: F) -> Result<T, TargetError>
where
    F: Future<Output = Result<T, TargetError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| TargetError::timeout(operation, limit.as_secs()))?
}

/// Fire-and-forget operator notification sink
///
/// Delivery failures are the sink's problem and never reach the loop.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a message
    async fn notify(&self, message: &str, level: NotificationLevel);
}
