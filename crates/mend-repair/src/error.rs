//! Error types for change application

use crate::strategy::StrategyKind;
use mend_model::{BackupId, DigestError, FixId, TargetError};

/// Errors raised while planning, applying or rolling back a fix
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    /// No step in the workflow needed the change
    #[error("{kind}: no step qualified for the change")]
    NoQualifyingStep {
        /// Strategy that found nothing to do
        kind: StrategyKind,
    },

    /// The strategy lacks a parameter its transform needs
    #[error("{kind}: missing parameter `{parameter}`")]
    MissingParameter {
        /// Strategy kind
        kind: StrategyKind,
        /// Parameter name
        parameter: String,
    },

    /// Unknown fix id
    #[error("fix not found: {0}")]
    FixNotFound(FixId),

    /// The fix never captured a snapshot
    #[error("fix {0} has no backup to restore")]
    NoBackup(FixId),

    /// The snapshot was pruned by retention
    #[error("backup {backup} for fix {fix} is no longer retained")]
    BackupMissing {
        /// Fix being rolled back
        fix: FixId,
        /// Missing snapshot
        backup: BackupId,
    },

    /// Target system call failed
    #[error("target system: {0}")]
    Target(#[from] TargetError),

    /// Snapshot could not be digested
    #[error("snapshot digest: {0}")]
    Digest(#[from] DigestError),
}

impl RepairError {
    /// Create missing parameter error
    #[inline]
    pub fn missing(kind: StrategyKind, parameter: impl Into<String>) -> Self {
        Self::MissingParameter {
            kind,
            parameter: parameter.into(),
        }
    }

    /// Check if a later attempt could succeed without operator action
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Target(e) if e.is_retryable())
    }
}
