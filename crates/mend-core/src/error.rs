//! Error types for the remediation loop
//!
//! - Configuration loading and validation
//! - Illegal incident phase transitions
//! - Audit chain integrity
//! - Snapshot persistence
//! - Loop-level failures (emergency, unknown incidents)

use crate::incident::Phase;
use mend_classifier::ClassifierError;
use mend_model::{IncidentId, TargetError};
use mend_repair::RepairError;
use std::path::PathBuf;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config {path}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or shape error
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// YAML syntax or shape error
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON syntax or shape error
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Extension not recognised
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// Values out of range or inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Classifier section rejected
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

/// Incident phase transition errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not in the table
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Current phase
        from: Phase,
        /// Requested phase
        to: Phase,
    },
}

/// Audit log errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// An entry's links or hash do not match
    #[error("audit chain broken at sequence {sequence}")]
    IntegrityViolation {
        /// First bad entry
        sequence: u64,
    },

    /// Details could not be encoded
    #[error("cannot encode audit details: {0}")]
    Encoding(String),
}

/// Snapshot persistence errors
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Filesystem failure
    #[error("snapshot I/O at {path}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Snapshot could not be encoded or decoded
    #[error("snapshot encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Restored audit chain does not verify
    #[error("restored audit log rejected: {0}")]
    Audit(#[from] AuditError),
}

impl PersistenceError {
    /// Check if a later attempt may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Orchestrator errors
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// No active incident with this id
    #[error("incident not found: {0}")]
    IncidentNotFound(IncidentId),

    /// Operation needs a different phase
    #[error("incident {id} is {phase}, expected {expected}")]
    WrongPhase {
        /// Incident
        id: IncidentId,
        /// Current phase
        phase: Phase,
        /// Phase the operation requires
        expected: Phase,
    },

    /// Transition rejected by the state machine
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    /// Audit append failed
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Target system failure
    #[error("target system: {0}")]
    Target(#[from] TargetError),

    /// Change applier failure
    #[error("repair: {0}")]
    Repair(#[from] RepairError),

    /// Snapshot failure
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Target system unreachable too many times in a row
    #[error("emergency: target system unreachable after {failures} health checks")]
    Emergency {
        /// Consecutive failed checks
        failures: u32,
    },
}

impl OrchestratorError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Target(e) => e.is_retryable(),
            Self::Repair(e) => e.is_retryable(),
            Self::Persistence(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Check if the loop must halt
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Emergency { .. })
    }
}
