//! Mend Model - shared domain types
//!
//! Everything the remediation loop's components exchange:
//! - Identifiers ([`IncidentId`], [`FixId`], [`TargetId`], ...)
//! - Execution records and step errors reported by the engine
//! - Workflow definitions ([`TargetState`]) and their digests
//! - Observed [`Event`]s, failure categories and severities
//! - The [`TargetSystem`] and [`Notifier`] collaborator traits
//!
//! [`MemoryTarget`] is an in-memory engine used for fixtures and tests.

pub mod category;
pub mod clock;
pub mod digest;
pub mod event;
pub mod execution;
pub mod ids;
pub mod memory;
pub mod state;
pub mod target;

pub use category::{ErrorCategory, NotificationLevel, Severity};
pub use clock::{Clock, ManualClock, SystemClock};
pub use digest::{DigestError, StateDigest};
pub use event::{AnomalyKind, Event, EventOutcome, StepRef};
pub use execution::{ErrorDetail, ExecutionInfo, ExecutionStatus, StepError};
pub use ids::{AuditId, BackupId, EventId, ExecutionId, FixId, IncidentId, TargetId};
pub use memory::{MemoryFixture, MemoryTarget};
pub use state::{Step, TargetState};
pub use target::{with_deadline, Notifier, TargetError, TargetSystem};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
