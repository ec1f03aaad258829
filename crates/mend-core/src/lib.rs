//! Mend Core - the remediation control loop
//!
//! Ties the pieces together:
//! - [`EventMonitor`] turns execution records into events and anomalies
//! - [`Orchestrator`] drives each [`Incident`] through its phases
//! - [`AuditLog`] records every decision in a hash chain
//! - [`StateStore`] snapshots the loop so a restart resumes where it stopped
//!
//! # Example
//!
//! ```rust,ignore
//! use mend_core::{LogNotifier, MendConfig, Orchestrator};
//! use mend_classifier::RuleClassifier;
//!
//! let config = MendConfig::load(Path::new("mend.toml"))?;
//! let classifier = RuleClassifier::new(
//!     config.classifier.clone(),
//!     StrategyRegistry::with_defaults(),
//!     config.credentials.clone(),
//! )?;
//! let orchestrator = Orchestrator::new(config, target, Arc::new(classifier), Arc::new(LogNotifier));
//!
//! let report = orchestrator.tick().await?;
//! println!("opened {} incidents, resolved {}", report.opened, report.resolved);
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

pub mod audit;
pub mod config;
pub mod error;
pub mod incident;
pub mod monitor;
pub mod notify;
pub mod orchestrator;
pub mod persistence;
pub mod state_machine;
pub mod telemetry;

pub use audit::{verify_chain, AuditAction, AuditEntry, AuditLog, SYSTEM_ACTOR};
pub use config::{
    AnomalyConfig, MendConfig, MonitoringConfig, PersistenceConfig, RepairConfig, SafetyConfig,
    VerificationConfig,
};
pub use error::{AuditError, ConfigError, OrchestratorError, PersistenceError, StateMachineError};
pub use incident::{ApprovalRequest, Incident, Phase, Verification};
pub use monitor::{AnomalyDetector, EventMonitor, MonitorStats, FLEET_TARGET};
pub use notify::LogNotifier;
pub use orchestrator::{Orchestrator, TickReport};
pub use persistence::{Snapshot, StateStore, SNAPSHOT_VERSION};
pub use state_machine::{allowed_transitions, validate_transition};
pub use telemetry::{LoopMetrics, LoopStatus};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for embedding the loop
    pub use crate::{
        Incident, LogNotifier, LoopMetrics, MendConfig, Orchestrator, OrchestratorError, Phase,
        StateStore, TickReport,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
