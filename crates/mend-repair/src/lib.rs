//! Mend Repair - strategy table and change application
//!
//! # Core Concepts
//!
//! - [`RepairStrategy`]: a typed action with parameters, threshold and risk tier
//! - [`StrategyRegistry`]: static category to strategy templates
//! - [`plan`]: the one deterministic transform per [`StrategyKind`]
//! - [`ChangeApplier`]: backup, transform, write; plus rollback and pruning
//!
//! # Example
//!
//! ```rust,ignore
//! use mend_repair::{ChangeApplier, StrategyRegistry};
//!
//! let registry = StrategyRegistry::with_defaults();
//! let strategy = &registry.strategies_for(ErrorCategory::Network)[0];
//! let fix = applier.apply(&target_id, strategy).await;
//! if !fix.success {
//!     applier.rollback(&fix.fix_id).await?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod applier;
mod backup;
mod error;
mod registry;
mod strategy;
mod transform;

pub use applier::{ApplierConfig, ApplierStats, ChangeApplier, FixResult, FixStatus};
pub use backup::{Backup, BackupStore};
pub use error::RepairError;
pub use registry::StrategyRegistry;
pub use strategy::{RepairStrategy, RiskTier, StrategyKind};
pub use transform::{plan, Change};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
