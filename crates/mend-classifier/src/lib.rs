//! Mend Classifier - failure categorization and strategy ranking
//!
//! # Core Concepts
//!
//! - [`ErrorContext`]: the failing step, message and engine error class
//! - [`Classifier`]: trait seam the orchestrator depends on
//! - [`RuleClassifier`]: weighted keyword/regex/step-type scoring
//! - [`SuccessHistory`]: bounded outcome window that dampens thresholds
//! - [`CredentialTable`]: injected credential references per category
//!
//! # Example
//!
//! ```rust,ignore
//! use mend_classifier::{Classifier, ErrorContext, RuleClassifier};
//!
//! let classifier = RuleClassifier::with_defaults()?;
//! let analysis = classifier
//!     .classify(&ErrorContext::new(target_id, "ECONNREFUSED").with_error_type("network_error"))
//!     .await;
//! assert_eq!(analysis.category, ErrorCategory::Network);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod cache;
mod classifier;
mod config;
mod error;
mod history;
mod patterns;

pub use cache::{AnalysisCache, AnalysisKey, CacheStats};
pub use classifier::{
    root_cause, Analysis, Classifier, ClassifierStatistics, ErrorContext, RuleClassifier,
};
pub use config::{ClassifierConfig, CredentialRef, CredentialTable, ScoringWeights};
pub use error::ClassifierError;
pub use history::{SuccessHistory, DEFAULT_WINDOW};
pub use patterns::{default_patterns, CompiledPattern, PatternSpec};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
