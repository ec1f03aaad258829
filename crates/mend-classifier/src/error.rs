//! Error types for the classifier

use mend_model::ErrorCategory;

/// Classifier construction errors
///
/// Classification itself never fails; an unmatched error is reported as
/// [`ErrorCategory::Unknown`].
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// A pattern's regular expression does not compile
    #[error("invalid regex `{pattern}` for {category}: {source}")]
    InvalidPattern {
        /// Category the pattern belongs to
        category: ErrorCategory,
        /// Offending expression
        pattern: String,
        /// Compiler error
        #[source]
        source: regex::Error,
    },

    /// Weights or thresholds out of range
    #[error("invalid classifier configuration: {0}")]
    InvalidConfig(String),
}
