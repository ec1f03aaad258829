//! Classifier configuration
//!
//! Scoring constants are tunable defaults, not fixed requirements.
//! Credential references are looked up from an injected table keyed by
//! category instead of being written into the strategy templates.

use crate::error::ClassifierError;
use crate::patterns::PatternSpec;
use mend_model::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Weights of the three match signals
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Weight of the keyword match fraction
    pub keyword: f64,
    /// Weight of the regex match fraction
    pub regex: f64,
    /// Weight of a step type match
    pub step_type: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            keyword: 0.4,
            regex: 0.4,
            step_type: 0.2,
        }
    }
}

/// Classifier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Signal weights
    pub weights: ScoringWeights,
    /// How strongly past success lowers a strategy's threshold
    pub success_dampening: f64,
    /// Outcomes kept per strategy kind
    pub history_window: usize,
    /// Confidence reported when nothing matched
    pub unknown_confidence: f64,
    /// Maximum cached analyses
    pub cache_capacity: u64,
    /// Cached analysis lifetime in seconds
    pub cache_ttl_secs: u64,
    /// Replacement pattern set; built-in patterns when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patterns: Option<Vec<PatternSpec>>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            success_dampening: 0.2,
            history_window: crate::history::DEFAULT_WINDOW,
            unknown_confidence: 0.1,
            cache_capacity: 1_000,
            cache_ttl_secs: 3_600,
            patterns: None,
        }
    }
}

impl ClassifierConfig {
    /// Set signal weights
    #[inline]
    #[must_use]
    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Set success-rate dampening
    #[inline]
    #[must_use]
    pub fn with_success_dampening(mut self, dampening: f64) -> Self {
        self.success_dampening = dampening;
        self
    }

    /// Replace the pattern set
    #[inline]
    #[must_use]
    pub fn with_patterns(mut self, patterns: Vec<PatternSpec>) -> Self {
        self.patterns = Some(patterns);
        self
    }

    /// Check ranges
    ///
    /// # Errors
    /// Returns [`ClassifierError::InvalidConfig`] describing the first problem
    pub fn validate(&self) -> Result<(), ClassifierError> {
        let w = self.weights;
        if [w.keyword, w.regex, w.step_type].iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(ClassifierError::InvalidConfig(
                "weights must lie in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.success_dampening) {
            return Err(ClassifierError::InvalidConfig(
                "success_dampening must lie in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.unknown_confidence) {
            return Err(ClassifierError::InvalidConfig(
                "unknown_confidence must lie in [0, 1]".into(),
            ));
        }
        if self.history_window == 0 || self.cache_capacity == 0 {
            return Err(ClassifierError::InvalidConfig(
                "history_window and cache_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// One credential reference candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    /// Substring matched against the failing step's name or type, ignoring case
    pub step_match: String,
    /// Credential kind as the engine names it, e.g. `openRouterApi`
    pub credential_type: String,
    /// Engine credential id
    pub credential_id: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_name: Option<String>,
}

/// Credential references keyed by failure category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialTable {
    by_category: BTreeMap<ErrorCategory, Vec<CredentialRef>>,
}

impl CredentialTable {
    /// Empty table
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate for a category
    #[inline]
    #[must_use]
    pub fn with_ref(mut self, category: ErrorCategory, reference: CredentialRef) -> Self {
        self.by_category.entry(category).or_default().push(reference);
        self
    }

    /// First candidate whose `step_match` appears in the step name or type
    #[must_use]
    pub fn lookup(
        &self,
        category: ErrorCategory,
        step_name: Option<&str>,
        step_type: Option<&str>,
    ) -> Option<&CredentialRef> {
        let haystacks: Vec<String> = [step_name, step_type]
            .into_iter()
            .flatten()
            .map(str::to_lowercase)
            .collect();
        self.by_category.get(&category)?.iter().find(|r| {
            let needle = r.step_match.to_lowercase();
            haystacks.iter().any(|h| h.contains(&needle))
        })
    }

    /// Check if the table is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_category.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openrouter() -> CredentialRef {
        CredentialRef {
            step_match: "openrouter".into(),
            credential_type: "openRouterApi".into(),
            credential_id: "cred-or".into(),
            credential_name: Some("OpenRouter".into()),
        }
    }

    #[test]
    fn lookup_matches_name_or_type() {
        let table = CredentialTable::new().with_ref(ErrorCategory::Authentication, openrouter());
        assert!(table
            .lookup(ErrorCategory::Authentication, Some("OpenRouter Chat"), None)
            .is_some());
        assert!(table
            .lookup(
                ErrorCategory::Authentication,
                Some("LLM"),
                Some("@n8n/n8n-nodes-langchain.lmChatOpenRouter")
            )
            .is_some());
        assert!(table
            .lookup(ErrorCategory::Credentials, Some("OpenRouter Chat"), None)
            .is_none());
    }

    #[test]
    fn defaults_validate_and_bad_weights_do_not() {
        assert!(ClassifierConfig::default().validate().is_ok());
        let bad = ClassifierConfig::default().with_weights(ScoringWeights {
            keyword: 1.5,
            ..ScoringWeights::default()
        });
        assert!(bad.validate().is_err());
    }

    #[test]
    fn table_deserializes_from_category_map() {
        let json = r#"{"authentication":[{"step_match":"google","credential_type":"googleDriveOAuth2Api","credential_id":"g1"}]}"#;
        let table: CredentialTable = serde_json::from_str(json).unwrap();
        let found = table.lookup(ErrorCategory::Authentication, Some("Google Drive"), None).unwrap();
        assert_eq!(found.credential_id, "g1");
    }
}
