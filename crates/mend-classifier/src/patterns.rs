//! Failure patterns
//!
//! A [`PatternSpec`] is the serializable description (so patterns can be
//! exported, reviewed and loaded from configuration); a [`CompiledPattern`]
//! holds lowercased keywords and case-insensitive regexes ready for scoring.

use crate::error::ClassifierError;
use mend_model::ErrorCategory;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Serializable failure pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    /// Category this pattern votes for
    pub category: ErrorCategory,
    /// Substrings searched for, case-insensitively
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Regular expressions, matched case-insensitively
    #[serde(default)]
    pub regexes: Vec<String>,
    /// Step types this failure usually comes from
    #[serde(default)]
    pub step_types: Vec<String>,
    /// Fixed bonus added when anything matched
    #[serde(default)]
    pub bonus: f64,
}

impl PatternSpec {
    fn new(category: ErrorCategory, keywords: &[&str], regexes: &[&str], step_types: &[&str], bonus: f64) -> Self {
        let own = |list: &[&str]| -> Vec<String> { list.iter().map(ToString::to_string).collect() };
        Self {
            category,
            keywords: own(keywords),
            regexes: own(regexes),
            step_types: own(step_types),
            bonus,
        }
    }
}

/// Pattern prepared for matching
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub(crate) category: ErrorCategory,
    pub(crate) keywords: Vec<String>,
    pub(crate) regexes: Vec<Regex>,
    pub(crate) step_types: Vec<String>,
    pub(crate) bonus: f64,
    spec: PatternSpec,
}

impl CompiledPattern {
    /// Compile a spec
    ///
    /// # Errors
    /// Returns [`ClassifierError::InvalidPattern`] if a regex does not compile
    pub fn compile(spec: &PatternSpec) -> Result<Self, ClassifierError> {
        let regexes = spec
            .regexes
            .iter()
            .map(|r| {
                RegexBuilder::new(r)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| ClassifierError::InvalidPattern {
                        category: spec.category,
                        pattern: r.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            category: spec.category,
            keywords: spec.keywords.iter().map(|k| k.to_lowercase()).collect(),
            regexes,
            step_types: spec.step_types.iter().map(|s| s.to_lowercase()).collect(),
            bonus: spec.bonus,
            spec: spec.clone(),
        })
    }

    /// Category this pattern votes for
    #[inline]
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// Source description
    #[inline]
    #[must_use]
    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }
}

/// Built-in patterns, in tie-break order
#[must_use]
pub fn default_patterns() -> Vec<PatternSpec> {
    vec![
        PatternSpec::new(
            ErrorCategory::Authentication,
            &["unauthorized", "authentication", "invalid token", "access denied", "401", "403"],
            &[
                r"authentication.*failed",
                r"invalid.*token",
                r"access.*denied",
                r"unauthorized.*request",
            ],
            &["@n8n/n8n-nodes-langchain.lmChatOpenRouter", "n8n-nodes-base.httpRequest"],
            0.2,
        ),
        PatternSpec::new(
            ErrorCategory::Network,
            &["timeout", "connection", "network", "ECONNREFUSED", "ETIMEDOUT", "DNS"],
            &[
                r"connection.*timeout",
                r"network.*error",
                r"ECONNREFUSED",
                r"ETIMEDOUT",
                r"getaddrinfo.*ENOTFOUND",
            ],
            &["n8n-nodes-base.httpRequest"],
            0.15,
        ),
        PatternSpec::new(
            ErrorCategory::ExternalApi,
            &["500", "502", "503", "504", "rate limit", "quota", "API error"],
            &[
                r"HTTP.*5\d{2}",
                r"rate.*limit.*exceeded",
                r"quota.*exceeded",
                r"API.*error",
            ],
            &["n8n-nodes-base.httpRequest", "@n8n/n8n-nodes-langchain.lmChatOpenRouter"],
            0.1,
        ),
        PatternSpec::new(
            ErrorCategory::Mapping,
            &["undefined", "null", "missing property", "cannot read", "path not found"],
            &[
                r"cannot.*read.*property",
                r"undefined.*is.*not.*a.*function",
                r"path.*not.*found",
                r"missing.*required.*field",
            ],
            &["n8n-nodes-base.set", "n8n-nodes-base.code"],
            0.25,
        ),
        PatternSpec::new(
            ErrorCategory::Configuration,
            &["session", "sessionId", "no session"],
            &[
                r"session.*id.*required",
                r"no.*session.*found",
                r"session.*not.*provided",
            ],
            &["@n8n/n8n-nodes-langchain.memoryBufferWindow"],
            0.3,
        ),
        PatternSpec::new(
            ErrorCategory::Credentials,
            &["credential", "api key", "token", "secret"],
            &[
                r"credential.*not.*found",
                r"invalid.*api.*key",
                r"missing.*credentials",
            ],
            &["@n8n/n8n-nodes-langchain.lmChatOpenRouter", "n8n-nodes-base.googleDrive"],
            0.2,
        ),
        PatternSpec::new(
            ErrorCategory::Internal,
            &["syntax error", "reference error", "type error", "function not defined"],
            &[r"SyntaxError", r"ReferenceError", r"TypeError", r"function.*not.*defined"],
            &["n8n-nodes-base.code", "n8n-nodes-base.function"],
            0.15,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_compile() {
        for spec in default_patterns() {
            let compiled = CompiledPattern::compile(&spec).unwrap();
            assert_eq!(compiled.regexes.len(), spec.regexes.len());
            assert!(compiled.keywords.iter().all(|k| k == &k.to_lowercase()));
        }
    }

    #[test]
    fn bad_regex_is_reported() {
        let mut spec = default_patterns().remove(0);
        spec.regexes.push("(unclosed".into());
        let err = CompiledPattern::compile(&spec).unwrap_err();
        assert!(matches!(err, ClassifierError::InvalidPattern { .. }));
    }

    #[test]
    fn specs_round_trip_through_json() {
        let specs = default_patterns();
        let json = serde_json::to_string(&specs).unwrap();
        let back: Vec<PatternSpec> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, specs);
    }
}
