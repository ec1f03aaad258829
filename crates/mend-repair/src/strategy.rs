//! Repair strategy types
//!
//! A [`RepairStrategy`] is a typed action plus a parameter map. Templates
//! live in the [`StrategyRegistry`](crate::StrategyRegistry); the classifier
//! fills in per-incident parameters before the orchestrator applies one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of repair action
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Set a missing parameter on matching steps
    AddParameter,
    /// Change an existing parameter value
    UpdateParameter,
    /// Point a step at a different credential
    FixCredentialReference,
    /// Raise a step's timeout
    IncreaseTimeout,
    /// Enable request retries with backoff
    AddRetry,
    /// Guard a code step against empty input
    AddInputValidation,
    /// Wrap a code step in try/catch
    AddErrorHandling,
    /// Swap the failing step for a safer type
    ReplaceStep,
    /// Stop calling a failing upstream for a while
    AddCircuitBreaker,
    /// Make a field mapping null-safe
    UpdateMapping,
}

impl StrategyKind {
    /// Every kind, in declaration order
    pub const ALL: [Self; 10] = [
        Self::AddParameter,
        Self::UpdateParameter,
        Self::FixCredentialReference,
        Self::IncreaseTimeout,
        Self::AddRetry,
        Self::AddInputValidation,
        Self::AddErrorHandling,
        Self::ReplaceStep,
        Self::AddCircuitBreaker,
        Self::UpdateMapping,
    ];

    /// Stable kebab-case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AddParameter => "add-parameter",
            Self::UpdateParameter => "update-parameter",
            Self::FixCredentialReference => "fix-credential-reference",
            Self::IncreaseTimeout => "increase-timeout",
            Self::AddRetry => "add-retry",
            Self::AddInputValidation => "add-input-validation",
            Self::AddErrorHandling => "add-error-handling",
            Self::ReplaceStep => "replace-step",
            Self::AddCircuitBreaker => "add-circuit-breaker",
            Self::UpdateMapping => "update-mapping",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much damage a wrong application could do
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Additive, easily reverted
    #[default]
    Low,
    /// Changes behaviour of a step
    Medium,
    /// Replaces structure
    High,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// A typed, parameterized repair action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairStrategy {
    /// Action type
    pub kind: StrategyKind,
    /// Operator-facing summary
    pub description: String,
    /// Minimum classification confidence for automatic application
    pub confidence_threshold: f64,
    /// Risk tier
    pub risk: RiskTier,
    /// Action parameters, ordered for deterministic output
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl RepairStrategy {
    /// Create a strategy without parameters
    #[must_use]
    pub fn new(
        kind: StrategyKind,
        description: impl Into<String>,
        confidence_threshold: f64,
        risk: RiskTier,
    ) -> Self {
        Self {
            kind,
            description: description.into(),
            confidence_threshold,
            risk,
            parameters: BTreeMap::new(),
        }
    }

    /// Set a parameter
    #[inline]
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Set a parameter in place
    #[inline]
    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.parameters.insert(key.into(), value.into());
    }

    /// Raw parameter
    #[inline]
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// String parameter
    #[inline]
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Unsigned integer parameter
    #[inline]
    #[must_use]
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(Value::as_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_serde() {
        for kind in StrategyKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn parameter_accessors() {
        let s = RepairStrategy::new(StrategyKind::IncreaseTimeout, "t", 0.7, RiskTier::Low)
            .with_param("timeout", 60_000)
            .with_param("field", "options.timeout");
        assert_eq!(s.param_u64("timeout"), Some(60_000));
        assert_eq!(s.param_str("field"), Some("options.timeout"));
        assert!(s.param("missing").is_none());
    }

    #[test]
    fn risk_ordering() {
        assert!(RiskTier::High > RiskTier::Medium);
        assert!(RiskTier::Medium > RiskTier::Low);
    }
}
