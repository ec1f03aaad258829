//! Category to strategy table
//!
//! Provides [`StrategyRegistry`], the single place repair templates are
//! defined. One template per fix type; incident-specific values are filled
//! in later by adaptation.

use crate::strategy::{RepairStrategy, RiskTier, StrategyKind};
use mend_model::ErrorCategory;
use serde_json::json;
use std::collections::BTreeMap;

/// Static repair templates keyed by failure category
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    table: BTreeMap<ErrorCategory, Vec<RepairStrategy>>,
    fallback: RepairStrategy,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl StrategyRegistry {
    /// Create an empty registry with the generic fallback only
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: BTreeMap::new(),
            fallback: RepairStrategy::new(
                StrategyKind::AddErrorHandling,
                "Wrap failing code in generic error handling",
                0.3,
                RiskTier::Medium,
            )
            .with_param("step_pattern", "code"),
        }
    }

    /// Create registry with built-in templates
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        let http_retry = |threshold: f64| {
            RepairStrategy::new(
                StrategyKind::AddRetry,
                "Retry failed requests with exponential backoff",
                threshold,
                RiskTier::Low,
            )
            .with_param("max_retries", 3)
            .with_param("backoff_factor", 2)
            .with_param("step_pattern", "httpRequest")
        };
        let timeout = RepairStrategy::new(
            StrategyKind::IncreaseTimeout,
            "Raise the request timeout",
            0.7,
            RiskTier::Low,
        )
        .with_param("timeout", 60_000)
        .with_param("field", "options.timeout")
        .with_param("step_pattern", "httpRequest");
        let credentials = RepairStrategy::new(
            StrategyKind::FixCredentialReference,
            "Point the failing step at the configured credential",
            0.8,
            RiskTier::Low,
        );

        registry.register(ErrorCategory::Authentication, credentials.clone());
        registry.register(ErrorCategory::Credentials, credentials);

        registry.register(ErrorCategory::Network, timeout.clone());
        registry.register(ErrorCategory::Network, http_retry(0.6));
        registry.register(ErrorCategory::Timeout, timeout);

        registry.register(
            ErrorCategory::ExternalApi,
            RepairStrategy::new(
                StrategyKind::AddCircuitBreaker,
                "Stop calling the upstream after repeated failures",
                0.6,
                RiskTier::Medium,
            )
            .with_param("failure_threshold", 5)
            .with_param("recovery_timeout", 60)
            .with_param("step_pattern", "httpRequest"),
        );
        registry.register(
            ErrorCategory::ExternalApi,
            http_retry(0.8).with_param("status_codes", json!([500, 502, 503, 504])),
        );

        let validation = RepairStrategy::new(
            StrategyKind::AddInputValidation,
            "Skip items without data before processing",
            0.7,
            RiskTier::Low,
        )
        .with_param("step_pattern", "code");
        registry.register(ErrorCategory::Mapping, validation.clone());
        registry.register(
            ErrorCategory::Mapping,
            RepairStrategy::new(
                StrategyKind::UpdateMapping,
                "Make the broken field mapping null-safe",
                0.8,
                RiskTier::Low,
            )
            .with_param("step_pattern", "set"),
        );
        registry.register(ErrorCategory::Validation, validation);

        registry.register(
            ErrorCategory::Configuration,
            RepairStrategy::new(
                StrategyKind::AddParameter,
                "Derive the session id from the execution id",
                0.9,
                RiskTier::Low,
            )
            .with_param("parameter", "sessionIdExpression")
            .with_param("value", "={{ $workflow.executionId }}")
            .with_param("step_pattern", "memory"),
        );

        registry.register(
            ErrorCategory::Internal,
            RepairStrategy::new(
                StrategyKind::AddErrorHandling,
                "Wrap the code step in try/catch",
                0.6,
                RiskTier::Medium,
            )
            .with_param("step_pattern", "code"),
        );
        registry.register(
            ErrorCategory::Internal,
            RepairStrategy::new(
                StrategyKind::ReplaceStep,
                "Replace the failing step with a plain set step",
                0.4,
                RiskTier::High,
            )
            .with_param("replacement_type", "n8n-nodes-base.set"),
        );

        registry
    }

    /// Append a template for a category
    pub fn register(&mut self, category: ErrorCategory, strategy: RepairStrategy) {
        self.table.entry(category).or_default().push(strategy);
    }

    /// Replace the generic fallback
    #[inline]
    #[must_use]
    pub fn with_fallback(mut self, fallback: RepairStrategy) -> Self {
        self.fallback = fallback;
        self
    }

    /// Templates for a category, or the fallback when none are registered
    #[must_use]
    pub fn strategies_for(&self, category: ErrorCategory) -> Vec<RepairStrategy> {
        match self.table.get(&category) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => vec![self.fallback.clone()],
        }
    }

    /// Check if a category has its own templates
    #[inline]
    #[must_use]
    pub fn contains(&self, category: ErrorCategory) -> bool {
        self.table.get(&category).is_some_and(|l| !l.is_empty())
    }

    /// Number of categories with templates
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Check if no category has templates
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
