//! Rule-based classification and strategy ranking
//!
//! Scoring, per pattern whose keywords or regexes match the error text:
//!
//! ```text
//! score = w_kw * keyword_fraction + w_re * regex_fraction + w_step * step_match + bonus
//! ```
//!
//! Scores accumulate per category; the best category wins (ties go to the
//! category declared first), clamped to 1.0 and rounded to three decimals.
//! Nothing matching yields [`ErrorCategory::Unknown`].
//!
//! Ranking orders a category's strategies by threshold, descending, then
//! promotes the first whose success-dampened threshold
//! `threshold * (1 - dampening * success_rate)` is within the confidence.

use crate::cache::{AnalysisCache, AnalysisKey, CacheStats};
use crate::config::{ClassifierConfig, CredentialTable};
use crate::error::ClassifierError;
use crate::history::SuccessHistory;
use crate::patterns::{default_patterns, CompiledPattern, PatternSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mend_model::{ErrorCategory, TargetId};
use mend_repair::{RepairStrategy, StrategyKind, StrategyRegistry};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

static TIMEOUT_VALUE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)timeout.*?(\d+)").ok());
static PROPERTY_NAME: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"property '(\w+)'").ok());

/// What the classifier is told about one failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Failing workflow
    pub target_id: TargetId,
    /// Error message
    pub error_text: String,
    /// Engine error class
    pub error_type: Option<String>,
    /// Failing step name
    pub step_name: Option<String>,
    /// Failing step type
    pub step_type: Option<String>,
}

impl ErrorContext {
    /// Context with only a message
    #[must_use]
    pub fn new(target_id: TargetId, error_text: impl Into<String>) -> Self {
        Self {
            target_id,
            error_text: error_text.into(),
            error_type: None,
            step_name: None,
            step_type: None,
        }
    }

    /// Set engine error class
    #[inline]
    #[must_use]
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Set failing step
    #[inline]
    #[must_use]
    pub fn with_step(mut self, name: impl Into<String>, step_type: Option<String>) -> Self {
        self.step_name = Some(name.into());
        self.step_type = step_type;
        self
    }
}

/// Classifier output for one failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Winning category
    pub category: ErrorCategory,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Fixed human-readable cause for the category
    pub root_cause: String,
    /// Candidate strategies, primary first
    pub strategies: Vec<RepairStrategy>,
    /// Whether the primary strategy cleared its dampened threshold
    pub auto_apply: bool,
    /// Steps implicated
    pub affected_steps: Vec<String>,
    /// When the analysis was computed
    pub analyzed_at: DateTime<Utc>,
}

impl Analysis {
    /// Strategy to try first
    #[inline]
    #[must_use]
    pub fn primary(&self) -> Option<&RepairStrategy> {
        self.strategies.first()
    }
}

/// Human-readable root cause for a category
#[must_use]
pub fn root_cause(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Authentication => "Invalid or expired authentication credentials",
        ErrorCategory::Network => "Network connectivity or timeout issues",
        ErrorCategory::ExternalApi => "External service unavailable or rate limited",
        ErrorCategory::Mapping => "Incorrect data mapping or missing fields",
        ErrorCategory::Validation => "Input data failed validation",
        ErrorCategory::Internal => "Internal code or logic error",
        ErrorCategory::Timeout => "Execution exceeded its time budget",
        ErrorCategory::Credentials => "Missing or invalid API credentials",
        ErrorCategory::Configuration => "Missing or incorrect configuration parameters",
        ErrorCategory::Resource => "Engine resources exhausted",
        ErrorCategory::Unknown => "Unrecognized failure",
    }
}

/// Failure classifier
///
/// Implementations must be deterministic in category and confidence for
/// identical contexts.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify a failure and rank repair strategies
    async fn classify(&self, ctx: &ErrorContext) -> Analysis;

    /// Feed back whether a strategy fixed the problem
    fn record_outcome(&self, kind: StrategyKind, success: bool);
}

/// Classifier statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassifierStatistics {
    /// Analyses computed (cache misses)
    pub total_analyses: u64,
    /// Analyses per category
    pub category_distribution: BTreeMap<ErrorCategory, u64>,
    /// Mean confidence
    pub average_confidence: f64,
    /// Success rate per strategy kind with history
    pub success_rates: BTreeMap<StrategyKind, f64>,
    /// Cached analyses
    pub cache_entries: u64,
}

#[derive(Debug, Default)]
struct Tally {
    total: u64,
    confidence_sum: f64,
    per_category: BTreeMap<ErrorCategory, u64>,
}

/// Keyword/regex/step-type scorer backed by the strategy registry
#[derive(Debug)]
pub struct RuleClassifier {
    patterns: Vec<CompiledPattern>,
    registry: StrategyRegistry,
    credentials: CredentialTable,
    history: SuccessHistory,
    cache: AnalysisCache,
    config: ClassifierConfig,
    tally: Mutex<Tally>,
}

impl RuleClassifier {
    /// Create classifier
    ///
    /// # Errors
    /// Returns error if the configuration is out of range or a pattern fails to compile
    pub fn new(
        config: ClassifierConfig,
        registry: StrategyRegistry,
        credentials: CredentialTable,
    ) -> Result<Self, ClassifierError> {
        config.validate()?;
        let specs = config.patterns.clone().unwrap_or_else(default_patterns);
        let patterns = specs
            .iter()
            .map(CompiledPattern::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            registry,
            credentials,
            history: SuccessHistory::new(config.history_window),
            cache: AnalysisCache::with_ttl(
                config.cache_capacity,
                Duration::from_secs(config.cache_ttl_secs),
            ),
            config,
            tally: Mutex::new(Tally::default()),
        })
    }

    /// Classifier with built-in patterns and strategies
    ///
    /// # Errors
    /// Returns error if a built-in pattern fails to compile
    pub fn with_defaults() -> Result<Self, ClassifierError> {
        Self::new(
            ClassifierConfig::default(),
            StrategyRegistry::with_defaults(),
            CredentialTable::default(),
        )
    }

    /// Category and confidence for a context
    #[must_use]
    pub fn score(&self, ctx: &ErrorContext) -> (ErrorCategory, f64) {
        let text = match &ctx.error_type {
            Some(t) => format!("{} {t}", ctx.error_text),
            None => ctx.error_text.clone(),
        }
        .to_lowercase();
        let step_haystacks: Vec<String> = [ctx.step_type.as_deref(), ctx.step_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::to_lowercase)
            .collect();
        let w = self.config.weights;

        let mut totals: Vec<(ErrorCategory, f64)> = Vec::new();
        for pattern in &self.patterns {
            let keywords = pattern
                .keywords
                .iter()
                .filter(|k| text.contains(k.as_str()))
                .count();
            let regexes = pattern.regexes.iter().filter(|r| r.is_match(&text)).count();
            if keywords == 0 && regexes == 0 {
                continue;
            }
            let step_match = pattern
                .step_types
                .iter()
                .any(|t| step_haystacks.iter().any(|h| h.contains(t.as_str())));

            let mut score = w.keyword * fraction(keywords, pattern.keywords.len())
                + w.regex * fraction(regexes, pattern.regexes.len())
                + pattern.bonus;
            if step_match {
                score += w.step_type;
            }

            match totals.iter_mut().find(|(c, _)| *c == pattern.category) {
                Some((_, total)) => *total += score,
                None => totals.push((pattern.category, score)),
            }
        }

        let mut best: Option<(ErrorCategory, f64)> = None;
        for (category, total) in totals {
            if best.map_or(true, |(_, b)| total > b) {
                best = Some((category, total));
            }
        }
        match best {
            Some((category, total)) if total > 0.0 => (category, round3(total.min(1.0))),
            _ => (ErrorCategory::Unknown, self.config.unknown_confidence),
        }
    }

    /// Ranked, adapted strategies and whether the primary may auto-apply
    #[must_use]
    pub fn rank(
        &self,
        category: ErrorCategory,
        confidence: f64,
        ctx: &ErrorContext,
    ) -> (Vec<RepairStrategy>, bool) {
        let mut strategies: Vec<RepairStrategy> = self
            .registry
            .strategies_for(category)
            .into_iter()
            .map(|s| self.adapt(s, category, ctx))
            .collect();
        strategies.sort_by(|a, b| b.confidence_threshold.total_cmp(&a.confidence_threshold));

        let dampening = self.config.success_dampening;
        let qualified = strategies.iter().position(|s| {
            let rate = self.history.rate(s.kind).unwrap_or(0.0);
            s.confidence_threshold * (1.0 - dampening * rate) <= confidence + 1e-9
        });
        match qualified {
            Some(index) => {
                let primary = strategies.remove(index);
                strategies.insert(0, primary);
                (strategies, true)
            }
            None => (strategies, false),
        }
    }

    fn adapt(&self, mut strategy: RepairStrategy, category: ErrorCategory, ctx: &ErrorContext) -> RepairStrategy {
        let step_is_code = ctx
            .step_type
            .as_deref()
            .is_some_and(|t| t.to_lowercase().contains("code"));
        match strategy.kind {
            StrategyKind::IncreaseTimeout => {
                if let Some(stated) = extract_timeout(&ctx.error_text) {
                    let floor = strategy.param_u64("timeout").unwrap_or(0);
                    strategy.set_param("timeout", stated.saturating_mul(2).max(floor));
                }
            }
            StrategyKind::UpdateMapping => {
                if let Some(field) = extract_property(&ctx.error_text) {
                    strategy.set_param("field", field);
                }
            }
            StrategyKind::FixCredentialReference => {
                let found = self.credentials.lookup(
                    category,
                    ctx.step_name.as_deref(),
                    ctx.step_type.as_deref(),
                );
                if let Some(reference) = found {
                    strategy.set_param("credential_type", reference.credential_type.clone());
                    strategy.set_param("credential_id", reference.credential_id.clone());
                    if let Some(name) = &reference.credential_name {
                        strategy.set_param("credential_name", name.clone());
                    }
                    if let Some(step) = &ctx.step_name {
                        strategy.set_param("step", step.clone());
                    }
                }
            }
            StrategyKind::ReplaceStep => {
                if let Some(step) = &ctx.step_name {
                    strategy.set_param("step", step.clone());
                }
            }
            StrategyKind::AddErrorHandling | StrategyKind::AddInputValidation if step_is_code => {
                if let Some(step) = &ctx.step_name {
                    strategy.set_param("step", step.clone());
                }
            }
            _ => {}
        }
        strategy
    }

    /// Active pattern set, for export
    #[must_use]
    pub fn export_patterns(&self) -> Vec<PatternSpec> {
        self.patterns.iter().map(|p| p.spec().clone()).collect()
    }

    /// Recorded outcomes
    #[inline]
    #[must_use]
    pub fn history(&self) -> &SuccessHistory {
        &self.history
    }

    /// Drop cached analyses
    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
        tracing::debug!("analysis cache cleared");
    }

    /// Cache statistics
    #[inline]
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Classifier statistics
    #[must_use]
    pub fn statistics(&self) -> ClassifierStatistics {
        let tally = self.tally.lock();
        #[allow(clippy::cast_precision_loss)]
        let average_confidence = if tally.total == 0 {
            0.0
        } else {
            tally.confidence_sum / tally.total as f64
        };
        ClassifierStatistics {
            total_analyses: tally.total,
            category_distribution: tally.per_category.clone(),
            average_confidence,
            success_rates: self.history.rates(),
            cache_entries: self.cache.stats().entry_count,
        }
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    async fn classify(&self, ctx: &ErrorContext) -> Analysis {
        let key = AnalysisKey::of(ctx);
        if let Some(cached) = self.cache.get(&key).await {
            tracing::debug!("analysis cache hit for {}", ctx.target_id);
            return cached;
        }

        let (category, confidence) = self.score(ctx);
        let (strategies, auto_apply) = self.rank(category, confidence, ctx);
        let analysis = Analysis {
            category,
            confidence,
            root_cause: root_cause(category).to_string(),
            strategies,
            auto_apply,
            affected_steps: ctx.step_name.iter().cloned().collect(),
            analyzed_at: Utc::now(),
        };

        {
            let mut tally = self.tally.lock();
            tally.total += 1;
            tally.confidence_sum += confidence;
            *tally.per_category.entry(category).or_insert(0) += 1;
        }
        self.cache.insert(key, analysis.clone()).await;

        tracing::info!(
            "classified {} failure as {} (confidence {:.3}, {} strategies)",
            ctx.target_id,
            category,
            confidence,
            analysis.strategies.len()
        );
        analysis
    }

    fn record_outcome(&self, kind: StrategyKind, success: bool) {
        self.history.record(kind, success);
        // rankings depend on history
        self.cache.invalidate_all();
        tracing::debug!("recorded {} outcome: {}", kind, if success { "success" } else { "failure" });
    }
}

#[allow(clippy::cast_precision_loss)]
fn fraction(hits: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn extract_timeout(text: &str) -> Option<u64> {
    TIMEOUT_VALUE.as_ref()?.captures(text)?.get(1)?.as_str().parse().ok()
}

fn extract_property(text: &str) -> Option<String> {
    Some(PROPERTY_NAME.as_ref()?.captures(text)?.get(1)?.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> RuleClassifier {
        RuleClassifier::with_defaults().unwrap()
    }

    fn ctx(text: &str) -> ErrorContext {
        ErrorContext::new(TargetId::from("wf"), text)
    }

    #[tokio::test]
    async fn session_id_on_memory_step_is_configuration() {
        let analysis = classifier()
            .classify(
                &ctx("Session ID is required but not provided")
                    .with_error_type("NodeOperationError")
                    .with_step(
                        "Window Buffer Memory",
                        Some("@n8n/n8n-nodes-langchain.memoryBufferWindow".into()),
                    ),
            )
            .await;

        assert_eq!(analysis.category, ErrorCategory::Configuration);
        assert!(analysis.confidence >= 0.9);
        assert!(analysis.auto_apply);
        let primary = analysis.primary().unwrap();
        assert_eq!(primary.kind, StrategyKind::AddParameter);
        assert_eq!(primary.param_str("parameter"), Some("sessionIdExpression"));
        assert_eq!(analysis.affected_steps, vec!["Window Buffer Memory".to_string()]);
    }

    #[tokio::test]
    async fn connection_refused_is_network() {
        let analysis = classifier()
            .classify(
                &ctx("ECONNREFUSED: Connection refused")
                    .with_error_type("network_error")
                    .with_step("HTTP Request", Some("n8n-nodes-base.httpRequest".into())),
            )
            .await;

        assert_eq!(analysis.category, ErrorCategory::Network);
        assert!((0.6..=0.9).contains(&analysis.confidence), "{}", analysis.confidence);
        let kinds: Vec<_> = analysis.strategies.iter().map(|s| s.kind).collect();
        assert!(kinds.contains(&StrategyKind::IncreaseTimeout));
        assert!(kinds.contains(&StrategyKind::AddRetry));
    }

    #[test]
    fn unmatched_text_is_unknown_with_fallback() {
        let c = classifier();
        let context = ctx("something odd happened");
        let (category, confidence) = c.score(&context);
        assert_eq!(category, ErrorCategory::Unknown);
        assert!((confidence - 0.1).abs() < f64::EPSILON);

        let (strategies, auto) = c.rank(category, confidence, &context);
        assert_eq!(strategies[0].kind, StrategyKind::AddErrorHandling);
        assert!(!auto);
    }

    #[test]
    fn stated_timeout_is_doubled_but_never_below_template() {
        let c = classifier();
        let context = ctx("Request timeout after 45000ms");
        let (strategies, _) = c.rank(ErrorCategory::Network, 0.8, &context);
        let timeout = strategies
            .iter()
            .find(|s| s.kind == StrategyKind::IncreaseTimeout)
            .unwrap();
        assert_eq!(timeout.param_u64("timeout"), Some(90_000));

        let (strategies, _) = c.rank(ErrorCategory::Network, 0.8, &ctx("timeout of 5 seconds"));
        let timeout = strategies
            .iter()
            .find(|s| s.kind == StrategyKind::IncreaseTimeout)
            .unwrap();
        assert_eq!(timeout.param_u64("timeout"), Some(60_000));
    }

    #[test]
    fn mapping_field_is_extracted() {
        let c = classifier();
        let (strategies, _) = c.rank(
            ErrorCategory::Mapping,
            0.9,
            &ctx("Cannot read property 'email' of undefined"),
        );
        let mapping = strategies
            .iter()
            .find(|s| s.kind == StrategyKind::UpdateMapping)
            .unwrap();
        assert_eq!(mapping.param_str("field"), Some("email"));
    }

    #[test]
    fn success_history_promotes_lower_ranked_strategy() {
        let c = classifier();
        let context = ctx("HTTP 503 from upstream");
        // thresholds: add-retry 0.8, add-circuit-breaker 0.6
        let (strategies, auto) = c.rank(ErrorCategory::ExternalApi, 0.7, &context);
        assert!(auto);
        assert_eq!(strategies[0].kind, StrategyKind::AddCircuitBreaker);

        for _ in 0..10 {
            c.record_outcome(StrategyKind::AddRetry, true);
        }
        // 0.8 * (1 - 0.2) = 0.64 <= 0.7
        let (strategies, auto) = c.rank(ErrorCategory::ExternalApi, 0.7, &context);
        assert!(auto);
        assert_eq!(strategies[0].kind, StrategyKind::AddRetry);
    }

    #[test]
    fn low_confidence_keeps_highest_threshold_first_but_not_auto() {
        let c = classifier();
        let (strategies, auto) = c.rank(ErrorCategory::Internal, 0.2, &ctx("TypeError"));
        assert!(!auto);
        assert_eq!(strategies[0].kind, StrategyKind::AddErrorHandling);
    }

    #[test]
    fn credential_reference_comes_from_table() {
        use crate::config::CredentialRef;
        let table = CredentialTable::new().with_ref(
            ErrorCategory::Authentication,
            CredentialRef {
                step_match: "openrouter".into(),
                credential_type: "openRouterApi".into(),
                credential_id: "cred-1".into(),
                credential_name: None,
            },
        );
        let c = RuleClassifier::new(ClassifierConfig::default(), StrategyRegistry::with_defaults(), table)
            .unwrap();
        let context = ctx("401 Unauthorized").with_step("OpenRouter Chat Model", None);
        let (strategies, _) = c.rank(ErrorCategory::Authentication, 0.9, &context);
        assert_eq!(strategies[0].param_str("credential_id"), Some("cred-1"));
        assert_eq!(strategies[0].param_str("step"), Some("OpenRouter Chat Model"));
    }

    #[tokio::test]
    async fn statistics_count_cache_misses() {
        let c = classifier();
        let context = ctx("ETIMEDOUT").with_error_type("network_error");
        c.classify(&context).await;
        c.classify(&context).await;
        let stats = c.statistics();
        assert_eq!(stats.total_analyses, 1);
        assert_eq!(stats.category_distribution.get(&ErrorCategory::Network), Some(&1));
    }

    #[test]
    fn exported_patterns_match_defaults() {
        assert_eq!(classifier().export_patterns(), default_patterns());
    }
}
