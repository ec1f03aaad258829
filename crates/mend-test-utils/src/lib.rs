//! Testing utilities for the Mend workspace
//!
//! Shared fixtures, fake collaborators and a wired-up orchestrator harness.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::Utc;
use mend_classifier::{root_cause, Analysis, Classifier, ErrorContext};
use mend_core::{LoopMetrics, MendConfig, Orchestrator};
use mend_model::{
    ErrorCategory, ManualClock, MemoryTarget, NotificationLevel, Notifier, Step, StepError,
    TargetId, TargetState,
};
use mend_repair::{RepairStrategy, RiskTier, StrategyKind};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

pub const CHAT: &str = "chat";
pub const FETCH: &str = "fetch";
pub const TRANSFORM: &str = "transform";

pub fn chat_workflow() -> TargetState {
    TargetState::new("Support chat")
        .with_step(Step::new("1", "Webhook", "n8n-nodes-base.webhook"))
        .with_step(Step::new(
            "2",
            "Window Buffer Memory",
            "@n8n/n8n-nodes-langchain.memoryBufferWindow",
        ))
}

pub fn http_workflow() -> TargetState {
    TargetState::new("Fetch prices").with_step(
        Step::new("1", "HTTP Request", "n8n-nodes-base.httpRequest")
            .with_parameter("url", json!("https://api.example.com/prices"))
            .with_parameter("options", json!({ "timeout": 10_000 })),
    )
}

pub fn code_workflow() -> TargetState {
    TargetState::new("Transform orders").with_step(
        Step::new("1", "Code", "n8n-nodes-base.code")
            .with_parameter("jsCode", json!("return items.map(i => i.json.order.id);")),
    )
}

pub fn session_error() -> StepError {
    StepError::new(
        "Window Buffer Memory",
        "NodeOperationError",
        "Session ID is required but not provided",
    )
    .with_step_type("@n8n/n8n-nodes-langchain.memoryBufferWindow")
}

pub fn timeout_error() -> StepError {
    StepError::new("HTTP Request", "NodeApiError", "Request timeout after 45000ms")
        .with_step_type("n8n-nodes-base.httpRequest")
}

pub fn mapping_error() -> StepError {
    StepError::new("Code", "TypeError", "Cannot read property 'order' of undefined")
        .with_step_type("n8n-nodes-base.code")
}

/// Engine holding the chat, fetch and transform workflows
pub fn seeded_target() -> Arc<MemoryTarget> {
    let target = MemoryTarget::new();
    target.insert_target(CHAT, chat_workflow());
    target.insert_target(FETCH, http_workflow());
    target.insert_target(TRANSFORM, code_workflow());
    Arc::new(target)
}

/// Defaults with a health check every tick and no backup pruning
pub fn test_config() -> MendConfig {
    let mut config = MendConfig::default();
    config.monitoring.health_check_interval_secs = 0;
    config.monitoring.operation_timeout_secs = 5;
    config.repair.prune_interval_secs = u64::MAX / 2;
    config
}

pub fn cooldown(config: &MendConfig) -> chrono::Duration {
    config.safety.cooldown() + chrono::Duration::seconds(1)
}

/// Notifier that keeps every message
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, NotificationLevel)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, NotificationLevel)> {
        self.messages.lock().clone()
    }

    pub fn count(&self, level: NotificationLevel) -> usize {
        self.messages.lock().iter().filter(|(_, l)| *l == level).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str, level: NotificationLevel) {
        self.messages.lock().push((message.to_string(), level));
    }
}

/// Classifier that always returns the same verdict
#[derive(Debug)]
pub struct FixedClassifier {
    pub category: ErrorCategory,
    pub confidence: f64,
    pub strategy: RepairStrategy,
    pub outcomes: Mutex<Vec<(StrategyKind, bool)>>,
}

impl FixedClassifier {
    pub fn new(category: ErrorCategory, confidence: f64, strategy: RepairStrategy) -> Self {
        Self {
            category,
            confidence,
            strategy,
            outcomes: Mutex::new(Vec::new()),
        }
    }

    /// Session fix on the chat workflow at the given confidence
    pub fn session(confidence: f64) -> Self {
        Self::new(ErrorCategory::Configuration, confidence, session_strategy())
    }

    pub fn outcomes(&self) -> Vec<(StrategyKind, bool)> {
        self.outcomes.lock().clone()
    }
}

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(&self, ctx: &ErrorContext) -> Analysis {
        Analysis {
            category: self.category,
            confidence: self.confidence,
            root_cause: root_cause(self.category).to_string(),
            strategies: vec![self.strategy.clone()],
            auto_apply: self.strategy.confidence_threshold <= self.confidence,
            affected_steps: ctx.step_name.iter().cloned().collect(),
            analyzed_at: Utc::now(),
        }
    }

    fn record_outcome(&self, kind: StrategyKind, success: bool) {
        self.outcomes.lock().push((kind, success));
    }
}

pub fn session_strategy() -> RepairStrategy {
    RepairStrategy::new(
        StrategyKind::AddParameter,
        "Derive the session id from the execution id",
        0.9,
        RiskTier::Low,
    )
    .with_param("parameter", "sessionIdExpression")
    .with_param("value", "={{ $workflow.executionId }}")
    .with_param("step_pattern", "memory")
}

/// Orchestrator wired to in-memory collaborators and a manual clock
pub struct Harness {
    pub target: Arc<MemoryTarget>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(config: MendConfig, classifier: Arc<dyn Classifier>) -> Self {
        let target = seeded_target();
        let clock = Arc::new(ManualClock::default());
        let notifier = Arc::new(RecordingNotifier::new());
        let orchestrator = Orchestrator::with_clock(
            config,
            target.clone(),
            classifier,
            notifier.clone(),
            clock.clone(),
        );
        Self {
            target,
            clock,
            notifier,
            orchestrator,
        }
    }

    pub fn fail(&self, target: &str, error: StepError) {
        self.target.record_failure(target, error);
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }

    pub async fn metrics(&self) -> LoopMetrics {
        self.orchestrator.metrics().await
    }

    pub fn id(name: &str) -> TargetId {
        TargetId::from(name)
    }
}
