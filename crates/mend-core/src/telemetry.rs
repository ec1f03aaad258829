//! Loop telemetry
//!
//! Counters are emitted through the `metrics` facade; without an installed
//! recorder they are no-ops. [`LoopMetrics`] is the in-process summary
//! returned by the orchestrator's `metrics()` and `status()`.

use crate::incident::{Incident, Phase};
use crate::monitor::MonitorStats;
use mend_repair::{ApplierStats, StrategyKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Incidents opened
pub const INCIDENTS_OPENED: &str = "mend_incidents_opened_total";
/// Incidents resolved
pub const INCIDENTS_RESOLVED: &str = "mend_incidents_resolved_total";
/// Incidents escalated
pub const INCIDENTS_ESCALATED: &str = "mend_incidents_escalated_total";
/// Fix attempts, labelled by strategy kind
pub const FIX_ATTEMPTS: &str = "mend_fix_attempts_total";
/// Anomalies, labelled by anomaly kind
pub const ANOMALIES: &str = "mend_anomalies_total";

pub(crate) fn incident_opened() {
    metrics::counter!(INCIDENTS_OPENED).increment(1);
}

pub(crate) fn incident_resolved() {
    metrics::counter!(INCIDENTS_RESOLVED).increment(1);
}

pub(crate) fn incident_escalated() {
    metrics::counter!(INCIDENTS_ESCALATED).increment(1);
}

pub(crate) fn fix_attempted(kind: StrategyKind) {
    metrics::counter!(FIX_ATTEMPTS, "kind" => kind.as_str()).increment(1);
}

pub(crate) fn anomaly(kind: &'static str) {
    metrics::counter!(ANOMALIES, "kind" => kind).increment(1);
}

/// Incident totals and rates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopMetrics {
    /// Incidents currently tracked
    pub active: usize,
    /// Incidents ever opened
    pub total: usize,
    /// Resolved incidents
    pub resolved: usize,
    /// Escalated incidents
    pub escalated: usize,
    /// Resolved over finished incidents
    pub resolution_rate: f64,
    /// Mean seconds from opening to resolution
    pub mean_resolution_secs: Option<f64>,
    /// Fix attempts across all incidents
    pub fix_attempts: u64,
    /// Whether the loop is in emergency
    pub emergency: bool,
}

impl LoopMetrics {
    /// Summarise active and finished incidents
    #[must_use]
    pub fn from_incidents(active: &[Incident], history: &[Incident], fix_attempts: u64) -> Self {
        let resolved: Vec<&Incident> = history.iter().filter(|i| i.resolved).collect();
        let escalated = history.iter().filter(|i| i.escalated).count();
        let finished = resolved.len() + escalated;
        #[allow(clippy::cast_precision_loss)]
        let resolution_rate = if finished == 0 {
            0.0
        } else {
            resolved.len() as f64 / finished as f64
        };
        let durations: Vec<f64> = resolved
            .iter()
            .filter_map(|i| i.resolution_time())
            .map(|d| d.num_milliseconds() as f64 / 1_000.0)
            .collect();
        #[allow(clippy::cast_precision_loss)]
        let mean_resolution_secs =
            (!durations.is_empty()).then(|| durations.iter().sum::<f64>() / durations.len() as f64);
        Self {
            active: active.len(),
            total: active.len() + history.len(),
            resolved: resolved.len(),
            escalated,
            resolution_rate,
            mean_resolution_secs,
            fix_attempts,
            emergency: false,
        }
    }
}

/// Full loop status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopStatus {
    /// Incident totals
    pub metrics: LoopMetrics,
    /// Active incidents per phase
    pub phases: BTreeMap<Phase, usize>,
    /// Monitor counters
    pub monitor: MonitorStats,
    /// Applier counters
    pub applier: ApplierStats,
    /// Audit entries recorded
    pub audit_entries: usize,
}
