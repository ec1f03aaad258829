//! Event monitor
//!
//! Turns the engine's execution listing into [`Event`]s:
//! - a watermark (latest execution time seen) plus a re-read overlap, so
//!   clock skew never drops an execution between polls
//! - a bounded dedupe cache keyed by execution id and outcome, so re-reading
//!   the overlap never emits an event twice
//! - rolling-window anomaly detection that emits synthetic
//!   [`EventOutcome::SystemAnomaly`] events
//! - a TTL cache of workflow definitions to resolve failing step types

use crate::config::{AnomalyConfig, MonitoringConfig};
use chrono::{DateTime, Utc};
use mend_model::{
    with_deadline, AnomalyKind, Event, EventOutcome, ExecutionId, ExecutionInfo, StepError,
    TargetError, TargetId, TargetState, TargetSystem,
};
use moka::future::Cache as AsyncCache;
use moka::sync::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Target id used for fleet-wide anomalies
pub const FLEET_TARGET: &str = "*";

/// Monitor statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorStats {
    /// Distinct execution outcomes observed
    pub executions_seen: u64,
    /// Failures observed
    pub failures: u64,
    /// Anomalies raised
    pub anomalies: u64,
    /// Failure fraction over the rolling window
    pub error_rate: f64,
    /// Mean duration over the rolling window
    pub mean_duration_ms: Option<u64>,
    /// Latest execution time seen
    pub watermark: Option<DateTime<Utc>>,
}

/// Rolling-window anomaly detector
#[derive(Debug)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
    durations: VecDeque<u64>,
    outcomes: VecDeque<bool>,
    streaks: HashMap<TargetId, u32>,
    rate_alarm: bool,
}

impl AnomalyDetector {
    /// Create detector
    #[must_use]
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            durations: VecDeque::new(),
            outcomes: VecDeque::new(),
            streaks: HashMap::new(),
            rate_alarm: false,
        }
    }

    /// Feed one finished execution, returning any anomalies it raises
    pub fn observe(&mut self, info: &ExecutionInfo, failed: bool) -> Vec<Event> {
        let at = info.observed_at();
        let mut raised = Vec::new();

        if let Some(duration) = info.duration_ms() {
            if self.durations.len() >= self.config.min_samples {
                if let Some(mean) = self.mean_duration() {
                    #[allow(clippy::cast_precision_loss)]
                    let slow = duration as f64 > mean as f64 * self.config.duration_multiplier;
                    if slow {
                        raised.push(Event::anomaly(
                            info.target_id.clone(),
                            AnomalyKind::SlowExecution {
                                duration_ms: duration,
                                mean_ms: mean,
                            },
                            at,
                        ));
                    }
                }
            }
            push_bounded(&mut self.durations, duration, self.config.window_size);
        }

        if failed {
            let streak = self.streaks.entry(info.target_id.clone()).or_insert(0);
            *streak += 1;
            // fire once, when the streak reaches the threshold
            if *streak == self.config.consecutive_failures {
                raised.push(Event::anomaly(
                    info.target_id.clone(),
                    AnomalyKind::ConsecutiveFailures { count: *streak },
                    at,
                ));
            }
        } else {
            self.streaks.remove(&info.target_id);
        }

        push_bounded(&mut self.outcomes, failed, self.config.window_size);
        if self.outcomes.len() >= self.config.min_samples {
            let rate = self.error_rate();
            if rate > self.config.error_rate && !self.rate_alarm {
                self.rate_alarm = true;
                raised.push(Event::anomaly(
                    TargetId::from(FLEET_TARGET),
                    AnomalyKind::ErrorRate { rate },
                    at,
                ));
            } else if rate <= self.config.error_rate {
                self.rate_alarm = false;
            }
        }
        raised
    }

    /// Failure fraction over the window
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|f| **f).count();
        #[allow(clippy::cast_precision_loss)]
        let rate = failures as f64 / self.outcomes.len() as f64;
        rate
    }

    /// Mean duration over the window
    #[must_use]
    pub fn mean_duration(&self) -> Option<u64> {
        if self.durations.is_empty() {
            return None;
        }
        let total: u128 = self.durations.iter().map(|d| u128::from(*d)).sum();
        u64::try_from(total / self.durations.len() as u128).ok()
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, value: T, cap: usize) {
    window.push_back(value);
    while window.len() > cap {
        window.pop_front();
    }
}

/// Polls a [`TargetSystem`] for execution outcomes
pub struct EventMonitor {
    target: Arc<dyn TargetSystem>,
    config: MonitoringConfig,
    watermark: Mutex<Option<DateTime<Utc>>>,
    seen: Cache<(ExecutionId, EventOutcome), ()>,
    states: AsyncCache<TargetId, TargetState>,
    detector: Mutex<AnomalyDetector>,
    stats: Mutex<MonitorStats>,
}

impl std::fmt::Debug for EventMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMonitor")
            .field("watermark", &*self.watermark.lock())
            .field("seen", &self.seen.entry_count())
            .finish_non_exhaustive()
    }
}

impl EventMonitor {
    /// Create monitor
    #[must_use]
    pub fn new(target: Arc<dyn TargetSystem>, config: MonitoringConfig, anomaly: AnomalyConfig) -> Self {
        let seen = Cache::builder()
            .max_capacity(config.dedupe_capacity)
            .time_to_live(Duration::from_secs(config.dedupe_ttl_secs))
            .build();
        let states = AsyncCache::builder()
            .max_capacity(config.state_cache_capacity)
            .time_to_live(Duration::from_secs(config.state_cache_ttl_secs))
            .build();
        Self {
            target,
            config,
            watermark: Mutex::new(None),
            seen,
            states,
            detector: Mutex::new(AnomalyDetector::new(anomaly)),
            stats: Mutex::new(MonitorStats::default()),
        }
    }

    /// Pull new execution outcomes
    ///
    /// Returns execution events oldest first, followed by any anomalies.
    ///
    /// # Errors
    /// Returns error if the execution listing fails; step error lookups
    /// that fail only degrade the event detail
    pub async fn poll(&self) -> Result<Vec<Event>, TargetError> {
        let timeout = self.config.operation_timeout();
        let mut executions = with_deadline(
            "list_recent_executions",
            timeout,
            self.target.list_recent_executions(self.config.poll_limit),
        )
        .await?;
        executions.sort_by_key(ExecutionInfo::observed_at);

        let watermark = *self.watermark.lock();
        let overlap = chrono::Duration::seconds(i64::try_from(self.config.overlap_secs).unwrap_or(0));
        let floor = watermark.map(|w| w - overlap);
        let mut latest = watermark;
        let mut events = Vec::new();
        let mut anomalies = Vec::new();

        for info in executions {
            let at = info.observed_at();
            if floor.is_some_and(|f| at < f) {
                continue;
            }
            latest = latest.max(Some(at));

            let Some(probe) = Event::from_execution(&info, None) else {
                continue;
            };
            let key = (info.id.clone(), probe.outcome);
            if self.seen.contains_key(&key) {
                continue;
            }
            self.seen.insert(key, ());

            let event = if probe.is_failure() {
                let error = self.first_error(&info).await;
                Event::from_execution(&info, error.as_ref()).unwrap_or(probe)
            } else {
                probe
            };

            if info.is_done() {
                anomalies.extend(self.detector.lock().observe(&info, event.is_failure()));
            }
            {
                let mut stats = self.stats.lock();
                stats.executions_seen += 1;
                if event.is_failure() {
                    stats.failures += 1;
                }
            }
            events.push(event);
        }

        *self.watermark.lock() = latest;
        if !anomalies.is_empty() {
            self.stats.lock().anomalies += anomalies.len() as u64;
            tracing::warn!("monitor raised {} anomalies", anomalies.len());
        }
        tracing::debug!("poll produced {} events", events.len());
        events.extend(anomalies);
        Ok(events)
    }

    async fn first_error(&self, info: &ExecutionInfo) -> Option<StepError> {
        let lookup = with_deadline(
            "get_execution_errors",
            self.config.operation_timeout(),
            self.target.get_execution_errors(&info.id),
        )
        .await;
        let mut error = match lookup {
            Ok(errors) => errors.into_iter().next()?,
            Err(e) => {
                tracing::warn!("no step errors for {}: {}", info.id, e);
                return None;
            }
        };
        if error.step_type.is_none() {
            error.step_type = self.resolve_step(&info.target_id, &error.step).await;
        }
        Some(error)
    }

    /// Type of a named step, through the workflow definition cache
    pub async fn resolve_step(&self, target: &TargetId, step_name: &str) -> Option<String> {
        let state = match self.states.get(target).await {
            Some(state) => state,
            None => {
                let fetched = with_deadline(
                    "get_target_state",
                    self.config.operation_timeout(),
                    self.target.get_target_state(target),
                )
                .await;
                match fetched {
                    Ok(state) => {
                        self.states.insert(target.clone(), state.clone()).await;
                        state
                    }
                    Err(e) => {
                        tracing::debug!("cannot resolve step {} of {}: {}", step_name, target, e);
                        return None;
                    }
                }
            }
        };
        state.step_named(step_name).map(|s| s.step_type.clone())
    }

    /// Drop the cached definition after the workflow changed
    pub async fn invalidate(&self, target: &TargetId) {
        self.states.invalidate(target).await;
    }

    /// Latest execution time seen
    #[must_use]
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        *self.watermark.lock()
    }

    /// Resume from a persisted watermark
    pub fn set_watermark(&self, at: Option<DateTime<Utc>>) {
        *self.watermark.lock() = at;
    }

    /// Monitor statistics
    #[must_use]
    pub fn stats(&self) -> MonitorStats {
        let detector = self.detector.lock();
        MonitorStats {
            error_rate: detector.error_rate(),
            mean_duration_ms: detector.mean_duration(),
            watermark: *self.watermark.lock(),
            ..self.stats.lock().clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_model::{ExecutionStatus, MemoryTarget, Step};

    fn monitor(target: Arc<MemoryTarget>, anomaly: AnomalyConfig) -> EventMonitor {
        EventMonitor::new(target, MonitoringConfig::default(), anomaly)
    }

    fn run(id: &str, target: &str, status: ExecutionStatus, at: DateTime<Utc>, ms: i64) -> ExecutionInfo {
        ExecutionInfo {
            id: ExecutionId::from(id),
            target_id: TargetId::from(target),
            status,
            finished: status.is_finished(),
            started_at: at - chrono::Duration::milliseconds(ms),
            stopped_at: status.is_finished().then_some(at),
        }
    }

    #[tokio::test]
    async fn repolling_is_idempotent() {
        let target = Arc::new(MemoryTarget::new());
        target.record_failure("wf", StepError::new("HTTP", "NodeApiError", "ECONNREFUSED"));
        let m = monitor(target.clone(), AnomalyConfig::default());

        let first = m.poll().await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].is_failure());
        assert_eq!(first[0].error_text.as_deref(), Some("ECONNREFUSED"));
        assert!(m.poll().await.unwrap().is_empty());

        target.record_failure("wf", StepError::new("HTTP", "NodeApiError", "again"));
        assert_eq!(m.poll().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn running_then_finished_emits_both() {
        let target = Arc::new(MemoryTarget::new());
        let now = Utc::now();
        target.push_execution(run("e1", "wf", ExecutionStatus::Running, now, 0), vec![]);
        let m = monitor(target.clone(), AnomalyConfig::default());
        let events = m.poll().await.unwrap();
        assert_eq!(events[0].outcome, EventOutcome::Started);

        target.push_execution(run("e1", "wf", ExecutionStatus::Success, now, 10), vec![]);
        let events = m.poll().await.unwrap();
        assert!(events.iter().any(|e| e.outcome == EventOutcome::Completed));
    }

    #[tokio::test]
    async fn executions_behind_overlap_are_skipped() {
        let target = Arc::new(MemoryTarget::new());
        let now = Utc::now();
        target.push_execution(run("new", "wf", ExecutionStatus::Success, now, 10), vec![]);
        let m = monitor(target.clone(), AnomalyConfig::default());
        assert_eq!(m.poll().await.unwrap().len(), 1);
        assert_eq!(m.watermark(), Some(now));

        let stale = now - chrono::Duration::minutes(10);
        target.push_execution(run("old", "wf", ExecutionStatus::Error, stale, 10), vec![]);
        let within = now - chrono::Duration::seconds(30);
        target.push_execution(run("late", "wf", ExecutionStatus::Error, within, 10), vec![]);

        let events = m.poll().await.unwrap();
        let ids: Vec<_> = events.iter().filter_map(|e| e.execution_id.clone()).collect();
        assert_eq!(ids, vec![ExecutionId::from("late")]);
    }

    #[tokio::test]
    async fn step_type_is_resolved_from_definition() {
        let target = Arc::new(MemoryTarget::new());
        target.insert_target(
            "wf",
            TargetState::new("wf").with_step(Step::new("1", "Memory", "@n8n/n8n-nodes-langchain.memoryBufferWindow")),
        );
        target.record_failure("wf", StepError::new("Memory", "NodeOperationError", "Session ID is required"));
        let m = monitor(target, AnomalyConfig::default());
        let events = m.poll().await.unwrap();
        let step = events[0].step.as_ref().unwrap();
        assert_eq!(step.step_type.as_deref(), Some("@n8n/n8n-nodes-langchain.memoryBufferWindow"));
    }

    #[test]
    fn consecutive_failures_fire_once() {
        let mut detector = AnomalyDetector::new(AnomalyConfig {
            consecutive_failures: 3,
            min_samples: 1_000,
            ..AnomalyConfig::default()
        });
        let now = Utc::now();
        let mut raised = 0;
        for i in 0..6 {
            let info = run(&format!("e{i}"), "wf", ExecutionStatus::Error, now, 10);
            raised += detector.observe(&info, true).len();
        }
        assert_eq!(raised, 1);
    }

    #[test]
    fn slow_execution_needs_min_samples() {
        let mut detector = AnomalyDetector::new(AnomalyConfig {
            min_samples: 5,
            duration_multiplier: 3.0,
            ..AnomalyConfig::default()
        });
        let now = Utc::now();
        for i in 0..5 {
            let info = run(&format!("e{i}"), "wf", ExecutionStatus::Success, now, 100);
            assert!(detector.observe(&info, false).is_empty());
        }
        let slow = run("slow", "wf", ExecutionStatus::Success, now, 1_000);
        let raised = detector.observe(&slow, false);
        assert!(matches!(
            raised[0].anomaly,
            Some(AnomalyKind::SlowExecution { duration_ms: 1_000, mean_ms: 100 })
        ));
    }

    #[test]
    fn error_rate_fires_on_crossing_only() {
        let mut detector = AnomalyDetector::new(AnomalyConfig {
            min_samples: 4,
            error_rate: 0.5,
            consecutive_failures: 1_000,
            ..AnomalyConfig::default()
        });
        let now = Utc::now();
        let mut fired = Vec::new();
        for i in 0..10 {
            let info = run(&format!("e{i}"), &format!("wf{i}"), ExecutionStatus::Error, now, 10);
            fired.extend(detector.observe(&info, true));
        }
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].target_id, TargetId::from(FLEET_TARGET));
    }

    #[test]
    fn streak_resets_and_forgets_recovered_targets() {
        let mut detector = AnomalyDetector::new(AnomalyConfig {
            consecutive_failures: 2,
            min_samples: 1_000,
            ..AnomalyConfig::default()
        });
        let now = Utc::now();
        let fail = |id: &str| run(id, "wf", ExecutionStatus::Error, now, 10);

        assert!(detector.observe(&fail("e1"), true).is_empty());
        assert_eq!(detector.streaks.len(), 1);
        detector.observe(&run("e2", "wf", ExecutionStatus::Success, now, 10), false);
        assert!(detector.streaks.is_empty());

        assert!(detector.observe(&fail("e3"), true).is_empty());
        let fired = detector.observe(&fail("e4"), true);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].target_id, TargetId::from("wf"));
    }
}
