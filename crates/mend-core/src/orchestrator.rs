//! Incident orchestrator
//!
//! One tick:
//! 1. health check (when due); repeated failure enters emergency
//! 2. poll the monitor and fold events into incidents
//! 3. advance every active incident, up to `workers` at a time
//! 4. retire resolved and escalated incidents to history
//! 5. prune expired backups (when due) and optionally snapshot
//!
//! Every transition is appended to the audit log before its side effect
//! runs. A per-incident mutex taken with `try_lock` keeps at most one
//! operation in flight per incident.

use crate::audit::{AuditAction, AuditLog};
use crate::config::MendConfig;
use crate::error::OrchestratorError;
use crate::incident::{ApprovalRequest, Incident, Phase, Verification};
use crate::monitor::EventMonitor;
use crate::persistence::{Snapshot, StateStore, SNAPSHOT_VERSION};
use crate::state_machine::validate_transition;
use crate::telemetry::{self, LoopMetrics, LoopStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use mend_classifier::{Analysis, Classifier};
use mend_model::{
    with_deadline, Clock, Event, EventOutcome, ExecutionStatus, FixId, IncidentId,
    NotificationLevel, Notifier, SystemClock, TargetId, TargetSystem,
};
use mend_repair::ChangeApplier;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

type Slot = Arc<Mutex<Incident>>;

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Events received from the monitor
    pub events: usize,
    /// Anomalies among them
    pub anomalies: usize,
    /// Incidents opened
    pub opened: usize,
    /// Incidents advanced
    pub processed: usize,
    /// Incidents skipped because another operation held them
    pub busy: usize,
    /// Incidents resolved
    pub resolved: usize,
    /// Incidents escalated
    pub escalated: usize,
}

/// The remediation control loop
pub struct Orchestrator {
    config: MendConfig,
    target: Arc<dyn TargetSystem>,
    classifier: Arc<dyn Classifier>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    applier: ChangeApplier,
    monitor: EventMonitor,
    audit: AuditLog,
    store: Option<StateStore>,
    active: DashMap<IncidentId, Slot>,
    by_target: DashMap<TargetId, IncidentId>,
    history: parking_lot::Mutex<Vec<Incident>>,
    health_failures: AtomicU32,
    emergency: AtomicBool,
    fix_attempts: AtomicU64,
    last_health_check: parking_lot::Mutex<Option<DateTime<Utc>>>,
    last_prune: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("active", &self.active.len())
            .field("history", &self.history.lock().len())
            .field("emergency", &self.emergency.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create orchestrator on the wall clock
    #[must_use]
    pub fn new(
        config: MendConfig,
        target: Arc<dyn TargetSystem>,
        classifier: Arc<dyn Classifier>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_clock(config, target, classifier, notifier, Arc::new(SystemClock))
    }

    /// Create orchestrator reading time from `clock`
    #[must_use]
    pub fn with_clock(
        config: MendConfig,
        target: Arc<dyn TargetSystem>,
        classifier: Arc<dyn Classifier>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let applier = ChangeApplier::new(target.clone(), clock.clone(), config.applier_config());
        let monitor = EventMonitor::new(
            target.clone(),
            config.monitoring.clone(),
            config.anomaly.clone(),
        );
        Self {
            config,
            target,
            classifier,
            notifier,
            clock,
            applier,
            monitor,
            audit: AuditLog::new(),
            store: None,
            active: DashMap::new(),
            by_target: DashMap::new(),
            history: parking_lot::Mutex::new(Vec::new()),
            health_failures: AtomicU32::new(0),
            emergency: AtomicBool::new(false),
            fix_attempts: AtomicU64::new(0),
            last_health_check: parking_lot::Mutex::new(None),
            last_prune: parking_lot::Mutex::new(None),
        }
    }

    /// Persist snapshots through `store`
    #[must_use]
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    // ---- lifecycle ----

    /// Reload the last snapshot, if any
    ///
    /// Returns whether a snapshot was found.
    ///
    /// # Errors
    /// Returns error if the snapshot is unreadable or its audit chain is broken
    pub async fn restore(&self) -> Result<bool, OrchestratorError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(snapshot) = store.load()? else {
            return Ok(false);
        };
        self.audit.restore(snapshot.audit)?;
        for incident in snapshot.active {
            self.by_target.insert(incident.target_id.clone(), incident.id);
            self.active.insert(incident.id, Arc::new(Mutex::new(incident)));
        }
        *self.history.lock() = snapshot.history;
        self.applier.backups().restore(snapshot.backups);
        self.applier.restore_fixes(snapshot.fixes);
        self.monitor.set_watermark(snapshot.watermark);
        let attempts = self.count_attempts().await;
        self.fix_attempts.store(attempts, Ordering::Relaxed);
        if snapshot.emergency {
            tracing::warn!("previous run stopped in emergency; resuming after operator restart");
        }
        tracing::info!(
            "restored {} active incidents, {} audit entries",
            self.active.len(),
            self.audit.len()
        );
        Ok(true)
    }

    async fn count_attempts(&self) -> u64 {
        let mut total: u64 = self.history.lock().iter().map(|i| u64::from(i.attempts)).sum();
        for slot in self.slots() {
            total += u64::from(slot.lock().await.attempts);
        }
        total
    }

    /// Current state as a snapshot
    pub async fn snapshot(&self) -> Snapshot {
        let mut active = Vec::with_capacity(self.active.len());
        for slot in self.slots() {
            active.push(slot.lock().await.clone());
        }
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Some(self.clock.now()),
            active,
            history: self.history.lock().clone(),
            audit: self.audit.entries(),
            backups: self.applier.backups().snapshot(),
            fixes: self.applier.fixes_snapshot(),
            watermark: self.monitor.watermark(),
            emergency: self.is_emergency(),
        }
    }

    /// Write a snapshot if a store is configured
    ///
    /// # Errors
    /// Returns error if the snapshot cannot be written
    pub async fn persist(&self) -> Result<(), OrchestratorError> {
        if let Some(store) = &self.store {
            store.save(&self.snapshot().await)?;
        }
        Ok(())
    }

    /// Run until `shutdown` flips to true or an emergency halts the loop
    ///
    /// The tick in progress finishes before shutdown; state is persisted on
    /// the way out.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::Emergency`] if the target stays unreachable
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), OrchestratorError> {
        let mut interval = tokio::time::interval(self.config.monitoring.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            "remediation loop started (poll every {}s, {} workers)",
            self.config.monitoring.poll_interval_secs,
            self.config.workers
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) => tracing::debug!("tick: {:?}", report),
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => tracing::warn!("tick failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("shutting down, persisting state");
        self.persist().await
    }

    /// One pass of the control loop
    ///
    /// # Errors
    /// Returns [`OrchestratorError::Emergency`] while in emergency, or
    /// persistence errors when snapshotting every tick
    pub async fn tick(&self) -> Result<TickReport, OrchestratorError> {
        if self.is_emergency() {
            return Err(OrchestratorError::Emergency {
                failures: self.health_failures.load(Ordering::Relaxed),
            });
        }
        self.health_check_if_due().await?;

        let mut report = TickReport::default();
        match self.monitor.poll().await {
            Ok(events) => {
                report.events = events.len();
                for event in &events {
                    match self.ingest(event).await {
                        Ok(Ingested::Anomaly) => report.anomalies += 1,
                        Ok(Ingested::Opened) => report.opened += 1,
                        Ok(Ingested::Updated | Ingested::Ignored) => {}
                        Err(e) => tracing::warn!("cannot ingest event {}: {}", event.id, e),
                    }
                }
            }
            Err(e) => tracing::warn!("poll failed: {}", e),
        }

        let ids: Vec<IncidentId> = self.active.iter().map(|e| *e.key()).collect();
        let outcomes: Vec<Option<Phase>> = stream::iter(ids)
            .map(|id| self.process(id))
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            match outcome {
                Some(_) => report.processed += 1,
                None => report.busy += 1,
            }
        }

        let (resolved, escalated) = self.retire().await;
        report.resolved = resolved;
        report.escalated = escalated;

        self.prune_if_due()?;
        if self.config.persistence.snapshot_every_tick {
            self.persist().await?;
        }
        Ok(report)
    }

    // ---- operator actions ----

    /// Approve the pending fix of an incident
    ///
    /// # Errors
    /// Returns error if the incident is unknown, busy or not awaiting approval
    pub async fn approve(&self, id: &IncidentId) -> Result<(), OrchestratorError> {
        let slot = self.slot(id)?;
        let mut incident = slot.lock().await;
        expect_phase(&incident, Phase::PendingApproval)?;
        let Some(request) = incident.approval.clone() else {
            return Err(OrchestratorError::WrongPhase {
                id: *id,
                phase: incident.phase,
                expected: Phase::PendingApproval,
            });
        };
        self.record(
            AuditAction::Approved,
            &incident,
            json!({ "strategy": request.strategy.kind, "confidence": request.confidence }),
        )?;
        self.transition(&mut incident, Phase::Fixing, "approved by operator")?;
        incident.strategy = Some(request.strategy);
        incident.approval = None;
        Ok(())
    }

    /// Reject the pending fix; the incident parks until the next failure
    ///
    /// # Errors
    /// Returns error if the incident is unknown or not awaiting approval
    pub async fn reject(&self, id: &IncidentId) -> Result<(), OrchestratorError> {
        let slot = self.slot(id)?;
        let mut incident = slot.lock().await;
        expect_phase(&incident, Phase::PendingApproval)?;
        self.record(AuditAction::Rejected, &incident, json!({}))?;
        self.park_from_approval(&mut incident, "rejected by operator")
    }

    /// Escalate an incident by hand
    ///
    /// # Errors
    /// Returns error if the incident is unknown
    pub async fn escalate(&self, id: &IncidentId, reason: &str) -> Result<(), OrchestratorError> {
        let slot = self.slot(id)?;
        {
            let mut incident = slot.lock().await;
            self.escalate_incident(&mut incident, reason).await?;
        }
        self.retire().await;
        Ok(())
    }

    // ---- queries ----

    /// Active incident by id
    pub async fn incident(&self, id: &IncidentId) -> Option<Incident> {
        let slot = self.active.get(id).map(|e| e.value().clone())?;
        let incident = slot.lock().await.clone();
        Some(incident)
    }

    /// Active incident for a workflow
    pub async fn incident_for(&self, target: &TargetId) -> Option<Incident> {
        let id = self.by_target.get(target).map(|e| *e.value())?;
        self.incident(&id).await
    }

    /// All active incidents, oldest first
    pub async fn active_incidents(&self) -> Vec<Incident> {
        self.snapshot_active().await
    }

    async fn snapshot_active(&self) -> Vec<Incident> {
        let mut out = Vec::with_capacity(self.active.len());
        for slot in self.slots() {
            out.push(slot.lock().await.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Resolved and escalated incidents
    #[must_use]
    pub fn history(&self) -> Vec<Incident> {
        self.history.lock().clone()
    }

    /// Audit log
    #[inline]
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Change applier
    #[inline]
    #[must_use]
    pub fn applier(&self) -> &ChangeApplier {
        &self.applier
    }

    /// Event monitor
    #[inline]
    #[must_use]
    pub fn monitor(&self) -> &EventMonitor {
        &self.monitor
    }

    /// Whether the loop has halted on an unreachable target
    #[inline]
    #[must_use]
    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::Relaxed)
    }

    /// Incident totals and rates
    pub async fn metrics(&self) -> LoopMetrics {
        let active = self.snapshot_active().await;
        let mut metrics = LoopMetrics::from_incidents(
            &active,
            &self.history.lock(),
            self.fix_attempts.load(Ordering::Relaxed),
        );
        metrics.emergency = self.is_emergency();
        metrics
    }

    /// Full status
    pub async fn status(&self) -> LoopStatus {
        let active = self.snapshot_active().await;
        let mut phases = BTreeMap::new();
        for incident in &active {
            *phases.entry(incident.phase).or_insert(0) += 1;
        }
        let mut metrics = LoopMetrics::from_incidents(
            &active,
            &self.history.lock(),
            self.fix_attempts.load(Ordering::Relaxed),
        );
        metrics.emergency = self.is_emergency();
        LoopStatus {
            metrics,
            phases,
            monitor: self.monitor.stats(),
            applier: self.applier.statistics(),
            audit_entries: self.audit.len(),
        }
    }

    // ---- tick internals ----

    fn slots(&self) -> Vec<Slot> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    fn slot(&self, id: &IncidentId) -> Result<Slot, OrchestratorError> {
        self.active
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(OrchestratorError::IncidentNotFound(*id))
    }

    async fn health_check_if_due(&self) -> Result<(), OrchestratorError> {
        let now = self.clock.now();
        let interval = self.config.monitoring.health_check_interval();
        {
            let mut last = self.last_health_check.lock();
            if last.is_some_and(|at| now - at < interval) {
                return Ok(());
            }
            *last = Some(now);
        }

        let check = with_deadline(
            "health_check",
            self.config.monitoring.operation_timeout(),
            self.target.health_check(),
        )
        .await;
        match check {
            Ok(()) => {
                self.health_failures.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                let failures = self.health_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!("health check {} failed: {}", failures, e);
                self.audit.record(
                    AuditAction::HealthCheckFailed,
                    "target",
                    json!({ "failures": failures, "error": e.to_string() }),
                    now,
                )?;
                if failures >= self.config.monitoring.emergency_after_failures {
                    return Err(self.enter_emergency(failures).await);
                }
                Ok(())
            }
        }
    }

    async fn enter_emergency(&self, failures: u32) -> OrchestratorError {
        let now = self.clock.now();
        if let Err(e) = self.audit.record(
            AuditAction::Emergency,
            "target",
            json!({ "failures": failures }),
            now,
        ) {
            tracing::error!("cannot audit emergency: {}", e);
        }
        self.emergency.store(true, Ordering::Relaxed);
        tracing::error!("target unreachable after {} health checks; halting", failures);
        self.notifier
            .notify(
                &format!(
                    "EMERGENCY: target system unreachable after {failures} consecutive health checks; \
                     incident processing halted, state preserved"
                ),
                NotificationLevel::Emergency,
            )
            .await;
        if let Err(e) = self.persist().await {
            tracing::error!("cannot persist state in emergency: {}", e);
        }
        OrchestratorError::Emergency { failures }
    }

    async fn ingest(&self, event: &Event) -> Result<Ingested, OrchestratorError> {
        let now = self.clock.now();
        if event.outcome == EventOutcome::SystemAnomaly {
            let label = event.anomaly.as_ref().map_or("unknown", |a| a.label());
            self.audit.record(
                AuditAction::Anomaly,
                event.target_id.to_string(),
                json!({ "anomaly": event.anomaly, "at": event.timestamp }),
                now,
            )?;
            telemetry::anomaly(label);
            self.notifier
                .notify(
                    &format!("Anomaly on {}: {}", event.target_id, label),
                    NotificationLevel::Warning,
                )
                .await;
            return Ok(Ingested::Anomaly);
        }
        if !event.is_failure() {
            return Ok(Ingested::Ignored);
        }

        let existing = self.by_target.get(&event.target_id).map(|e| *e.value());
        if let Some(id) = existing {
            if let Some(slot) = self.active.get(&id).map(|e| e.value().clone()) {
                let mut incident = slot.lock().await;
                incident.observe(event);
                tracing::debug!(incident = %incident.id, target = %incident.target_id, "failure folded into incident");
                return Ok(Ingested::Updated);
            }
        }

        let incident = Incident::open(event, now);
        self.audit.record(
            AuditAction::IncidentOpened,
            incident.id.to_string(),
            json!({
                "target": incident.target_id,
                "execution": incident.execution_id,
                "severity": incident.severity,
                "description": incident.description,
            }),
            now,
        )?;
        tracing::info!(
            incident = %incident.id,
            target = %incident.target_id,
            "incident opened ({}): {}",
            incident.severity,
            incident.description
        );
        telemetry::incident_opened();
        if incident.severity.notifies_on_open() {
            self.notifier
                .notify(
                    &format!(
                        "{} incident on {}: {}",
                        incident.severity, incident.target_id, incident.description
                    ),
                    incident.severity.into(),
                )
                .await;
        }
        self.by_target.insert(incident.target_id.clone(), incident.id);
        self.active.insert(incident.id, Arc::new(Mutex::new(incident)));
        Ok(Ingested::Opened)
    }

    async fn process(&self, id: IncidentId) -> Option<Phase> {
        let slot = self.active.get(&id).map(|e| e.value().clone())?;
        let Ok(mut incident) = slot.try_lock() else {
            tracing::debug!(incident = %id, "incident busy, skipped this tick");
            return None;
        };
        if let Err(e) = self.advance(&mut incident).await {
            tracing::warn!(incident = %id, "cannot advance incident: {}", e);
        }
        Some(incident.phase)
    }

    async fn advance(&self, incident: &mut Incident) -> Result<(), OrchestratorError> {
        let now = self.clock.now();
        match incident.phase {
            Phase::Monitoring | Phase::Analyzing => {
                if incident.ready_for_analysis(now, self.config.safety.cooldown()) {
                    self.analyze(incident).await?;
                }
            }
            Phase::PendingApproval => self.expire_approval(incident, now)?,
            Phase::Testing => self.check_verification(incident).await?,
            Phase::Fixing | Phase::Resolved | Phase::Escalated => {}
        }
        if incident.phase == Phase::Fixing {
            self.fix(incident).await?;
        }
        Ok(())
    }

    async fn analyze(&self, incident: &mut Incident) -> Result<(), OrchestratorError> {
        if incident.phase == Phase::Monitoring {
            self.transition(incident, Phase::Analyzing, "failure observed")?;
        }
        incident.pending_trigger = false;
        incident.last_analysis = Some(self.clock.now());

        let analysis = self.classifier.classify(&incident.error_context()).await;
        incident.category = analysis.category;
        incident.confidence = Some(analysis.confidence);
        self.record(
            AuditAction::Analysis,
            incident,
            json!({
                "category": analysis.category,
                "confidence": analysis.confidence,
                "root_cause": analysis.root_cause,
                "auto_apply": analysis.auto_apply,
                "strategies": analysis.strategies.iter().map(|s| s.kind).collect::<Vec<_>>(),
            }),
        )?;

        let safety = &self.config.safety;
        let confidence = analysis.confidence;
        let Some(primary) = analysis.primary().cloned() else {
            return self.park_low_confidence(incident, &analysis);
        };

        if confidence >= safety.auto_apply_threshold
            && analysis.auto_apply
            && primary.risk <= safety.max_auto_risk
        {
            incident.strategy = Some(primary);
            self.transition(incident, Phase::Fixing, "confidence above auto-apply threshold")?;
        } else if confidence >= safety.approval_threshold {
            let reason = if primary.risk > safety.max_auto_risk {
                format!("{} risk exceeds automatic limit", primary.risk)
            } else {
                format!("confidence {confidence:.3} below auto-apply threshold")
            };
            self.record(
                AuditAction::ApprovalRequested,
                incident,
                json!({ "strategy": primary.kind, "confidence": confidence, "reason": reason }),
            )?;
            self.transition(incident, Phase::PendingApproval, &reason)?;
            self.notifier
                .notify(
                    &format!(
                        "Approval needed for incident {} on {}: {} ({}, {}). Root cause: {}",
                        incident.id,
                        incident.target_id,
                        primary.kind,
                        primary.description,
                        reason,
                        analysis.root_cause
                    ),
                    NotificationLevel::Warning,
                )
                .await;
            incident.approval = Some(ApprovalRequest {
                strategy: primary,
                confidence,
                reason,
                requested_at: self.clock.now(),
            });
        } else {
            self.park_low_confidence(incident, &analysis)?;
        }
        Ok(())
    }

    fn park_low_confidence(
        &self,
        incident: &mut Incident,
        analysis: &Analysis,
    ) -> Result<(), OrchestratorError> {
        self.record(
            AuditAction::LowConfidence,
            incident,
            json!({ "category": analysis.category, "confidence": analysis.confidence }),
        )?;
        tracing::warn!(
            incident = %incident.id,
            target = %incident.target_id,
            "confidence {:.3} below approval threshold, waiting for next failure",
            analysis.confidence
        );
        Ok(())
    }

    fn expire_approval(&self, incident: &mut Incident, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let expired = incident
            .approval
            .as_ref()
            .map_or(true, |r| now - r.requested_at >= self.config.safety.approval_timeout());
        if expired {
            self.record(AuditAction::ApprovalExpired, incident, json!({}))?;
            self.park_from_approval(incident, "approval timed out")?;
        }
        Ok(())
    }

    fn park_from_approval(&self, incident: &mut Incident, reason: &str) -> Result<(), OrchestratorError> {
        self.transition(incident, Phase::Analyzing, reason)?;
        incident.approval = None;
        incident.pending_trigger = false;
        Ok(())
    }

    async fn fix(&self, incident: &mut Incident) -> Result<(), OrchestratorError> {
        let Some(strategy) = incident.strategy.clone() else {
            return self.failed_attempt(incident, "no strategy selected").await;
        };
        let now = self.clock.now();
        self.record(
            AuditAction::FixStarted,
            incident,
            json!({
                "strategy": strategy.kind,
                "attempt": incident.attempts + 1,
                "parameters": strategy.parameters,
            }),
        )?;
        incident.attempts += 1;
        incident.last_attempt = Some(now);
        self.fix_attempts.fetch_add(1, Ordering::Relaxed);
        telemetry::fix_attempted(strategy.kind);

        let result = self.applier.apply(&incident.target_id, &strategy).await;
        self.record(
            AuditAction::FixApplied,
            incident,
            json!({
                "fix": result.fix_id,
                "success": result.success,
                "changes": result.changes.len(),
                "backup": result.backup_id,
                "error": result.error,
            }),
        )?;
        incident.last_fix = Some(result.fix_id);
        self.monitor.invalidate(&incident.target_id).await;

        if !result.success {
            self.classifier.record_outcome(strategy.kind, false);
            let reason = result.error.unwrap_or_else(|| "fix not applied".into());
            return self.failed_attempt(incident, &reason).await;
        }
        self.transition(incident, Phase::Testing, "fix applied")?;
        self.start_verification(incident, result.fix_id).await
    }

    async fn start_verification(&self, incident: &mut Incident, fix_id: FixId) -> Result<(), OrchestratorError> {
        let now = self.clock.now();
        self.record(AuditAction::VerificationStarted, incident, json!({ "fix": fix_id }))?;
        let started = with_deadline(
            "execute_target",
            self.config.monitoring.operation_timeout(),
            self.target.execute_target(&incident.target_id, &self.config.verification.input),
        )
        .await;
        match started {
            Ok(execution_id) => {
                incident.verification = Some(Verification {
                    execution_id,
                    fix_id,
                    started_at: now,
                });
                self.check_verification(incident).await
            }
            Err(e) => {
                self.verification_failed(incident, &format!("verification run not started: {e}"))
                    .await
            }
        }
    }

    async fn check_verification(&self, incident: &mut Incident) -> Result<(), OrchestratorError> {
        let Some(verification) = incident.verification.clone() else {
            return self.verification_failed(incident, "no verification run").await;
        };
        let now = self.clock.now();
        let timeout = self.config.verification.timeout();
        let status = with_deadline(
            "execution_status",
            self.config.monitoring.operation_timeout(),
            self.target.execution_status(&verification.execution_id),
        )
        .await;
        match status {
            Ok(info) if info.status == ExecutionStatus::Success => self.resolve(incident).await,
            Ok(info) if info.status.is_finished() => {
                let reason = format!("verification run ended {:?}", info.status).to_lowercase();
                self.verification_failed(incident, &reason).await
            }
            Err(e) if !e.is_retryable() => {
                self.verification_failed(incident, &format!("verification status: {e}"))
                    .await
            }
            _ if now - verification.started_at >= timeout => {
                self.verification_failed(incident, "verification timed out").await
            }
            _ => Ok(()),
        }
    }

    async fn resolve(&self, incident: &mut Incident) -> Result<(), OrchestratorError> {
        let now = self.clock.now();
        self.record(
            AuditAction::Resolved,
            incident,
            json!({ "attempts": incident.attempts, "fix": incident.last_fix }),
        )?;
        self.transition(incident, Phase::Resolved, "verification passed")?;
        incident.resolved = true;
        incident.resolved_at = Some(now);
        incident.verification = None;
        if let Some(strategy) = &incident.strategy {
            self.classifier.record_outcome(strategy.kind, true);
        }
        telemetry::incident_resolved();
        tracing::info!(
            incident = %incident.id,
            target = %incident.target_id,
            "incident resolved after {} attempts",
            incident.attempts
        );
        self.notifier
            .notify(
                &format!(
                    "Incident {} on {} resolved after {} attempt(s)",
                    incident.id, incident.target_id, incident.attempts
                ),
                NotificationLevel::Info,
            )
            .await;
        Ok(())
    }

    async fn verification_failed(&self, incident: &mut Incident, reason: &str) -> Result<(), OrchestratorError> {
        incident.verification = None;
        if self.config.safety.rollback_on_failure {
            if let Some(fix_id) = incident.last_fix {
                self.record(AuditAction::RolledBack, incident, json!({ "fix": fix_id, "reason": reason }))?;
                if let Err(e) = self.applier.rollback(&fix_id).await {
                    self.record(
                        AuditAction::RollbackFailed,
                        incident,
                        json!({ "fix": fix_id, "reason": reason, "error": e.to_string() }),
                    )?;
                    tracing::warn!(incident = %incident.id, "rollback of {} failed: {}", fix_id, e);
                    self.record_strategy_failure(incident);
                    // the change is still live; stop automatic remediation
                    let reason = format!("{reason}; rollback of fix {fix_id} failed: {e}");
                    return self.escalate_incident(incident, &reason).await;
                }
                self.monitor.invalidate(&incident.target_id).await;
            }
        }
        self.record_strategy_failure(incident);
        self.failed_attempt(incident, reason).await
    }

    fn record_strategy_failure(&self, incident: &Incident) {
        if let Some(strategy) = &incident.strategy {
            self.classifier.record_outcome(strategy.kind, false);
        }
    }

    async fn failed_attempt(&self, incident: &mut Incident, reason: &str) -> Result<(), OrchestratorError> {
        if incident.attempts >= self.config.safety.max_attempts {
            return self.escalate_incident(incident, reason).await;
        }
        self.transition(incident, Phase::Monitoring, &format!("attempt failed: {reason}"))?;
        incident.strategy = None;
        incident.pending_trigger = true;
        Ok(())
    }

    async fn escalate_incident(&self, incident: &mut Incident, reason: &str) -> Result<(), OrchestratorError> {
        if incident.escalated || incident.is_terminal() {
            return Ok(());
        }
        let now = self.clock.now();
        self.record(
            AuditAction::Escalated,
            incident,
            json!({
                "reason": reason,
                "attempts": incident.attempts,
                "category": incident.category,
                "last_fix": incident.last_fix,
            }),
        )?;
        self.transition(incident, Phase::Escalated, reason)?;
        incident.escalated = true;
        incident.escalated_at = Some(now);
        incident.approval = None;
        incident.verification = None;
        telemetry::incident_escalated();
        tracing::warn!(
            incident = %incident.id,
            target = %incident.target_id,
            "incident escalated after {} attempts: {}",
            incident.attempts,
            reason
        );
        self.notifier
            .notify(&escalation_message(incident, reason), NotificationLevel::Critical)
            .await;
        Ok(())
    }

    fn transition(&self, incident: &mut Incident, to: Phase, reason: &str) -> Result<(), OrchestratorError> {
        let from = incident.phase;
        validate_transition(from, to)?;
        self.record(
            AuditAction::Transition,
            incident,
            json!({ "from": from, "to": to, "reason": reason, "attempts": incident.attempts }),
        )?;
        incident.transition(to)?;
        tracing::info!(
            incident = %incident.id,
            target = %incident.target_id,
            "{} -> {} ({})",
            from,
            to,
            reason
        );
        Ok(())
    }

    fn record(&self, action: AuditAction, incident: &Incident, mut details: Value) -> Result<(), OrchestratorError> {
        if let Value::Object(map) = &mut details {
            map.insert("target".into(), json!(incident.target_id));
        }
        self.audit
            .record(action, incident.id.to_string(), details, self.clock.now())?;
        Ok(())
    }

    async fn retire(&self) -> (usize, usize) {
        let mut resolved = 0;
        let mut escalated = 0;
        for (id, slot) in self
            .active
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect::<Vec<_>>()
        {
            let Ok(incident) = slot.try_lock() else {
                continue;
            };
            if !incident.is_terminal() {
                continue;
            }
            if incident.resolved {
                resolved += 1;
            } else {
                escalated += 1;
            }
            let finished = incident.clone();
            drop(incident);
            self.active.remove(&id);
            self.by_target.remove_if(&finished.target_id, |_, v| *v == id);
            self.history.lock().push(finished);
        }
        (resolved, escalated)
    }

    fn prune_if_due(&self) -> Result<(), OrchestratorError> {
        let now = self.clock.now();
        let interval = self.config.repair.prune_interval();
        {
            let mut last = self.last_prune.lock();
            if last.is_some_and(|at| now - at < interval) {
                return Ok(());
            }
            *last = Some(now);
        }
        let pruned = self.applier.prune_backups();
        if pruned > 0 {
            self.audit.record(
                AuditAction::BackupsPruned,
                "backups",
                json!({ "pruned": pruned }),
                now,
            )?;
        }
        Ok(())
    }
}

fn expect_phase(incident: &Incident, expected: Phase) -> Result<(), OrchestratorError> {
    if incident.phase == expected {
        Ok(())
    } else {
        Err(OrchestratorError::WrongPhase {
            id: incident.id,
            phase: incident.phase,
            expected,
        })
    }
}

enum Ingested {
    Anomaly,
    Opened,
    Updated,
    Ignored,
}

fn escalation_message(incident: &Incident, reason: &str) -> String {
    let step = incident
        .step
        .as_ref()
        .map_or_else(|| "unknown step".to_string(), |s| s.name.clone());
    format!(
        "ESCALATED incident {id} on {target}\n\
         severity: {severity}\n\
         category: {category} (confidence {confidence})\n\
         step: {step}\n\
         error: {description}\n\
         attempts: {attempts}\n\
         last fix: {fix}\n\
         reason: {reason}\n\
         opened: {opened}",
        id = incident.id,
        target = incident.target_id,
        severity = incident.severity,
        category = incident.category,
        confidence = incident
            .confidence
            .map_or_else(|| "n/a".to_string(), |c| format!("{c:.3}")),
        description = incident.description,
        attempts = incident.attempts,
        fix = incident
            .last_fix
            .map_or_else(|| "none".to_string(), |f| f.to_string()),
        opened = incident.created_at.to_rfc3339(),
    )
}
