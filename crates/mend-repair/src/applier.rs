//! Backup-guarded change application
//!
//! [`ChangeApplier::apply`] is atomic from the caller's perspective:
//! 1. read the current workflow
//! 2. snapshot it into a [`Backup`]
//! 3. compute the transform on a copy
//! 4. write the copy back
//!
//! Nothing is written before the snapshot exists. If no step qualifies the
//! snapshot is discarded and the target is untouched; if the write fails the
//! snapshot stays referenced by the failed [`FixResult`] for inspection.

use crate::backup::{Backup, BackupStore};
use crate::error::RepairError;
use crate::strategy::{RepairStrategy, StrategyKind};
use crate::transform::{self, Change};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mend_model::{with_deadline, BackupId, Clock, FixId, TargetId, TargetSystem};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of an applied fix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    /// Written to the target
    Applied,
    /// Not written
    Failed,
    /// Reverted to the snapshot
    RolledBack,
}

/// Outcome of applying one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixResult {
    /// Fix id
    pub fix_id: FixId,
    /// Workflow changed
    pub target_id: TargetId,
    /// Strategy applied
    pub strategy: StrategyKind,
    /// Whether the write went through
    pub success: bool,
    /// Current status
    pub status: FixStatus,
    /// Concrete changes written
    pub changes: Vec<Change>,
    /// Snapshot taken before the write
    pub backup_id: Option<BackupId>,
    /// Failure reason
    pub error: Option<String>,
    /// When the attempt ran
    pub applied_at: DateTime<Utc>,
}

/// Applier settings
#[derive(Debug, Clone)]
pub struct ApplierConfig {
    /// Deadline for each target call
    pub operation_timeout: Duration,
    /// How long snapshots are kept
    pub backup_retention: chrono::Duration,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            backup_retention: chrono::Duration::days(7),
        }
    }
}

impl ApplierConfig {
    /// Set target call deadline
    #[inline]
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set snapshot retention
    #[inline]
    #[must_use]
    pub fn with_backup_retention(mut self, retention: chrono::Duration) -> Self {
        self.backup_retention = retention;
        self
    }
}

/// Applier statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplierStats {
    /// Fixes attempted
    pub total: usize,
    /// Fixes currently applied
    pub applied: usize,
    /// Fixes that were not written
    pub failed: usize,
    /// Fixes reverted
    pub rolled_back: usize,
    /// Snapshots retained
    pub backups: usize,
}

/// Applies repair strategies to a target system
pub struct ChangeApplier {
    target: Arc<dyn TargetSystem>,
    clock: Arc<dyn Clock>,
    backups: BackupStore,
    fixes: DashMap<FixId, FixResult>,
    config: ApplierConfig,
}

impl std::fmt::Debug for ChangeApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeApplier")
            .field("fixes", &self.fixes.len())
            .field("backups", &self.backups.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChangeApplier {
    /// Create applier
    #[must_use]
    pub fn new(target: Arc<dyn TargetSystem>, clock: Arc<dyn Clock>, config: ApplierConfig) -> Self {
        Self {
            target,
            clock,
            backups: BackupStore::new(),
            fixes: DashMap::new(),
            config,
        }
    }

    /// Apply a strategy to a workflow
    ///
    /// Always returns a [`FixResult`]; failures are reported through
    /// `success`, `status` and `error` and are recorded like successes.
    pub async fn apply(&self, target_id: &TargetId, strategy: &RepairStrategy) -> FixResult {
        let mut result = FixResult {
            fix_id: FixId::new(),
            target_id: target_id.clone(),
            strategy: strategy.kind,
            success: false,
            status: FixStatus::Failed,
            changes: Vec::new(),
            backup_id: None,
            error: None,
            applied_at: self.clock.now(),
        };

        match self.write_fix(target_id, strategy, &mut result).await {
            Ok(()) => {
                result.success = true;
                result.status = FixStatus::Applied;
                tracing::info!(
                    "applied {} to {}: {} change(s), fix {}",
                    strategy.kind,
                    target_id,
                    result.changes.len(),
                    result.fix_id
                );
            }
            Err(e) => {
                tracing::warn!("{} on {} failed: {}", strategy.kind, target_id, e);
                result.error = Some(e.to_string());
            }
        }

        self.fixes.insert(result.fix_id, result.clone());
        result
    }

    async fn write_fix(
        &self,
        target_id: &TargetId,
        strategy: &RepairStrategy,
        result: &mut FixResult,
    ) -> Result<(), RepairError> {
        let limit = self.config.operation_timeout;
        let state = with_deadline("get_target_state", limit, self.target.get_target_state(target_id)).await?;

        let backup = self.backups.capture(
            target_id,
            &state,
            format!("before {}", strategy.kind),
            self.clock.now(),
        )?;

        let (next, changes) = match transform::plan(&state, strategy) {
            Ok(planned) => planned,
            Err(e) => {
                self.backups.discard(&backup.id);
                return Err(e);
            }
        };

        result.backup_id = Some(backup.id);
        with_deadline(
            "update_target_state",
            limit,
            self.target.update_target_state(target_id, &next),
        )
        .await?;
        result.changes = changes;
        Ok(())
    }

    /// Restore the snapshot taken before a fix
    ///
    /// Rolling back an already rolled-back fix is a no-op.
    ///
    /// # Errors
    /// - [`RepairError::FixNotFound`] for an unknown fix
    /// - [`RepairError::NoBackup`] if the fix never captured a snapshot
    /// - [`RepairError::BackupMissing`] if retention pruned the snapshot
    /// - [`RepairError::Target`] if the restore write fails
    pub async fn rollback(&self, fix_id: &FixId) -> Result<(), RepairError> {
        let fix = self.fix(fix_id).ok_or(RepairError::FixNotFound(*fix_id))?;
        if fix.status == FixStatus::RolledBack {
            tracing::debug!("fix {} already rolled back", fix_id);
            return Ok(());
        }

        let backup_id = fix.backup_id.ok_or(RepairError::NoBackup(*fix_id))?;
        let backup: Backup = self
            .backups
            .get(&backup_id)
            .ok_or(RepairError::BackupMissing {
                fix: *fix_id,
                backup: backup_id,
            })?;

        with_deadline(
            "update_target_state",
            self.config.operation_timeout,
            self.target.update_target_state(&fix.target_id, &backup.state),
        )
        .await?;

        if let Some(mut entry) = self.fixes.get_mut(fix_id) {
            entry.status = FixStatus::RolledBack;
        }
        tracing::info!("rolled back fix {} on {}", fix_id, fix.target_id);
        Ok(())
    }

    /// Drop snapshots older than the retention window
    ///
    /// Fix records older than the window go with them unless their
    /// snapshot is still held.
    pub fn prune_backups(&self) -> usize {
        let cutoff = self.clock.now() - self.config.backup_retention;
        let removed = self.backups.prune_before(cutoff);
        let fixes = self.fixes.len();
        self.fixes.retain(|_, fix| {
            fix.applied_at >= cutoff || fix.backup_id.is_some_and(|b| self.backups.contains(&b))
        });
        let dropped = fixes - self.fixes.len();
        if removed > 0 || dropped > 0 {
            tracing::info!("pruned {} expired backup(s) and {} fix record(s)", removed, dropped);
        }
        removed
    }

    /// Look up a fix
    #[inline]
    #[must_use]
    pub fn fix(&self, fix_id: &FixId) -> Option<FixResult> {
        self.fixes.get(fix_id).map(|f| f.clone())
    }

    /// Most recent fixes, newest first
    #[must_use]
    pub fn history(&self, limit: usize) -> Vec<FixResult> {
        let mut all = self.fixes_snapshot();
        all.reverse();
        all.truncate(limit);
        all
    }

    /// Applier statistics
    #[must_use]
    pub fn statistics(&self) -> ApplierStats {
        let mut stats = ApplierStats {
            backups: self.backups.len(),
            ..ApplierStats::default()
        };
        for fix in &self.fixes {
            stats.total += 1;
            match fix.status {
                FixStatus::Applied => stats.applied += 1,
                FixStatus::Failed => stats.failed += 1,
                FixStatus::RolledBack => stats.rolled_back += 1,
            }
        }
        stats
    }

    /// Snapshot store
    #[inline]
    #[must_use]
    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// All fixes, oldest first
    #[must_use]
    pub fn fixes_snapshot(&self) -> Vec<FixResult> {
        let mut all: Vec<FixResult> = self.fixes.iter().map(|f| f.value().clone()).collect();
        all.sort_by_key(|f| (f.applied_at, f.fix_id));
        all
    }

    /// Load fixes, e.g. after a restart
    pub fn restore_fixes(&self, fixes: impl IntoIterator<Item = FixResult>) {
        for fix in fixes {
            self.fixes.insert(fix.fix_id, fix);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::RiskTier;
    use mend_model::{ManualClock, MemoryTarget, Step, TargetState};
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<MemoryTarget>, Arc<ManualClock>, ChangeApplier) {
        let target = Arc::new(MemoryTarget::new());
        target.insert_target(
            "wf",
            TargetState::new("wf").with_step(
                Step::new("m", "Memory", "@n8n/n8n-nodes-langchain.memoryBufferWindow"),
            ),
        );
        let clock = Arc::new(ManualClock::default());
        let applier = ChangeApplier::new(target.clone(), clock.clone(), ApplierConfig::default());
        (target, clock, applier)
    }

    fn session_fix() -> RepairStrategy {
        RepairStrategy::new(StrategyKind::AddParameter, "session", 0.9, RiskTier::Low)
            .with_param("parameter", "sessionIdExpression")
            .with_param("value", "={{ $workflow.executionId }}")
            .with_param("step_pattern", "memory")
    }

    #[tokio::test]
    async fn apply_then_rollback_restores_snapshot() {
        let (target, _, applier) = setup();
        let wf = TargetId::from("wf");
        let original = target.state(&wf).unwrap();

        let fix = applier.apply(&wf, &session_fix()).await;
        assert!(fix.success);
        assert_eq!(fix.status, FixStatus::Applied);
        assert_ne!(target.state(&wf).unwrap(), original);

        applier.rollback(&fix.fix_id).await.unwrap();
        assert_eq!(
            serde_json::to_vec(&target.state(&wf).unwrap()).unwrap(),
            serde_json::to_vec(&original).unwrap()
        );
        assert_eq!(applier.fix(&fix.fix_id).unwrap().status, FixStatus::RolledBack);

        applier.rollback(&fix.fix_id).await.unwrap();
        assert_eq!(target.update_count(&wf), 2);
    }

    #[tokio::test]
    async fn nothing_to_change_leaves_target_untouched() {
        let (target, _, applier) = setup();
        let wf = TargetId::from("wf");
        let retry = RepairStrategy::new(StrategyKind::AddRetry, "retry", 0.6, RiskTier::Low);

        let fix = applier.apply(&wf, &retry).await;
        assert!(!fix.success);
        assert!(fix.backup_id.is_none());
        assert_eq!(target.update_count(&wf), 0);
        assert!(applier.backups().is_empty());
        assert!(matches!(
            applier.rollback(&fix.fix_id).await,
            Err(RepairError::NoBackup(_))
        ));
    }

    #[tokio::test]
    async fn failed_write_keeps_backup_referenced() {
        let (target, _, applier) = setup();
        let wf = TargetId::from("wf");
        target.set_fail_updates(true);

        let fix = applier.apply(&wf, &session_fix()).await;
        assert_eq!(fix.status, FixStatus::Failed);
        let backup = fix.backup_id.unwrap();
        assert!(applier.backups().contains(&backup));
        assert!(fix.error.unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn pruning_drops_expired_fix_records() {
        let (_, clock, applier) = setup();
        let wf = TargetId::from("wf");
        let retry = RepairStrategy::new(StrategyKind::AddRetry, "retry", 0.6, RiskTier::Low);
        let old = applier.apply(&wf, &session_fix()).await;
        let unchanged = applier.apply(&wf, &retry).await;
        assert!(unchanged.backup_id.is_none());

        clock.advance(chrono::Duration::days(8));
        let recent = applier.apply(&wf, &retry).await;
        assert_eq!(applier.prune_backups(), 1);

        assert!(applier.fix(&old.fix_id).is_none());
        assert!(applier.fix(&unchanged.fix_id).is_none());
        assert!(applier.fix(&recent.fix_id).is_some());
        assert_eq!(applier.statistics().total, 1);
        assert!(matches!(
            applier.rollback(&old.fix_id).await,
            Err(RepairError::FixNotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_backup_blocks_rollback() {
        let (_, _, applier) = setup();
        let wf = TargetId::from("wf");
        let fix = applier.apply(&wf, &session_fix()).await;
        let backup = fix.backup_id.unwrap();

        applier.backups().discard(&backup);
        assert!(matches!(
            applier.rollback(&fix.fix_id).await,
            Err(RepairError::BackupMissing { .. })
        ));
    }

    #[tokio::test]
    async fn statistics_and_history() {
        let (_, clock, applier) = setup();
        let wf = TargetId::from("wf");
        let first = applier.apply(&wf, &session_fix()).await;
        clock.advance(chrono::Duration::seconds(1));
        let second = applier.apply(&wf, &session_fix()).await;

        let stats = applier.statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.failed, 1);

        let history = applier.history(10);
        assert_eq!(history[0].fix_id, second.fix_id);
        assert_eq!(history[1].fix_id, first.fix_id);
    }
}
