//! Pre-mutation snapshots
//!
//! A [`Backup`] is captured before every write and is the only input to a
//! rollback. Backups are immutable; the store only inserts, reads and
//! prunes by age.

use crate::error::RepairError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mend_model::{BackupId, StateDigest, TargetId, TargetState};
use serde::{Deserialize, Serialize};

/// Immutable snapshot of one workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    /// Snapshot id
    pub id: BackupId,
    /// Workflow captured
    pub target_id: TargetId,
    /// Captured definition
    pub state: TargetState,
    /// Digest of `state` at capture time
    pub digest: StateDigest,
    /// Capture time
    pub captured_at: DateTime<Utc>,
    /// Why it was taken
    pub description: String,
}

impl Backup {
    /// Whether the stored state still matches its digest
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.state.digest().is_ok_and(|d| d == self.digest)
    }
}

/// Concurrent backup store
#[derive(Debug, Default)]
pub struct BackupStore {
    backups: DashMap<BackupId, Backup>,
}

impl BackupStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a workflow
    ///
    /// # Errors
    /// Returns error if the state cannot be digested
    pub fn capture(
        &self,
        target_id: &TargetId,
        state: &TargetState,
        description: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<Backup, RepairError> {
        let backup = Backup {
            id: BackupId::new(),
            target_id: target_id.clone(),
            state: state.clone(),
            digest: state.digest()?,
            captured_at: at,
            description: description.into(),
        };
        self.backups.insert(backup.id, backup.clone());
        tracing::debug!("captured backup {} of {} ({})", backup.id, target_id, backup.digest.short());
        Ok(backup)
    }

    /// Look up a snapshot
    #[inline]
    #[must_use]
    pub fn get(&self, id: &BackupId) -> Option<Backup> {
        self.backups.get(id).map(|b| b.clone())
    }

    /// Check if a snapshot is retained
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &BackupId) -> bool {
        self.backups.contains_key(id)
    }

    /// Drop a snapshot that was never used
    #[inline]
    pub(crate) fn discard(&self, id: &BackupId) {
        self.backups.remove(id);
    }

    /// Remove snapshots captured before `cutoff`, returning how many went
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.backups.len();
        self.backups.retain(|_, b| b.captured_at >= cutoff);
        before - self.backups.len()
    }

    /// Number of retained snapshots
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.backups.len()
    }

    /// Check if store is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }

    /// All snapshots, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<Backup> {
        let mut all: Vec<Backup> = self.backups.iter().map(|b| b.value().clone()).collect();
        all.sort_by_key(|b| b.id);
        all
    }

    /// Load snapshots, e.g. after a restart
    pub fn restore(&self, backups: impl IntoIterator<Item = Backup>) {
        for backup in backups {
            self.backups.insert(backup.id, backup);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mend_model::Step;

    fn state() -> TargetState {
        TargetState::new("wf").with_step(Step::new("1", "HTTP", "n8n-nodes-base.httpRequest"))
    }

    #[test]
    fn capture_records_digest() {
        let store = BackupStore::new();
        let b = store
            .capture(&TargetId::from("wf"), &state(), "before add-retry", Utc::now())
            .unwrap();
        assert!(b.is_intact());
        assert_eq!(store.get(&b.id).unwrap(), b);
    }

    #[test]
    fn prune_removes_only_expired() {
        let store = BackupStore::new();
        let now = Utc::now();
        let old = store
            .capture(&TargetId::from("wf"), &state(), "old", now - Duration::days(8))
            .unwrap();
        let fresh = store.capture(&TargetId::from("wf"), &state(), "fresh", now).unwrap();

        assert_eq!(store.prune_before(now - Duration::days(7)), 1);
        assert!(!store.contains(&old.id));
        assert!(store.contains(&fresh.id));
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let store = BackupStore::new();
        store.capture(&TargetId::from("a"), &state(), "x", Utc::now()).unwrap();
        store.capture(&TargetId::from("b"), &state(), "y", Utc::now()).unwrap();

        let copy = BackupStore::new();
        copy.restore(store.snapshot());
        assert_eq!(copy.snapshot(), store.snapshot());
    }
}
