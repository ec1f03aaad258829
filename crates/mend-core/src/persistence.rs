//! Snapshot persistence
//!
//! The loop's own state (active incidents, history, audit chain, backups,
//! fix records, monitor watermark) is written as one JSON document. Writes go
//! to a temporary file that is renamed over the old snapshot, so a crash
//! mid-write leaves the previous snapshot intact.

use crate::audit::{verify_chain, AuditEntry};
use crate::error::PersistenceError;
use crate::incident::Incident;
use chrono::{DateTime, Utc};
use mend_repair::{Backup, FixResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Current snapshot format
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to resume the loop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version
    pub version: u32,
    /// When the snapshot was taken
    pub saved_at: Option<DateTime<Utc>>,
    /// Non-terminal incidents
    pub active: Vec<Incident>,
    /// Resolved and escalated incidents
    pub history: Vec<Incident>,
    /// Audit chain
    pub audit: Vec<AuditEntry>,
    /// Retained backups
    pub backups: Vec<Backup>,
    /// Fix records
    pub fixes: Vec<FixResult>,
    /// Monitor watermark
    pub watermark: Option<DateTime<Utc>>,
    /// Whether the loop stopped in emergency
    pub emergency: bool,
}

/// Reads and writes the snapshot file
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store at `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file location
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot atomically
    ///
    /// # Errors
    /// Returns error if encoding or any filesystem step fails
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let io = |source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io)?;
        }
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(io)?;
        std::fs::rename(&tmp, &self.path).map_err(io)?;
        tracing::debug!(
            "saved snapshot to {} ({} active, {} history, {} audit)",
            self.path.display(),
            snapshot.active.len(),
            snapshot.history.len(),
            snapshot.audit.len()
        );
        Ok(())
    }

    /// Read the snapshot, `None` if none was written yet
    ///
    /// # Errors
    /// Returns error if the file is unreadable, malformed or its audit chain is broken
    pub fn load(&self) -> Result<Option<Snapshot>, PersistenceError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        verify_chain(&snapshot.audit)?;
        tracing::info!(
            "loaded snapshot from {} ({} active incidents)",
            self.path.display(),
            snapshot.active.len()
        );
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, AuditLog};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested/state.json"));
        let log = AuditLog::new();
        log.record(AuditAction::IncidentOpened, "inc", json!({ "confidence": 0.713 }), Utc::now())
            .unwrap();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Some(Utc::now()),
            audit: log.entries(),
            watermark: Some(Utc::now()),
            ..Snapshot::default()
        };
        store.save(&snapshot).unwrap();
        assert_eq!(store.load().unwrap(), Some(snapshot));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn tampered_audit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let log = AuditLog::new();
        log.record(AuditAction::Resolved, "inc", json!({}), Utc::now()).unwrap();
        let mut snapshot = Snapshot {
            audit: log.entries(),
            ..Snapshot::default()
        };
        snapshot.audit[0].resource = "other".into();
        store.save(&snapshot).unwrap();
        assert!(matches!(store.load(), Err(PersistenceError::Audit(_))));
    }
}
