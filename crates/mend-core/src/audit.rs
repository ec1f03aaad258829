//! Append-only audit log
//!
//! Every incident transition is appended here before the loop acts on it.
//! Entries are hash-chained with SHA-256: each entry stores the previous
//! entry's hash and its own, so [`AuditLog::verify_integrity`] detects any
//! edited, dropped or reordered entry.

use crate::error::AuditError;
use chrono::{DateTime, Utc};
use mend_model::AuditId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Actor recorded for automatic actions
pub const SYSTEM_ACTOR: &str = "system";

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Incident opened
    IncidentOpened,
    /// Phase change
    Transition,
    /// Classification result
    Analysis,
    /// Confidence below the approval threshold
    LowConfidence,
    /// Approval requested
    ApprovalRequested,
    /// Operator approved
    Approved,
    /// Operator rejected
    Rejected,
    /// Approval request expired
    ApprovalExpired,
    /// Fix about to be applied
    FixStarted,
    /// Fix outcome
    FixApplied,
    /// Verification run started
    VerificationStarted,
    /// Fix reverted
    RolledBack,
    /// Revert of a fix failed; the change is still live
    RollbackFailed,
    /// Incident resolved
    Resolved,
    /// Incident escalated
    Escalated,
    /// Synthetic anomaly observed
    Anomaly,
    /// Health check failed
    HealthCheckFailed,
    /// Loop entered emergency
    Emergency,
    /// Backups pruned
    BackupsPruned,
}

impl AuditAction {
    /// Stable snake_case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IncidentOpened => "incident_opened",
            Self::Transition => "transition",
            Self::Analysis => "analysis",
            Self::LowConfidence => "low_confidence",
            Self::ApprovalRequested => "approval_requested",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::ApprovalExpired => "approval_expired",
            Self::FixStarted => "fix_started",
            Self::FixApplied => "fix_applied",
            Self::VerificationStarted => "verification_started",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
            Self::Anomaly => "anomaly",
            Self::HealthCheckFailed => "health_check_failed",
            Self::Emergency => "emergency",
            Self::BackupsPruned => "backups_pruned",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry id
    pub id: AuditId,
    /// Position in the chain, from zero
    pub sequence: u64,
    /// What happened
    pub action: AuditAction,
    /// Who did it
    pub actor: String,
    /// Incident, workflow or fix concerned
    pub resource: String,
    /// When
    pub timestamp: DateTime<Utc>,
    /// Structured context
    pub details: Value,
    /// Hash of the previous entry, zeros for the first
    #[serde(with = "hex_hash")]
    pub prev_hash: [u8; 32],
    /// Hash of this entry
    #[serde(with = "hex_hash")]
    pub hash: [u8; 32],
}

/// Hash-chained, append-only log safe for concurrent appends
#[derive(Debug, Default)]
pub struct AuditLog {
    inner: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    /// Create empty log
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, linking it to the chain
    ///
    /// # Errors
    /// Returns error if the details cannot be canonicalised
    pub fn append(
        &self,
        action: AuditAction,
        actor: &str,
        resource: impl Into<String>,
        details: Value,
        at: DateTime<Utc>,
    ) -> Result<AuditEntry, AuditError> {
        let mut guard = self.inner.lock();
        let (sequence, prev_hash) = guard
            .last()
            .map_or((0, [0u8; 32]), |e| (e.sequence + 1, e.hash));
        let mut entry = AuditEntry {
            id: AuditId::new(),
            sequence,
            action,
            actor: actor.to_string(),
            resource: resource.into(),
            timestamp: at,
            details,
            prev_hash,
            hash: [0u8; 32],
        };
        entry.hash = compute_hash(&entry)?;
        guard.push(entry.clone());
        Ok(entry)
    }

    /// Append a system entry
    ///
    /// # Errors
    /// Returns error if the details cannot be canonicalised
    #[inline]
    pub fn record(
        &self,
        action: AuditAction,
        resource: impl Into<String>,
        details: Value,
        at: DateTime<Utc>,
    ) -> Result<AuditEntry, AuditError> {
        self.append(action, SYSTEM_ACTOR, resource, details, at)
    }

    /// All entries, oldest first
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().clone()
    }

    /// Entries concerning one resource
    #[must_use]
    pub fn entries_for(&self, resource: &str) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.resource == resource)
            .cloned()
            .collect()
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if log is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Check every link and hash
    ///
    /// # Errors
    /// Returns [`AuditError::IntegrityViolation`] at the first bad entry
    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        verify_chain(&self.inner.lock())
    }

    /// Replace the log with a previously saved chain after verifying it
    ///
    /// # Errors
    /// Returns error if the chain does not verify; the log is left unchanged
    pub fn restore(&self, entries: Vec<AuditEntry>) -> Result<(), AuditError> {
        verify_chain(&entries)?;
        *self.inner.lock() = entries;
        Ok(())
    }
}

/// Check a chain of entries
///
/// # Errors
/// Returns [`AuditError::IntegrityViolation`] at the first bad entry
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), AuditError> {
    let mut prev = [0u8; 32];
    for (index, entry) in entries.iter().enumerate() {
        let violation = AuditError::IntegrityViolation {
            sequence: entry.sequence,
        };
        if entry.sequence != index as u64 || entry.prev_hash != prev {
            return Err(violation);
        }
        if compute_hash(entry)? != entry.hash {
            return Err(violation);
        }
        prev = entry.hash;
    }
    Ok(())
}

fn compute_hash(entry: &AuditEntry) -> Result<[u8; 32], AuditError> {
    let details =
        serde_json::to_vec(&entry.details).map_err(|e| AuditError::Encoding(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(entry.id.to_string().as_bytes());
    hasher.update(entry.sequence.to_le_bytes());
    hasher.update(entry.action.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(entry.actor.as_bytes());
    hasher.update([0]);
    hasher.update(entry.resource.as_bytes());
    hasher.update([0]);
    hasher.update(entry.timestamp.to_rfc3339().as_bytes());
    hasher.update([0]);
    hasher.update(&details);
    hasher.update(entry.prev_hash);
    Ok(hasher.finalize().into())
}

mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(hash: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(hash))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&text, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log_with(n: usize) -> AuditLog {
        let log = AuditLog::new();
        for i in 0..n {
            log.record(AuditAction::Transition, format!("inc-{i}"), json!({ "to": "analyzing" }), Utc::now())
                .unwrap();
        }
        log
    }

    #[test]
    fn chain_links_entries() {
        let log = log_with(3);
        let entries = log.entries();
        assert_eq!(entries[0].prev_hash, [0u8; 32]);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert_eq!(entries[2].sequence, 2);
        assert!(log.verify_integrity().is_ok());
    }

    #[test]
    fn tampering_is_detected() {
        let log = log_with(3);
        let mut entries = log.entries();
        entries[1].details = json!({ "to": "resolved" });
        assert_eq!(
            verify_chain(&entries),
            Err(AuditError::IntegrityViolation { sequence: 1 })
        );

        let mut entries = log.entries();
        entries.remove(1);
        assert!(verify_chain(&entries).is_err());
    }

    #[test]
    fn restore_rejects_broken_chain_and_keeps_log() {
        let log = log_with(2);
        let mut bad = log_with(2).entries();
        bad[0].actor = "mallory".into();
        assert!(log.restore(bad).is_err());
        assert_eq!(log.len(), 2);
        assert!(log.verify_integrity().is_ok());
    }

    #[test]
    fn json_round_trip_still_verifies() {
        let log = log_with(4);
        let json = serde_json::to_string(&log.entries()).unwrap();
        let back: Vec<AuditEntry> = serde_json::from_str(&json).unwrap();
        assert!(verify_chain(&back).is_ok());
        assert_eq!(back, log.entries());
    }

    #[test]
    fn concurrent_appends_keep_chain() {
        let log = std::sync::Arc::new(AuditLog::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        log.record(AuditAction::Analysis, format!("{t}-{i}"), json!(null), Utc::now())
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.len(), 100);
        assert!(log.verify_integrity().is_ok());
    }
}
