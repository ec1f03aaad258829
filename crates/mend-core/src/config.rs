//! Loop configuration
//!
//! Loaded from TOML, YAML or JSON chosen by file extension. Every field has
//! a default, so an empty file is a valid configuration.
//!
//! ```toml
//! workers = 4
//!
//! [safety]
//! auto_apply_threshold = 0.8
//! approval_threshold = 0.6
//! max_attempts = 5
//! cooldown_secs = 300
//!
//! [monitoring]
//! poll_interval_secs = 30
//! ```

use crate::error::ConfigError;
use mend_classifier::{ClassifierConfig, CredentialTable};
use mend_repair::{ApplierConfig, RiskTier};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Gates on automatic mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Confidence at or above which a fix applies without approval
    pub auto_apply_threshold: f64,
    /// Confidence at or above which approval is requested
    pub approval_threshold: f64,
    /// Failed attempts before escalation
    pub max_attempts: u32,
    /// Minimum seconds between analysis passes of one incident
    pub cooldown_secs: u64,
    /// Highest risk tier applied without approval
    pub max_auto_risk: RiskTier,
    /// Seconds an approval request stays open
    pub approval_timeout_secs: u64,
    /// Restore the backup when verification fails
    pub rollback_on_failure: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            auto_apply_threshold: 0.8,
            approval_threshold: 0.6,
            max_attempts: 5,
            cooldown_secs: 300,
            max_auto_risk: RiskTier::Medium,
            approval_timeout_secs: 3_600,
            rollback_on_failure: true,
        }
    }
}

impl SafetyConfig {
    /// Cooldown as a chrono duration
    #[must_use]
    pub fn cooldown(&self) -> chrono::Duration {
        span(self.cooldown_secs)
    }

    /// Approval timeout as a chrono duration
    #[must_use]
    pub fn approval_timeout(&self) -> chrono::Duration {
        span(self.approval_timeout_secs)
    }
}

/// Polling and target-call settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Seconds between ticks
    pub poll_interval_secs: u64,
    /// Executions requested per poll
    pub poll_limit: usize,
    /// Seconds re-read behind the watermark
    pub overlap_secs: u64,
    /// Remembered execution outcomes
    pub dedupe_capacity: u64,
    /// Seconds an execution outcome is remembered
    pub dedupe_ttl_secs: u64,
    /// Cached workflow definitions
    pub state_cache_capacity: u64,
    /// Seconds a cached workflow definition stays valid
    pub state_cache_ttl_secs: u64,
    /// Seconds between health checks
    pub health_check_interval_secs: u64,
    /// Consecutive failed health checks before emergency
    pub emergency_after_failures: u32,
    /// Deadline for each target call, in seconds
    pub operation_timeout_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            poll_limit: 50,
            overlap_secs: 60,
            dedupe_capacity: 10_000,
            dedupe_ttl_secs: 86_400,
            state_cache_capacity: 256,
            state_cache_ttl_secs: 300,
            health_check_interval_secs: 60,
            emergency_after_failures: 3,
            operation_timeout_secs: 30,
        }
    }
}

impl MonitoringConfig {
    /// Tick period
    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Per-call deadline
    #[inline]
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Minimum spacing of health checks
    #[must_use]
    pub fn health_check_interval(&self) -> chrono::Duration {
        span(self.health_check_interval_secs)
    }
}

// chrono durations overflow long before u64 seconds do
const MAX_SPAN_SECS: i64 = 100 * 365 * 86_400;

fn span(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).map_or(MAX_SPAN_SECS, |s| s.min(MAX_SPAN_SECS)))
}

/// Anomaly thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Executions kept in the rolling window
    pub window_size: usize,
    /// Durations needed before slow-execution checks start
    pub min_samples: usize,
    /// Slow when duration exceeds mean times this
    pub duration_multiplier: f64,
    /// Consecutive failures of one workflow that raise an anomaly
    pub consecutive_failures: u32,
    /// Fleet failure fraction over the window that raises an anomaly
    pub error_rate: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            min_samples: 10,
            duration_multiplier: 3.0,
            consecutive_failures: 3,
            error_rate: 0.5,
        }
    }
}

/// Change applier settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Days a backup is retained
    pub backup_retention_days: i64,
    /// Seconds between backup prune sweeps
    pub prune_interval_secs: u64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            backup_retention_days: 7,
            prune_interval_secs: 3_600,
        }
    }
}

impl RepairConfig {
    /// Minimum spacing of backup pruning passes
    #[must_use]
    pub fn prune_interval(&self) -> chrono::Duration {
        span(self.prune_interval_secs)
    }
}

/// Post-fix verification run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Payload passed to the verification run
    pub input: Value,
    /// Seconds to wait for the run to finish
    pub timeout_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            input: Value::Object(serde_json::Map::new()),
            timeout_secs: 120,
        }
    }
}

impl VerificationConfig {
    /// How long a verification run may stay unfinished
    #[must_use]
    pub fn timeout(&self) -> chrono::Duration {
        span(self.timeout_secs)
    }
}

/// Snapshot location and cadence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory holding `state.json`
    pub state_dir: PathBuf,
    /// Write a snapshot after every tick, not only at shutdown
    pub snapshot_every_tick: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".mend"),
            snapshot_every_tick: false,
        }
    }
}

/// Complete loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MendConfig {
    /// Mutation gates
    pub safety: SafetyConfig,
    /// Polling
    pub monitoring: MonitoringConfig,
    /// Anomaly thresholds
    pub anomaly: AnomalyConfig,
    /// Classifier tuning
    pub classifier: ClassifierConfig,
    /// Backup retention
    pub repair: RepairConfig,
    /// Credential references per category
    pub credentials: CredentialTable,
    /// Verification run
    pub verification: VerificationConfig,
    /// Snapshots
    pub persistence: PersistenceConfig,
    /// Incidents processed concurrently
    pub workers: usize,
}

impl Default for MendConfig {
    fn default() -> Self {
        Self {
            safety: SafetyConfig::default(),
            monitoring: MonitoringConfig::default(),
            anomaly: AnomalyConfig::default(),
            classifier: ClassifierConfig::default(),
            repair: RepairConfig::default(),
            credentials: CredentialTable::default(),
            verification: VerificationConfig::default(),
            persistence: PersistenceConfig::default(),
            workers: 4,
        }
    }
}

impl MendConfig {
    /// Load and validate a configuration file
    ///
    /// # Errors
    /// Returns error if the file is unreadable, malformed or out of range
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let config = Self::parse(&text, &ext)?;
        config.validate()?;
        tracing::info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse configuration text in the format named by `ext`
    ///
    /// # Errors
    /// Returns error for malformed text or an unknown format
    pub fn parse(text: &str, ext: &str) -> Result<Self, ConfigError> {
        match ext {
            "toml" => Ok(toml::from_str(text)?),
            "yaml" | "yml" => Ok(serde_yaml::from_str(text)?),
            "json" => Ok(serde_json::from_str(text)?),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Check ranges and ordering
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] describing the first problem
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.safety;
        for (name, value) in [
            ("auto_apply_threshold", s.auto_apply_threshold),
            ("approval_threshold", s.approval_threshold),
            ("anomaly.error_rate", self.anomaly.error_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must lie in [0, 1]")));
            }
        }
        if s.approval_threshold > s.auto_apply_threshold {
            return Err(ConfigError::Invalid(
                "approval_threshold must not exceed auto_apply_threshold".into(),
            ));
        }
        if s.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be positive".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be positive".into()));
        }
        if self.monitoring.poll_limit == 0 || self.monitoring.emergency_after_failures == 0 {
            return Err(ConfigError::Invalid(
                "poll_limit and emergency_after_failures must be positive".into(),
            ));
        }
        if self.anomaly.window_size == 0 || self.anomaly.duration_multiplier <= 1.0 {
            return Err(ConfigError::Invalid(
                "anomaly window must be positive and duration_multiplier above 1".into(),
            ));
        }
        if self.repair.backup_retention_days <= 0 {
            return Err(ConfigError::Invalid("backup_retention_days must be positive".into()));
        }
        self.classifier.validate()?;
        Ok(())
    }

    /// Applier settings derived from this configuration
    #[must_use]
    pub fn applier_config(&self) -> ApplierConfig {
        ApplierConfig::default()
            .with_operation_timeout(self.monitoring.operation_timeout())
            .with_backup_retention(chrono::Duration::days(self.repair.backup_retention_days))
    }

    /// Path of the snapshot file
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.persistence.state_dir.join("state.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_model::ErrorCategory;

    #[test]
    fn bundled_demo_config_is_valid() {
        let config = MendConfig::parse(include_str!("../../../demos/mend.toml"), "toml").unwrap();
        assert!(config.validate().is_ok());
        assert!(config.persistence.snapshot_every_tick);
        assert!(!config.credentials.is_empty());
    }

    #[test]
    fn empty_toml_is_default() {
        let config = MendConfig::parse("", "toml").unwrap();
        assert_eq!(config, MendConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_sections_override_defaults() {
        let text = r#"
workers = 2

[safety]
max_attempts = 3
cooldown_secs = 10
max_auto_risk = "low"

[anomaly]
consecutive_failures = 5
"#;
        let config = MendConfig::parse(text, "toml").unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.safety.max_attempts, 3);
        assert_eq!(config.safety.max_auto_risk, RiskTier::Low);
        assert_eq!(config.anomaly.consecutive_failures, 5);
        assert!((config.safety.auto_apply_threshold - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn yaml_credentials_table() {
        let text = r"
credentials:
  authentication:
    - step_match: openrouter
      credential_type: openRouterApi
      credential_id: cred-7
";
        let config = MendConfig::parse(text, "yaml").unwrap();
        let found = config
            .credentials
            .lookup(ErrorCategory::Authentication, Some("OpenRouter Chat"), None)
            .unwrap();
        assert_eq!(found.credential_id, "cred-7");
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut config = MendConfig::default();
        config.safety.approval_threshold = 0.9;
        config.safety.auto_apply_threshold = 0.7;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_workers_are_rejected() {
        let config = MendConfig {
            workers: 0,
            ..MendConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_extension_is_rejected() {
        assert!(matches!(
            MendConfig::parse("", "ini"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn load_reads_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mend.yaml");
        std::fs::write(&path, "workers: 8\nsafety:\n  max_attempts: 2\n").unwrap();
        let config = MendConfig::load(&path).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.safety.max_attempts, 2);
    }
}
