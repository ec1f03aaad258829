//! Failure categories, incident severity and notification levels

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Rejected identity (401/403, bad token)
    Authentication,
    /// Connectivity or socket-level timeout
    Network,
    /// Upstream API returned 5xx, throttled or over quota
    ExternalApi,
    /// Data mapping between steps is broken
    Mapping,
    /// Input failed validation
    Validation,
    /// Bug inside a code step
    Internal,
    /// Execution exceeded its time budget
    Timeout,
    /// Missing or wrong credential reference
    Credentials,
    /// Missing or incorrect step parameters
    Configuration,
    /// Resource exhaustion on the engine
    Resource,
    /// Nothing matched
    Unknown,
}

impl Default for ErrorCategory {
    fn default() -> Self {
        Self::Unknown
    }
}

impl ErrorCategory {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Network => "network",
            Self::ExternalApi => "external_api",
            Self::Mapping => "mapping",
            Self::Validation => "validation",
            Self::Internal => "internal",
            Self::Timeout => "timeout",
            Self::Credentials => "credentials",
            Self::Configuration => "configuration",
            Self::Resource => "resource",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incident severity, ordered from least to most urgent
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Cosmetic or self-limiting
    #[default]
    Low,
    /// Degraded but functional
    Medium,
    /// A workflow is broken
    High,
    /// Broad or data-affecting impact
    Critical,
    /// The remediation loop itself cannot operate
    Emergency,
}

impl Severity {
    /// Estimate severity from raw error text
    ///
    /// Keyword heuristic; the first matching rule wins.
    #[must_use]
    pub fn from_error_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("critical") {
            Self::Critical
        } else if lower.contains("authentication") {
            Self::High
        } else if lower.contains("timeout") || lower.contains("network") {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Whether opening an incident at this severity notifies operators immediately
    #[inline]
    #[must_use]
    pub fn notifies_on_open(self) -> bool {
        self >= Self::Critical
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

/// Urgency attached to an operator notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    /// For the record
    Info,
    /// Needs attention soon
    Warning,
    /// Needs attention now
    Critical,
    /// Automation has stopped
    Emergency,
}

impl From<Severity> for NotificationLevel {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Low => Self::Info,
            Severity::Medium | Severity::High => Self::Warning,
            Severity::Critical => Self::Critical,
            Severity::Emergency => Self::Emergency,
        }
    }
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_heuristic() {
        assert_eq!(Severity::from_error_text("Authentication failed"), Severity::High);
        assert_eq!(Severity::from_error_text("request TIMEOUT"), Severity::Medium);
        assert_eq!(Severity::from_error_text("network down"), Severity::Medium);
        assert_eq!(Severity::from_error_text("critical: disk full"), Severity::Critical);
        assert_eq!(Severity::from_error_text("odd"), Severity::Low);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Emergency > Severity::Critical);
        assert!(Severity::Critical.notifies_on_open());
        assert!(!Severity::High.notifies_on_open());
    }

    #[test]
    fn category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::ExternalApi).unwrap();
        assert_eq!(json, "\"external_api\"");
        assert_eq!(ErrorCategory::ExternalApi.to_string(), "external_api");
    }
}
