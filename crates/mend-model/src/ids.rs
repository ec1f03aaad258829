//! Identifier newtypes
//!
//! Locally minted identifiers are ULIDs so they sort by creation time.
//! Identifiers owned by the workflow engine ([`TargetId`], [`ExecutionId`])
//! are opaque strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Generate a fresh identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s).map(Self)
            }
        }
    };
}

ulid_id!(
    /// Unique incident identifier
    IncidentId
);
ulid_id!(
    /// Unique identifier of one applied fix
    FixId
);
ulid_id!(
    /// Unique identifier of a pre-mutation snapshot
    BackupId
);
ulid_id!(
    /// Unique identifier of an observed event
    EventId
);
ulid_id!(
    /// Unique identifier of an audit entry
    AuditId
);

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wrap an engine-assigned identifier
            #[inline]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow as string slice
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a monitored workflow (the remediation target)
    TargetId
);
string_id!(
    /// Identifier of one workflow execution
    ExecutionId
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn ulid_ids_are_unique_and_parse_back() {
        let a = IncidentId::new();
        let b = IncidentId::new();
        assert_ne!(a, b);

        let parsed = IncidentId::from_str(&a.to_string()).unwrap();
        assert_eq!(parsed, a);
    }

    #[test]
    fn string_ids_serialize_transparently() {
        let id = TargetId::from("wf-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"wf-42\"");
        assert_eq!(id.as_str(), "wf-42");
    }
}
