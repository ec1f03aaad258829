//! Content digests for target state snapshots
//!
//! A [`StateDigest`] is the Blake3 hash of a value's canonical JSON encoding.
//! Backups carry one so a restore can be checked byte-for-byte against the
//! captured snapshot.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A 32-byte Blake3 digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateDigest([u8; 32]);

impl StateDigest {
    /// Wrap raw digest bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash arbitrary bytes
    #[inline]
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self::new(*blake3::hash(data).as_bytes())
    }

    /// Hash the JSON encoding of a serializable value
    ///
    /// `serde_json` objects are key-sorted, so equal values always produce
    /// equal digests.
    ///
    /// # Errors
    /// Returns error if serialization fails
    #[inline]
    pub fn of<T: serde::Serialize>(value: &T) -> Result<Self, DigestError> {
        let json = serde_json::to_vec(value)?;
        Ok(Self::compute(&json))
    }

    /// First 16 hex characters, for logs
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for StateDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for StateDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DigestError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

impl serde::Serialize for StateDigest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for StateDigest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Digest errors
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// Wrong number of bytes
    #[error("invalid digest length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected byte count
        expected: usize,
        /// Actual byte count
        actual: usize,
    },

    /// Malformed hex
    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Value could not be encoded
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_for_equal_values() {
        let a = serde_json::json!({"b": 1, "a": [1, 2]});
        let b = serde_json::json!({"a": [1, 2], "b": 1});
        assert_eq!(StateDigest::of(&a).unwrap(), StateDigest::of(&b).unwrap());
    }

    #[test]
    fn hex_round_trip() {
        let d = StateDigest::compute(b"workflow");
        let parsed: StateDigest = d.to_string().parse().unwrap();
        assert_eq!(parsed, d);
        assert_eq!(d.short().len(), 16);
    }

    #[test]
    fn rejects_short_input() {
        let err = "abcd".parse::<StateDigest>().unwrap_err();
        assert!(matches!(err, DigestError::InvalidLength { actual: 2, .. }));
    }
}
