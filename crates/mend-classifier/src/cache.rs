//! Bounded analysis cache using moka
//!
//! Identical failures (same target, error type, text and step) reuse the
//! previous [`Analysis`] until it expires. Owned by the classifier instance.

use crate::classifier::{Analysis, ErrorContext};
use moka::future::Cache;
use std::time::Duration;

/// Blake3 key over the fields that determine an analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnalysisKey([u8; 32]);

impl AnalysisKey {
    /// Derive the key for an error context
    #[must_use]
    pub fn of(ctx: &ErrorContext) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in [
            Some(ctx.target_id.as_str()),
            ctx.error_type.as_deref(),
            Some(ctx.error_text.as_str()),
            ctx.step_name.as_deref(),
            ctx.step_type.as_deref(),
        ] {
            hasher.update(part.unwrap_or("").as_bytes());
            hasher.update(&[0]);
        }
        Self(*hasher.finalize().as_bytes())
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of entries in cache
    pub entry_count: u64,
}

/// TTL-bounded cache of analyses
#[derive(Debug, Clone)]
pub struct AnalysisCache {
    inner: Cache<AnalysisKey, Analysis>,
}

impl AnalysisCache {
    /// Create cache with capacity and time-to-live
    #[inline]
    #[must_use]
    pub fn with_ttl(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Cached analysis
    #[inline]
    pub async fn get(&self, key: &AnalysisKey) -> Option<Analysis> {
        self.inner.get(key).await
    }

    /// Store an analysis
    #[inline]
    pub async fn insert(&self, key: AnalysisKey, analysis: Analysis) {
        self.inner.insert(key, analysis).await;
    }

    /// Drop every entry
    #[inline]
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Cache statistics
    #[inline]
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.inner.entry_count(),
        }
    }
}

impl Default for AnalysisCache {
    /// 1,000 entries for one hour
    fn default() -> Self {
        Self::with_ttl(1_000, Duration::from_secs(3_600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_model::TargetId;

    fn ctx(text: &str) -> ErrorContext {
        ErrorContext::new(TargetId::from("wf"), text)
    }

    #[test]
    fn key_depends_on_every_field() {
        let base = AnalysisKey::of(&ctx("boom"));
        assert_eq!(base, AnalysisKey::of(&ctx("boom")));
        assert_ne!(base, AnalysisKey::of(&ctx("boom!")));
        assert_ne!(base, AnalysisKey::of(&ctx("boom").with_error_type("TypeError")));
        assert_ne!(base, AnalysisKey::of(&ctx("boom").with_step("Code", None)));
    }
}
