//! Success history per strategy kind
//!
//! Bounded moving window of recorded outcomes; the ranking dampens a
//! strategy's threshold by its success rate.

use dashmap::DashMap;
use mend_repair::StrategyKind;
use std::collections::{BTreeMap, VecDeque};

/// Default number of outcomes kept per kind
pub const DEFAULT_WINDOW: usize = 100;

/// Recorded fix outcomes, bounded per strategy kind
#[derive(Debug)]
pub struct SuccessHistory {
    window: usize,
    outcomes: DashMap<StrategyKind, VecDeque<bool>>,
}

impl Default for SuccessHistory {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl SuccessHistory {
    /// Create history keeping at most `window` outcomes per kind
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            outcomes: DashMap::new(),
        }
    }

    /// Record one outcome, evicting the oldest beyond the window
    pub fn record(&self, kind: StrategyKind, success: bool) {
        let mut entry = self.outcomes.entry(kind).or_default();
        entry.push_back(success);
        while entry.len() > self.window {
            entry.pop_front();
        }
    }

    /// Fraction of recorded successes, `None` without history
    #[must_use]
    pub fn rate(&self, kind: StrategyKind) -> Option<f64> {
        let entry = self.outcomes.get(&kind)?;
        if entry.is_empty() {
            return None;
        }
        let successes = entry.iter().filter(|s| **s).count();
        #[allow(clippy::cast_precision_loss)]
        Some(successes as f64 / entry.len() as f64)
    }

    /// Number of outcomes held for a kind
    #[must_use]
    pub fn len(&self, kind: StrategyKind) -> usize {
        self.outcomes.get(&kind).map_or(0, |e| e.len())
    }

    /// Success rate of every kind with history
    #[must_use]
    pub fn rates(&self) -> BTreeMap<StrategyKind, f64> {
        StrategyKind::ALL
            .into_iter()
            .filter_map(|k| self.rate(k).map(|r| (k, r)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_bounded() {
        let history = SuccessHistory::new(100);
        for _ in 0..150 {
            history.record(StrategyKind::AddRetry, false);
        }
        for _ in 0..100 {
            history.record(StrategyKind::AddRetry, true);
        }
        assert_eq!(history.len(StrategyKind::AddRetry), 100);
        assert_eq!(history.rate(StrategyKind::AddRetry), Some(1.0));
    }

    #[test]
    fn rate_is_none_without_history() {
        let history = SuccessHistory::default();
        assert!(history.rate(StrategyKind::ReplaceStep).is_none());
        history.record(StrategyKind::ReplaceStep, true);
        history.record(StrategyKind::ReplaceStep, false);
        assert_eq!(history.rate(StrategyKind::ReplaceStep), Some(0.5));
        assert_eq!(history.rates().len(), 1);
    }
}
