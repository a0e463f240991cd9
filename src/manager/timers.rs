//! Deadline table for the event loop.
//!
//! Timers are plain entries; the loop sleeps until the earliest one.
//! Cancelling removes the entry and is idempotent.

// ============================================================================
// Imports
// ============================================================================

use std::hash::Hash;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

// ============================================================================
// Timers
// ============================================================================

/// Named deadlines.
#[derive(Debug)]
pub(crate) struct Timers<K> {
    deadlines: FxHashMap<K, Instant>,
}

impl<K> Default for Timers<K> {
    fn default() -> Self {
        Self {
            deadlines: FxHashMap::default(),
        }
    }
}

impl<K: Copy + Eq + Hash + Ord> Timers<K> {
    /// Arms `key` at `at`, replacing any previous deadline.
    pub(crate) fn set(&mut self, key: K, at: Instant) {
        self.deadlines.insert(key, at);
    }

    /// Disarms `key`. Returns `true` if it was armed.
    pub(crate) fn clear(&mut self, key: K) -> bool {
        self.deadlines.remove(&key).is_some()
    }

    /// Disarms every timer.
    pub(crate) fn clear_all(&mut self) {
        self.deadlines.clear();
    }

    #[inline]
    pub(crate) fn is_set(&self, key: K) -> bool {
        self.deadlines.contains_key(&key)
    }

    /// Earliest armed deadline.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Removes and returns every timer due at `now`, earliest first.
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<(Instant, K)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, at)| (*at, *key))
            .collect();
        due.sort_unstable();

        for (_, key) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(_, key)| key).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
