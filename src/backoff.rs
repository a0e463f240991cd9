//! Exponential backoff with jitter.
//!
//! Each call to [`Backoff::duration`] returns the next delay and advances
//! the attempt counter; only [`Backoff::reset`] rewinds it.
//!
//! ```text
//! delay = min(max, min_delay * factor^attempt ± floor(r * jitter * value))
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

// ============================================================================
// Constants
// ============================================================================

/// Default first delay.
const DEFAULT_MIN: Duration = Duration::from_millis(100);

/// Default delay ceiling.
const DEFAULT_MAX: Duration = Duration::from_millis(10_000);

/// Default growth factor.
const DEFAULT_FACTOR: f64 = 2.0;

// ============================================================================
// Backoff
// ============================================================================

/// Delay generator for reconnection attempts.
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    attempts: u32,
    rng: Box<dyn RngCore + Send>,
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("factor", &self.factor)
            .field("jitter", &self.jitter)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN, DEFAULT_MAX, DEFAULT_FACTOR, 0.0)
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Backoff {
    /// Creates a backoff seeded from the operating system.
    ///
    /// `jitter` is clamped to `0.0..=1.0`.
    #[must_use]
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            min,
            max,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
            attempts: 0,
            rng: Box::new(StdRng::from_os_rng()),
        }
    }

    /// Replaces the random source with a deterministic one.
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        self.with_rng(StdRng::seed_from_u64(seed))
    }

    /// Replaces the random source.
    #[must_use]
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }
}

// ============================================================================
// Delay Computation
// ============================================================================

impl Backoff {
    /// Returns the next delay and advances the attempt counter.
    pub fn duration(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        let mut ms = self.min.as_millis() as f64 * self.factor.powi(exponent);
        self.attempts = self.attempts.saturating_add(1);

        if self.jitter > 0.0 {
            let r: f64 = self.rng.random();
            let deviation = (r * self.jitter * ms).floor();
            ms = if ((r * 10.0).floor() as u64) & 1 == 0 {
                ms - deviation
            } else {
                ms + deviation
            };
        }

        let max = self.max.as_millis() as f64;
        Duration::from_millis(ms.min(max).max(0.0) as u64)
    }

    /// Rewinds the attempt counter.
    #[inline]
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Number of delays handed out since the last reset.
    #[inline]
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sets the first delay.
    #[inline]
    pub fn set_min(&mut self, min: Duration) {
        self.min = min;
    }

    /// Sets the delay ceiling.
    #[inline]
    pub fn set_max(&mut self, max: Duration) {
        self.max = max;
    }

    /// Sets the jitter factor, clamped to `0.0..=1.0`.
    #[inline]
    pub fn set_jitter(&mut self, jitter: f64) {
        self.jitter = jitter.clamp(0.0, 1.0);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_exponential_without_jitter() {
        let mut backoff = Backoff::new(ms(100), ms(10_000), 2.0, 0.0);
        let delays: Vec<_> = (0..5).map(|_| backoff.duration()).collect();
        assert_eq!(delays, vec![ms(100), ms(200), ms(400), ms(800), ms(1600)]);
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_bounded_by_max() {
        let mut backoff = Backoff::new(ms(1000), ms(5000), 2.0, 0.5).with_seed(7);
        for _ in 0..100 {
            assert!(backoff.duration() <= ms(5000));
        }
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let mut backoff = Backoff::new(ms(1000), ms(60_000), 2.0, 0.5).with_seed(42);
        for attempt in 0..5u32 {
            let base = 1000.0 * 2f64.powi(attempt as i32);
            let delay = backoff.duration().as_millis() as f64;
            assert!(delay >= base * 0.5 && delay <= base * 1.5, "{delay} outside band of {base}");
        }
    }

    #[test]
    fn test_seeded_is_deterministic() {
        let mut a = Backoff::new(ms(1000), ms(5000), 2.0, 0.5).with_seed(3);
        let mut b = Backoff::new(ms(1000), ms(5000), 2.0, 0.5).with_seed(3);
        for _ in 0..10 {
            assert_eq!(a.duration(), b.duration());
        }
    }

    #[test]
    fn test_trends_upward() {
        let mut backoff = Backoff::new(ms(100), ms(100_000), 2.0, 0.5).with_seed(11);
        let first = backoff.duration();
        for _ in 0..5 {
            backoff.duration();
        }
        assert!(backoff.duration() > first);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(ms(100), ms(10_000), 2.0, 0.0);
        backoff.duration();
        backoff.duration();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.duration(), ms(100));
    }

    #[test]
    fn test_huge_attempt_count_saturates() {
        let mut backoff = Backoff::new(ms(100), ms(10_000), 2.0, 0.0);
        for _ in 0..2000 {
            assert!(backoff.duration() <= ms(10_000));
        }
    }
}
