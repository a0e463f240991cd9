//! Manager configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use sio_client::ManagerOptions;
//!
//! let options = ManagerOptions::new()
//!     .with_reconnection_attempts(5)
//!     .with_reconnection_delay(Duration::from_millis(500))
//!     .with_timeout(Some(Duration::from_secs(5)));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::backoff::Backoff;
use crate::engine::EngineOptions;
use crate::error::{Error, Result};
use crate::socket::SocketOptions;

// ============================================================================
// Constants
// ============================================================================

/// Request path used by the namespace layer.
pub const DEFAULT_PATH: &str = "/socket.io";

/// Default first reconnection delay.
pub const DEFAULT_RECONNECTION_DELAY: Duration = Duration::from_millis(1000);

/// Default reconnection delay ceiling.
pub const DEFAULT_RECONNECTION_DELAY_MAX: Duration = Duration::from_millis(5000);

/// Default jitter applied to reconnection delays.
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

/// Default time allowed for a connection to open.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Growth factor of the reconnection delay.
const BACKOFF_FACTOR: f64 = 2.0;

// ============================================================================
// ManagerOptions
// ============================================================================

/// Configuration for a [`Manager`](crate::Manager).
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Reconnect automatically after an unexpected close.
    pub reconnection: bool,

    /// Attempts before giving up. `None` retries forever.
    pub reconnection_attempts: Option<u32>,

    /// First reconnection delay.
    pub reconnection_delay: Duration,

    /// Reconnection delay ceiling.
    pub reconnection_delay_max: Duration,

    /// Jitter factor, `0.0..=1.0`.
    pub randomization_factor: f64,

    /// Time allowed for a connection to open. `None` waits forever.
    pub timeout: Option<Duration>,

    /// Open the connection as soon as a namespace is requested.
    pub auto_connect: bool,

    /// Never share this manager through a registry.
    pub force_new: bool,

    /// Allow a registry to share managers between namespaces.
    pub multiplex: bool,

    /// Seed for reproducible reconnection delays.
    pub backoff_seed: Option<u64>,

    /// Engine connection options.
    pub engine: EngineOptions,

    /// Defaults for namespaces created through the manager.
    pub socket: SocketOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ManagerOptions {
    /// Creates options with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reconnection: true,
            reconnection_attempts: None,
            reconnection_delay: DEFAULT_RECONNECTION_DELAY,
            reconnection_delay_max: DEFAULT_RECONNECTION_DELAY_MAX,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            timeout: Some(DEFAULT_TIMEOUT),
            auto_connect: true,
            force_new: false,
            multiplex: true,
            backoff_seed: None,
            engine: EngineOptions::new().with_path(DEFAULT_PATH),
            socket: SocketOptions::default(),
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ManagerOptions {
    /// Enables or disables automatic reconnection.
    #[inline]
    #[must_use]
    pub fn with_reconnection(mut self, enabled: bool) -> Self {
        self.reconnection = enabled;
        self
    }

    /// Limits reconnection attempts.
    #[inline]
    #[must_use]
    pub fn with_reconnection_attempts(mut self, attempts: u32) -> Self {
        self.reconnection_attempts = Some(attempts);
        self
    }

    /// Sets the first reconnection delay.
    #[inline]
    #[must_use]
    pub fn with_reconnection_delay(mut self, delay: Duration) -> Self {
        self.reconnection_delay = delay;
        self
    }

    /// Sets the reconnection delay ceiling.
    #[inline]
    #[must_use]
    pub fn with_reconnection_delay_max(mut self, delay: Duration) -> Self {
        self.reconnection_delay_max = delay;
        self
    }

    /// Sets the jitter factor.
    #[inline]
    #[must_use]
    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor;
        self
    }

    /// Sets the open timeout.
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables or disables connecting on namespace creation.
    #[inline]
    #[must_use]
    pub fn with_auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    /// Keeps the manager out of registry caches.
    #[inline]
    #[must_use]
    pub fn with_force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Enables or disables manager sharing in a registry.
    #[inline]
    #[must_use]
    pub fn with_multiplex(mut self, enabled: bool) -> Self {
        self.multiplex = enabled;
        self
    }

    /// Makes reconnection delays reproducible.
    #[inline]
    #[must_use]
    pub fn with_backoff_seed(mut self, seed: u64) -> Self {
        self.backoff_seed = Some(seed);
        self
    }

    /// Replaces the engine options.
    #[inline]
    #[must_use]
    pub fn with_engine(mut self, engine: EngineOptions) -> Self {
        self.engine = engine;
        self
    }

    /// Replaces the default namespace options.
    #[inline]
    #[must_use]
    pub fn with_socket(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ManagerOptions {
    /// Checks the options for values that cannot work.
    ///
    /// # Errors
    ///
    /// - [`Error::NoTransports`] if no transport is enabled
    /// - [`Error::Config`] if the delay range or jitter is out of bounds
    pub fn validate(&self) -> Result<()> {
        if self.engine.transports.is_empty() {
            return Err(Error::NoTransports);
        }
        if self.reconnection_delay > self.reconnection_delay_max {
            return Err(Error::config(
                "reconnection_delay must not exceed reconnection_delay_max",
            ));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(Error::config("randomization_factor must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// Creates the reconnection backoff described by these options.
    #[must_use]
    pub(crate) fn backoff(&self) -> Backoff {
        let backoff = Backoff::new(
            self.reconnection_delay,
            self.reconnection_delay_max,
            BACKOFF_FACTOR,
            self.randomization_factor,
        );
        match self.backoff_seed {
            Some(seed) => backoff.with_seed(seed),
            None => backoff,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ManagerOptions::default();
        assert!(options.reconnection);
        assert_eq!(options.reconnection_attempts, None);
        assert_eq!(options.reconnection_delay, Duration::from_secs(1));
        assert_eq!(options.reconnection_delay_max, Duration::from_secs(5));
        assert_eq!(options.timeout, Some(Duration::from_secs(20)));
        assert_eq!(options.engine.path, "/socket.io");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let options = ManagerOptions::new()
            .with_reconnection_delay(Duration::from_secs(10))
            .with_reconnection_delay_max(Duration::from_secs(1));
        assert!(matches!(options.validate(), Err(Error::Config { .. })));

        let options = ManagerOptions::new().with_randomization_factor(1.5);
        assert!(options.validate().is_err());

        let options = ManagerOptions::new().with_engine(EngineOptions::new().with_transports([]));
        assert!(matches!(options.validate(), Err(Error::NoTransports)));
    }

    #[test]
    fn test_seeded_backoff_is_reproducible() {
        let options = ManagerOptions::new().with_backoff_seed(9);
        let mut a = options.backoff();
        let mut b = options.backoff();
        for _ in 0..5 {
            assert_eq!(a.duration(), b.duration());
        }
    }
}
