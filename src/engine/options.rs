//! Engine connection options.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use sio_client::{EngineOptions, TransportKind};
//!
//! let options = EngineOptions::new()
//!     .with_transports([TransportKind::WebSocket])
//!     .with_query("token", "abc")
//!     .with_probe_timeout(Duration::from_secs(5));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::protocol::ProtocolVersion;
use crate::transport::TransportKind;

// ============================================================================
// Constants
// ============================================================================

/// Default request path.
pub const DEFAULT_PATH: &str = "/engine.io";

/// Default cache-busting query parameter.
pub const DEFAULT_TIMESTAMP_PARAM: &str = "t";

/// Default time allowed for an upgrade probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// EngineOptions
// ============================================================================

/// Configuration for one engine connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Request path.
    pub path: String,

    /// Extra query pairs sent with every request.
    pub query: Vec<(String, String)>,

    /// Protocol revision.
    pub version: ProtocolVersion,

    /// Transports to use, in order of preference.
    pub transports: Vec<TransportKind>,

    /// Probe for a better transport after opening.
    pub upgrade: bool,

    /// Start on websocket if the previous connection upgraded to it.
    pub remember_upgrade: bool,

    /// Add a timestamp to requests. `None` means polling only.
    pub timestamp_requests: Option<bool>,

    /// Name of the timestamp query parameter.
    pub timestamp_param: String,

    /// Send binary as base64 even on websocket.
    pub force_base64: bool,

    /// Extra headers sent with every request.
    pub extra_headers: Vec<(String, String)>,

    /// Time allowed for an upgrade probe to answer.
    pub probe_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl EngineOptions {
    /// Creates options with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: DEFAULT_PATH.to_string(),
            query: Vec::new(),
            version: ProtocolVersion::default(),
            transports: vec![TransportKind::Polling, TransportKind::WebSocket],
            upgrade: true,
            remember_upgrade: false,
            timestamp_requests: None,
            timestamp_param: DEFAULT_TIMESTAMP_PARAM.to_string(),
            force_base64: false,
            extra_headers: Vec::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl EngineOptions {
    /// Sets the request path.
    #[inline]
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Adds a query pair.
    #[inline]
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Sets the protocol revision.
    #[inline]
    #[must_use]
    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    /// Sets the transports to use.
    #[inline]
    #[must_use]
    pub fn with_transports(mut self, transports: impl IntoIterator<Item = TransportKind>) -> Self {
        self.transports = transports.into_iter().collect();
        self
    }

    /// Enables or disables upgrade probing.
    #[inline]
    #[must_use]
    pub fn with_upgrade(mut self, upgrade: bool) -> Self {
        self.upgrade = upgrade;
        self
    }

    /// Enables starting directly on websocket after a successful upgrade.
    #[inline]
    #[must_use]
    pub fn with_remember_upgrade(mut self) -> Self {
        self.remember_upgrade = true;
        self
    }

    /// Forces timestamping on or off for every transport.
    #[inline]
    #[must_use]
    pub fn with_timestamp_requests(mut self, enabled: bool) -> Self {
        self.timestamp_requests = Some(enabled);
        self
    }

    /// Sets the timestamp parameter name.
    #[inline]
    #[must_use]
    pub fn with_timestamp_param(mut self, param: impl Into<String>) -> Self {
        self.timestamp_param = param.into();
        self
    }

    /// Sends binary as base64 on every transport.
    #[inline]
    #[must_use]
    pub fn with_force_base64(mut self) -> Self {
        self.force_base64 = true;
        self
    }

    /// Adds a request header.
    #[inline]
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Sets the upgrade probe timeout.
    #[inline]
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
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
        let options = EngineOptions::default();
        assert_eq!(options.path, "/engine.io");
        assert_eq!(options.transports, [TransportKind::Polling, TransportKind::WebSocket]);
        assert!(options.upgrade);
        assert!(!options.remember_upgrade);
        assert_eq!(options.timestamp_requests, None);
        assert_eq!(options.version, ProtocolVersion::V4);
    }

    #[test]
    fn test_builder_chain() {
        let options = EngineOptions::new()
            .with_transports([TransportKind::WebSocket])
            .with_upgrade(false)
            .with_header("authorization", "Bearer x")
            .with_probe_timeout(Duration::from_secs(1));

        assert_eq!(options.transports, [TransportKind::WebSocket]);
        assert!(!options.upgrade);
        assert_eq!(options.extra_headers.len(), 1);
        assert_eq!(options.probe_timeout, Duration::from_secs(1));
    }
}
