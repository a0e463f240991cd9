//! Error types for the client stack.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use sio_client::{Manager, Result};
//!
//! async fn example() -> Result<()> {
//!     let manager = Manager::builder("http://localhost:3000").build()?;
//!     manager.connect().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidUrl`], [`Error::NoTransports`] |
//! | Transport | [`Error::Transport`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`], [`Error::Probe`], [`Error::Server`] |
//! | Protocol | [`Error::Parse`] |
//! | Namespace | [`Error::Connect`], [`Error::AckTimeout`], [`Error::ReservedEvent`] |
//! | Reconnection | [`Error::ReconnectExhausted`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Http`], [`Error::Url`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::AckId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when manager or engine configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// The connection URL could not be used.
    #[error("Invalid URL: {url}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
    },

    /// No transport is left to open the connection with.
    #[error("No transports available")]
    NoTransports,

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport I/O failure.
    ///
    /// Raised by a polling or streaming transport when its underlying
    /// request or socket fails.
    #[error("Transport error: {message}")]
    Transport {
        /// Short failure kind (`xhr poll error`, `websocket error`, ...).
        message: String,
        /// Underlying cause, when known.
        description: Option<String>,
    },

    /// Handshake did not complete in time.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed before the operation could complete.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Upgrade probe failed.
    ///
    /// Only reported through upgrade events; never affects the active transport.
    #[error("Probe error on {transport}: {message}")]
    Probe {
        /// Name of the probed transport.
        transport: String,
        /// Failure description.
        message: String,
    },

    /// The server sent an engine-level error packet.
    #[error("Server error: {code}")]
    Server {
        /// Error code carried by the packet.
        code: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed frame.
    ///
    /// Produced by decoders as an error value, never as a panic.
    #[error("Parse error: {message}")]
    Parse {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Namespace Errors
    // ========================================================================
    /// Namespace connection refused by the server.
    #[error("Connect error: {message}")]
    Connect {
        /// Message sent by the server.
        message: String,
        /// Extra data sent by the server.
        data: Option<Value>,
    },

    /// Acknowledgement not received in time.
    ///
    /// Delivered only to the callback waiting for this acknowledgement.
    #[error("Acknowledgement {id} timed out after {timeout_ms}ms")]
    AckTimeout {
        /// The acknowledgement id that timed out.
        id: AckId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Attempt to emit a reserved event name.
    #[error("\"{event}\" is a reserved event name")]
    ReservedEvent {
        /// The rejected event name.
        event: String,
    },

    // ========================================================================
    // Reconnection Errors
    // ========================================================================
    /// Reconnection attempts are spent.
    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parse error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid URL error.
    #[inline]
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>, description: Option<String>) -> Self {
        Self::Transport {
            message: message.into(),
            description,
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a probe error.
    #[inline]
    pub fn probe(transport: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Probe {
            transport: transport.into(),
            message: message.into(),
        }
    }

    /// Creates a server error.
    #[inline]
    pub fn server(code: impl Into<String>) -> Self {
        Self::Server { code: code.into() }
    }

    /// Creates a parse error.
    #[inline]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Creates a connect error.
    #[inline]
    pub fn connect(message: impl Into<String>, data: Option<Value>) -> Self {
        Self::Connect {
            message: message.into(),
            data,
        }
    }

    /// Creates an acknowledgement timeout error.
    #[inline]
    pub fn ack_timeout(id: AckId, timeout_ms: u64) -> Self {
        Self::AckTimeout { id, timeout_ms }
    }

    /// Creates a reserved event error.
    #[inline]
    pub fn reserved_event(event: impl Into<String>) -> Self {
        Self::ReservedEvent {
            event: event.into(),
        }
    }

    /// Creates a reconnection exhausted error.
    #[inline]
    pub fn reconnect_exhausted(attempts: u32) -> Self {
        Self::ReconnectExhausted { attempts }
    }
}

// ============================================================================
// Error Duplication
// ============================================================================

impl Error {
    /// Copies the error for delivery to several waiters.
    ///
    /// Wrapped external errors are not cloneable and become
    /// [`Error::Transport`] carrying their message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Config { message } => Self::config(message.clone()),
            Self::InvalidUrl { url } => Self::invalid_url(url.clone()),
            Self::NoTransports => Self::NoTransports,
            Self::Transport {
                message,
                description,
            } => Self::transport(message.clone(), description.clone()),
            Self::ConnectionTimeout { timeout_ms } => Self::connection_timeout(*timeout_ms),
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::Probe { transport, message } => Self::probe(transport.clone(), message.clone()),
            Self::Server { code } => Self::server(code.clone()),
            Self::Parse { message } => Self::parse(message.clone()),
            Self::Connect { message, data } => Self::connect(message.clone(), data.clone()),
            Self::AckTimeout { id, timeout_ms } => Self::ack_timeout(*id, *timeout_ms),
            Self::ReservedEvent { event } => Self::reserved_event(event.clone()),
            Self::ReconnectExhausted { attempts } => Self::reconnect_exhausted(*attempts),
            other => Self::transport(other.to_string(), None),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::AckTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::Server { .. }
                | Self::WebSocket(_)
                | Self::Http(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::AckTimeout { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
