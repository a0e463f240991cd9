//! I/O provider interfaces.
//!
//! Transports never open sockets themselves; they ask a provider. The
//! defaults are [`HttpProvider`](super::http::HttpProvider) and
//! [`WebSocketProvider`](super::websocket::WebSocketProvider); tests and
//! embedders may supply their own.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::Frame;

// ============================================================================
// Types
// ============================================================================

/// Extra request headers as name/value pairs.
pub type Headers = [(String, String)];

// ============================================================================
// PollingProvider
// ============================================================================

/// Request/response primitive used by the polling transport.
#[async_trait]
pub trait PollingProvider: Send + Sync + 'static {
    /// Performs a poll request and returns the response body.
    async fn get(&self, url: &Url, headers: &Headers) -> Result<Frame>;

    /// Posts a body.
    async fn post(&self, url: &Url, headers: &Headers, body: Frame) -> Result<()>;
}

// ============================================================================
// StreamingProvider
// ============================================================================

/// Event reported by a duplex channel.
#[derive(Debug)]
pub enum DuplexEvent {
    /// A frame arrived.
    Frame(Frame),
    /// The remote side closed the channel.
    Closed,
    /// The channel failed.
    Error(Error),
}

/// An established duplex channel.
///
/// Dropping `sender` asks the provider to close the connection.
#[derive(Debug)]
pub struct DuplexChannel {
    /// Outgoing frames.
    pub sender: mpsc::UnboundedSender<Frame>,
    /// Incoming frames and lifecycle events.
    pub receiver: mpsc::UnboundedReceiver<DuplexEvent>,
}

/// Persistent duplex primitive used by the streaming transport.
#[async_trait]
pub trait StreamingProvider: Send + Sync + 'static {
    /// Opens a channel to `url`.
    async fn connect(&self, url: &Url, headers: &Headers) -> Result<DuplexChannel>;
}
