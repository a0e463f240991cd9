//! Transport layer.
//!
//! A transport is a small state machine over one bidirectional channel.
//! It never blocks: I/O runs in spawned tasks that report completions as
//! [`IoEvent`]s tagged with the transport's [`TransportId`]. The owner
//! feeds each completion back through [`Transport::handle_io`] and then
//! drains [`Transport::next_event`].
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  open/send/pause/close  ┌───────────┐  get/post/connect  ┌──────────┐
//! │   Engine   │────────────────────────►│ Transport │───────────────────►│ Provider │
//! │            │◄────────────────────────│           │◄───────────────────│  tasks   │
//! └────────────┘  TransportEvent queue   └───────────┘  (id, IoEvent)     └──────────┘
//! ```
//!
//! # States
//!
//! ```text
//! unopened → opening → open → closing → closed
//!                        ↓
//!                     pausing → paused   (upgrade handoff only)
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `http` | Default polling provider (reqwest) |
//! | `polling` | Long-polling transport |
//! | `provider` | Provider traits |
//! | `endpoint` | Request URL construction |
//! | `streaming` | Persistent duplex transport |
//! | `websocket` | Default streaming provider (tokio-tungstenite) |

// ============================================================================
// Submodules
// ============================================================================

/// Transport URL construction.
pub mod endpoint;

/// Default polling provider.
pub mod http;

/// Long-polling transport.
pub mod polling;

/// I/O provider interfaces.
pub mod provider;

/// Persistent duplex transport.
pub mod streaming;

/// Default streaming provider.
pub mod websocket;

/// Scripted providers for tests.
#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::engine::EngineOptions;
use crate::error::{Error, Result};
use crate::identifiers::{SessionId, TransportId};
use crate::protocol::{Frame, Packet};

// ============================================================================
// Re-exports
// ============================================================================

pub use self::http::HttpProvider;
pub use polling::PollingTransport;
pub use provider::{DuplexChannel, DuplexEvent, Headers, PollingProvider, StreamingProvider};
pub use streaming::StreamingTransport;
pub use websocket::WebSocketProvider;

// ============================================================================
// Types
// ============================================================================

/// Channel carrying I/O completions to the owning event loop.
pub type IoSender = mpsc::UnboundedSender<(TransportId, IoEvent)>;

/// Receiving end of [`IoSender`].
pub type IoReceiver = mpsc::UnboundedReceiver<(TransportId, IoEvent)>;

// ============================================================================
// TransportKind
// ============================================================================

/// Available transport variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// HTTP long-polling.
    Polling,
    /// WebSocket.
    WebSocket,
}

impl TransportKind {
    /// Name used on the wire and in handshakes.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::WebSocket => "websocket",
        }
    }

    /// Parses a wire name.
    #[inline]
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "polling" => Some(Self::Polling),
            "websocket" => Some(Self::WebSocket),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ReadyState
// ============================================================================

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    /// Created, not yet opened.
    Unopened,
    /// Connecting.
    Opening,
    /// Ready for traffic.
    Open,
    /// Waiting for in-flight I/O before handing off.
    Pausing,
    /// Idle, ready to be swapped out.
    Paused,
    /// Shutting down.
    Closing,
    /// Finished.
    Closed,
}

// ============================================================================
// IoEvent
// ============================================================================

/// Completion reported by a transport's I/O task.
#[derive(Debug)]
pub enum IoEvent {
    /// A poll request finished.
    Polled(Result<Frame>),
    /// A write finished.
    Written(Result<()>),
    /// A duplex channel was established.
    Connected,
    /// A duplex channel delivered a frame.
    Received(Frame),
    /// The remote side closed the duplex channel.
    Disconnected,
    /// The duplex channel failed.
    Failed(Error),
}

// ============================================================================
// TransportEvent
// ============================================================================

/// Notification from a transport to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// The channel is open.
    Open,
    /// A packet arrived.
    Packet(Packet),
    /// All queued writes completed.
    Drain,
    /// A pause completed.
    Paused,
    /// The channel closed.
    Close,
    /// The channel failed.
    Error(Error),
}

// ============================================================================
// Transport
// ============================================================================

/// Behaviour shared by the polling and streaming variants.
///
/// All methods return immediately; results arrive as [`TransportEvent`]s.
pub trait Transport: Send + fmt::Debug {
    /// Instance id used to tag I/O completions.
    fn id(&self) -> TransportId;

    /// Variant of this transport.
    fn kind(&self) -> TransportKind;

    /// Current lifecycle state.
    fn ready_state(&self) -> ReadyState;

    /// Returns `true` if a send would be accepted now.
    fn is_writable(&self) -> bool;

    /// Returns `true` if binary payloads travel unencoded.
    fn supports_binary(&self) -> bool;

    /// Starts connecting.
    fn open(&mut self);

    /// Closes the channel. Pending I/O is abandoned.
    fn close(&mut self);

    /// Writes a batch of packets. Ignored unless writable.
    fn send(&mut self, packets: Vec<Packet>);

    /// Waits for in-flight I/O, then reports [`TransportEvent::Paused`].
    fn pause(&mut self);

    /// Returns to the open state after an abandoned pause.
    fn resume(&mut self);

    /// Records the session id for subsequent requests.
    fn set_session_id(&mut self, session_id: SessionId);

    /// Applies an I/O completion.
    fn handle_io(&mut self, event: IoEvent);

    /// Pops the next pending notification.
    fn next_event(&mut self) -> Option<TransportEvent>;
}

// ============================================================================
// TransportContext
// ============================================================================

/// Everything a transport needs to start.
#[derive(Debug, Clone)]
pub struct TransportContext {
    /// Server base URL (`http` or `https`).
    pub base: Url,
    /// Engine options.
    pub options: Arc<EngineOptions>,
    /// Session id, set when probing.
    pub session_id: Option<SessionId>,
    /// Completion channel.
    pub io_tx: IoSender,
}

impl TransportContext {
    /// Builds the request URL for `kind`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if the base URL cannot carry `kind`
    pub fn url(&self, kind: TransportKind, supports_binary: bool) -> Result<Url> {
        endpoint::transport_url(
            &self.base,
            &self.options,
            kind,
            self.session_id.as_ref(),
            supports_binary,
        )
    }
}

// ============================================================================
// TransportFactory
// ============================================================================

/// Creates transports.
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Creates an unopened transport of `kind`.
    fn create(&self, kind: TransportKind, context: TransportContext) -> Box<dyn Transport>;
}

/// Factory wiring the built-in transports to providers.
#[derive(Clone)]
pub struct IoTransportFactory {
    polling: Arc<dyn PollingProvider>,
    streaming: Arc<dyn StreamingProvider>,
}

impl fmt::Debug for IoTransportFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoTransportFactory").finish_non_exhaustive()
    }
}

impl IoTransportFactory {
    /// Creates a factory using the given providers.
    #[must_use]
    pub fn new(polling: Arc<dyn PollingProvider>, streaming: Arc<dyn StreamingProvider>) -> Self {
        Self { polling, streaming }
    }
}

impl Default for IoTransportFactory {
    fn default() -> Self {
        Self::new(
            Arc::new(HttpProvider::new()),
            Arc::new(WebSocketProvider::new()),
        )
    }
}

impl TransportFactory for IoTransportFactory {
    fn create(&self, kind: TransportKind, context: TransportContext) -> Box<dyn Transport> {
        match kind {
            TransportKind::Polling => {
                Box::new(PollingTransport::new(context, Arc::clone(&self.polling)))
            }
            TransportKind::WebSocket => {
                Box::new(StreamingTransport::new(context, Arc::clone(&self.streaming)))
            }
        }
    }
}

// ============================================================================
// TaskSet
// ============================================================================

/// I/O tasks owned by one transport, aborted when it is dropped.
#[derive(Debug, Default)]
pub(crate) struct TaskSet {
    handles: Vec<JoinHandle<()>>,
}

impl TaskSet {
    /// Tracks a task.
    pub(crate) fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.retain(|h| !h.is_finished());
        self.handles.push(handle);
    }

    /// Aborts every tracked task.
    pub(crate) fn abort_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_names() {
        assert_eq!(TransportKind::Polling.as_str(), "polling");
        assert_eq!(TransportKind::from_name("websocket"), Some(TransportKind::WebSocket));
        assert_eq!(TransportKind::from_name("webtransport"), None);
    }

    #[tokio::test]
    async fn test_task_set_aborts_on_drop() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut tasks = TaskSet::default();
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            let _ = tx.send(());
        }));
        drop(tasks);
        assert!(rx.recv().await.is_none());
    }
}
