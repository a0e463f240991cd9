//! Connection manager.
//!
//! A [`Manager`] owns one engine connection and multiplexes namespace
//! [`Socket`]s over it. It reconnects with exponential backoff after an
//! unexpected close and replays namespace connects once the link is back.
//!
//! # Example
//!
//! ```ignore
//! use sio_client::{Manager, ManagerEvent};
//!
//! # async fn example() -> sio_client::Result<()> {
//! let manager = Manager::builder("http://localhost:3000").build()?;
//!
//! manager.on(|event| {
//!     if let ManagerEvent::ReconnectAttempt(n) = event {
//!         println!("reconnect attempt {n}");
//!     }
//! });
//!
//! let socket = manager.socket("/");
//! socket.emit("hello", vec!["world".into()])?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `builder` | [`ManagerBuilder`] |
//! | `event_loop` | Task owning the engine and namespaces |
//! | `options` | [`ManagerOptions`] |
//! | `timers` | Deadline table |

// ============================================================================
// Submodules
// ============================================================================

/// Manager builder.
mod builder;

/// Manager event loop.
mod event_loop;

/// Manager configuration.
pub mod options;

/// Deadline table.
pub(crate) mod timers;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tracing::debug;
use url::Url;

use crate::emitter::Listeners;
use crate::engine::CloseReason;
use crate::error::{Error, Result};
use crate::identifiers::SubscriptionId;
use crate::protocol::{EventPacket, Payload};
use crate::socket::{Emission, Socket, SocketOptions, SocketShared};
use crate::transport::TransportKind;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ManagerBuilder;
pub use options::ManagerOptions;

// ============================================================================
// ManagerEvent
// ============================================================================

/// Events published by a [`Manager`].
#[derive(Debug)]
pub enum ManagerEvent {
    /// The connection opened.
    Open,
    /// The connection reported an error.
    Error(Error),
    /// The connection closed.
    Close {
        /// Why it closed.
        reason: CloseReason,
        /// Transport detail, if any.
        description: Option<String>,
    },
    /// A heartbeat ping arrived.
    Ping,
    /// A namespace packet was decoded.
    Packet(EventPacket),
    /// The connection moved to another transport.
    Upgrade(TransportKind),
    /// A reconnection attempt is starting.
    ReconnectAttempt(u32),
    /// Reconnected after the given number of attempts.
    Reconnect(u32),
    /// A reconnection attempt failed.
    ReconnectError(Error),
    /// Reconnection gave up.
    ReconnectFailed(Error),
}

// ============================================================================
// ManagerState
// ============================================================================

/// Connection state of a [`Manager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ManagerState {
    /// No connection.
    #[default]
    Closed,
    /// Waiting for the handshake.
    Opening,
    /// Connected.
    Open,
}

// ============================================================================
// Command
// ============================================================================

/// Requests sent from handles to the event loop.
pub(crate) enum Command {
    /// Open the connection, optionally reporting the outcome.
    Open {
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    /// Close the connection and stop reconnecting.
    Close,
    /// Abandon an upgrade in progress.
    CancelUpgrade,
    /// Register a namespace.
    CreateSocket {
        nsp: String,
        shared: Arc<SocketShared>,
        options: SocketOptions,
    },
    /// Connect a namespace.
    SocketConnect { nsp: String },
    /// Disconnect a namespace.
    SocketDisconnect { nsp: String },
    /// Send a CONNECT carrying a resolved auth payload.
    SendConnect { nsp: String, auth: Payload },
    /// Emit an event.
    Emit { nsp: String, emission: Emission },
    /// Acknowledge a server event.
    Ack {
        nsp: String,
        id: u64,
        args: Vec<Payload>,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { .. } => f.write_str("Open"),
            Self::Close => f.write_str("Close"),
            Self::CancelUpgrade => f.write_str("CancelUpgrade"),
            Self::CreateSocket { nsp, .. } => write!(f, "CreateSocket({nsp})"),
            Self::SocketConnect { nsp } => write!(f, "SocketConnect({nsp})"),
            Self::SocketDisconnect { nsp } => write!(f, "SocketDisconnect({nsp})"),
            Self::SendConnect { nsp, .. } => write!(f, "SendConnect({nsp})"),
            Self::Emit { nsp, emission } => write!(f, "Emit({nsp}, {})", emission.event),
            Self::Ack { nsp, id, .. } => write!(f, "Ack({nsp}, {id})"),
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// Status mirrored by the event loop for synchronous readers.
#[derive(Debug, Default)]
pub(crate) struct ManagerStatus {
    pub(crate) state: ManagerState,
    pub(crate) reconnecting: bool,
    pub(crate) transport: Option<TransportKind>,
}

/// State shared between handles and the event loop.
pub(crate) struct ManagerShared {
    pub(crate) base: Url,
    pub(crate) uri: String,
    pub(crate) options: ManagerOptions,
    pub(crate) events: Listeners<ManagerEvent>,
    pub(crate) status: Mutex<ManagerStatus>,
    pub(crate) sockets: Mutex<FxHashMap<String, Arc<SocketShared>>>,
}

// ============================================================================
// Manager
// ============================================================================

/// Handle to a connection manager.
///
/// Cheap to clone. The event loop stops once every handle, including the
/// [`Socket`]s created from it, is dropped.
#[derive(Clone)]
pub struct Manager {
    commands: UnboundedSender<Command>,
    shared: Arc<ManagerShared>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("uri", &self.shared.uri)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Manager - Constructors
// ============================================================================

impl Manager {
    /// Creates a builder for `uri`.
    #[inline]
    #[must_use]
    pub fn builder(uri: impl Into<String>) -> ManagerBuilder {
        ManagerBuilder::new(uri)
    }

    /// Creates a manager with default options.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if `uri` is not an http(s) or ws(s) URL
    /// - [`Error::Config`] outside a Tokio runtime
    pub fn new(uri: impl Into<String>) -> Result<Self> {
        Self::builder(uri).build()
    }

    pub(crate) fn from_parts(commands: UnboundedSender<Command>, shared: Arc<ManagerShared>) -> Self {
        Self { commands, shared }
    }
}

// ============================================================================
// Manager - Accessors
// ============================================================================

impl Manager {
    /// The URI the manager was created with.
    #[inline]
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.shared.uri
    }

    /// The manager's options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ManagerOptions {
        &self.shared.options
    }

    /// Current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ManagerState {
        self.shared.status.lock().state
    }

    /// Returns `true` while a reconnection is scheduled or running.
    #[inline]
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.shared.status.lock().reconnecting
    }

    /// Transport currently carrying the connection.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> Option<TransportKind> {
        self.shared.status.lock().transport
    }

    /// Returns `true` if both handles drive the same connection.
    #[inline]
    #[must_use]
    pub fn same_manager(&self, other: &Manager) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Returns `true` if `nsp` has been requested from this manager.
    #[must_use]
    pub fn has_socket(&self, nsp: &str) -> bool {
        self.shared.sockets.lock().contains_key(&normalize_namespace(nsp))
    }
}

// ============================================================================
// Manager - Connection
// ============================================================================

impl Manager {
    /// Opens the connection and waits for the handshake.
    ///
    /// Returns at once if already open.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if the handshake does not complete in time
    /// - [`Error::ConnectionClosed`] if the manager closes meanwhile
    /// - Any transport error that aborted the attempt
    pub async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Open { reply: Some(reply) })?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Starts opening the connection without waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the event loop has stopped
    pub fn open(&self) -> Result<()> {
        self.send(Command::Open { reply: None })
    }

    /// Closes the connection and cancels reconnection.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the event loop has stopped
    pub fn close(&self) -> Result<()> {
        self.send(Command::Close)
    }

    /// Abandons a transport upgrade in progress.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the event loop has stopped
    pub fn cancel_upgrade(&self) -> Result<()> {
        self.send(Command::CancelUpgrade)
    }

    pub(crate) fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::ConnectionClosed)
    }
}

// ============================================================================
// Manager - Namespaces
// ============================================================================

impl Manager {
    /// Returns the socket for `nsp` using the manager's default options.
    ///
    /// The same namespace always maps to the same underlying socket.
    #[must_use]
    pub fn socket(&self, nsp: &str) -> Socket {
        self.socket_with(nsp, self.shared.options.socket.clone())
    }

    /// Returns the socket for `nsp`, creating it with `options` if new.
    #[must_use]
    pub fn socket_with(&self, nsp: &str, options: SocketOptions) -> Socket {
        let nsp = normalize_namespace(nsp);
        let auto_connect = self.shared.options.auto_connect;

        let mut sockets = self.shared.sockets.lock();
        if let Some(shared) = sockets.get(&nsp) {
            let socket = Socket::new(Arc::clone(shared), self.clone());
            if auto_connect && !socket.active() {
                let _ = socket.connect();
            }
            return socket;
        }

        debug!(nsp = %nsp, "Creating namespace socket");
        let shared = Arc::new(SocketShared::new(nsp.clone()));
        sockets.insert(nsp.clone(), Arc::clone(&shared));
        let _ = self.send(Command::CreateSocket {
            nsp: nsp.clone(),
            shared: Arc::clone(&shared),
            options,
        });
        if auto_connect {
            let _ = self.send(Command::SocketConnect { nsp });
        }
        drop(sockets);

        Socket::new(shared, self.clone())
    }
}

// ============================================================================
// Manager - Listeners
// ============================================================================

impl Manager {
    /// Registers a handler for manager events.
    pub fn on(&self, handler: impl Fn(&ManagerEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.shared.events.add(handler)
    }

    /// Registers a handler for the next manager event only.
    pub fn once(&self, handler: impl Fn(&ManagerEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.shared.events.add_once(handler)
    }

    /// Removes a manager event handler.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.shared.events.remove(id)
    }
}

/// Prefixes `/` when missing.
fn normalize_namespace(nsp: &str) -> String {
    if nsp.starts_with('/') {
        nsp.to_string()
    } else {
        format!("/{nsp}")
    }
}

// ============================================================================
// Tests
// ============================================================================
