//! Real-time client transport stack.
//!
//! This library connects to an engine/namespace server over HTTP
//! long-polling or WebSocket, upgrades to WebSocket when the server offers
//! it, and multiplexes named channels with acknowledgements and automatic
//! reconnection over one connection.
//!
//! # Architecture
//!
//! Each [`Manager`] runs one event loop task:
//!
//! - **Engine**: handshake, heartbeat, write buffering and upgrade probes
//! - **Manager**: reconnection with backoff, packet encoding and decoding
//! - **Sockets**: per-namespace connect, emit, acks, buffering and retries
//!
//! Handles ([`Manager`], [`Socket`]) only send commands to the loop and
//! read state it mirrors, so they are cheap to clone and never block.
//!
//! # Quick Start
//!
//! ```no_run
//! use sio_client::{Payload, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let socket = sio_client::connect("http://localhost:3000/chat")?;
//!
//!     socket.on("message", |msg| {
//!         println!("received {:?}", msg.args());
//!     });
//!
//!     socket.emit("join", vec![Payload::from("lobby")])?;
//!     let reply = socket.emit_with_ack_async("count", vec![]).await?;
//!     println!("reply: {reply:?}");
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`backoff`] | Exponential reconnection delays |
//! | [`emitter`] | Listener tables |
//! | [`engine`] | Engine connection state machine |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`manager`] | Connection manager and reconnection |
//! | [`protocol`] | Engine and namespace wire codecs |
//! | [`registry`] | Manager cache keyed by origin |
//! | [`socket`] | Namespace sockets |
//! | [`transport`] | Polling and WebSocket transports |

// ============================================================================
// Modules
// ============================================================================

/// Exponential backoff with jitter.
pub mod backoff;

/// Listener tables.
pub mod emitter;

/// Engine connection.
///
/// Drives one logical session across transport upgrades.
pub mod engine;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Connection manager.
///
/// Use [`Manager::builder()`] to create a configured manager.
pub mod manager;

/// Engine and namespace wire codecs.
pub mod protocol;

/// Manager cache.
pub mod registry;

/// Namespace sockets.
pub mod socket;

/// Transport layer.
///
/// Transports turn provider I/O into engine packets.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Engine types
pub use engine::{CloseReason, EngineOptions, EngineState};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{AckId, SessionId, SubscriptionId};

// Manager types
pub use manager::{Manager, ManagerBuilder, ManagerEvent, ManagerOptions, ManagerState};

// Protocol types
pub use protocol::{Payload, ProtocolVersion};

// Registry
pub use registry::{Registry, connect, connect_with};

// Socket types
pub use socket::{AckResponder, Auth, AuthProvider, EventMessage, Socket, SocketEvent, SocketOptions};

// Transport types
pub use transport::{PollingProvider, StreamingProvider, TransportKind};
