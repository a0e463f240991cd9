//! Namespace sockets.
//!
//! A [`Socket`] is a handle to one namespace multiplexed over a
//! [`Manager`]'s connection. The namespace state itself lives on the
//! manager's event loop; the handle sends commands and owns the listener
//! tables the loop notifies.
//!
//! # Example
//!
//! ```ignore
//! use sio_client::Manager;
//!
//! # async fn example() -> sio_client::Result<()> {
//! let manager = Manager::builder("http://localhost:3000").build()?;
//! let socket = manager.socket("/chat");
//!
//! socket.on("message", |msg| {
//!     println!("{:?}", msg.args());
//!     msg.ack(vec!["thanks".into()]);
//! });
//!
//! socket.emit("join", vec!["lobby".into()])?;
//! let reply = socket.emit_with_ack_async("ping", vec![]).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `options` | [`SocketOptions`], [`Auth`], [`AuthProvider`] |
//! | `state` | Namespace state machine run by the event loop |

// ============================================================================
// Submodules
// ============================================================================

/// Namespace socket options.
pub mod options;

/// Namespace state machine.
pub(crate) mod state;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::sync::oneshot;

use crate::emitter::Listeners;
use crate::engine::CloseReason;
use crate::error::{Error, Result};
use crate::identifiers::SubscriptionId;
use crate::manager::{Command, Manager};
use crate::protocol::Payload;

// ============================================================================
// Re-exports
// ============================================================================

pub use options::{Auth, AuthProvider, SocketOptions};

// ============================================================================
// Constants
// ============================================================================

/// Event names `emit` refuses.
pub const RESERVED_EVENTS: &[&str] = &[
    "connect",
    "connect_error",
    "disconnect",
    "disconnecting",
    "newListener",
    "removeListener",
];

/// Event name used by [`Socket::send`].
pub const MESSAGE_EVENT: &str = "message";

// ============================================================================
// Types
// ============================================================================

/// Acknowledgement callback, called once with the ack arguments or an error.
pub type AckCallback = Box<dyn FnOnce(Result<Vec<Payload>>) + Send>;

/// Per-emit modifiers.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EmitFlags {
    pub(crate) volatile: bool,
    pub(crate) timeout: Option<Duration>,
}

/// One outgoing event on its way to the event loop.
pub(crate) struct Emission {
    pub(crate) event: String,
    pub(crate) args: Vec<Payload>,
    pub(crate) ack: Option<AckCallback>,
    pub(crate) flags: EmitFlags,
}

impl fmt::Debug for Emission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emission")
            .field("event", &self.event)
            .field("args", &self.args.len())
            .field("ack", &self.ack.is_some())
            .field("flags", &self.flags)
            .finish()
    }
}

// ============================================================================
// SocketEvent
// ============================================================================

/// Namespace lifecycle notification.
#[derive(Debug)]
pub enum SocketEvent {
    /// The server accepted the namespace.
    Connect,
    /// The namespace could not connect.
    ConnectError(Error),
    /// The namespace disconnected.
    Disconnect(CloseReason),
}

// ============================================================================
// AckResponder
// ============================================================================

/// Sends the acknowledgement for one received event.
///
/// Only the first call has an effect.
#[derive(Clone)]
pub struct AckResponder {
    nsp: String,
    id: u64,
    sent: Arc<AtomicBool>,
    commands: WeakUnboundedSender<Command>,
}

impl fmt::Debug for AckResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckResponder")
            .field("nsp", &self.nsp)
            .field("id", &self.id)
            .field("sent", &self.is_sent())
            .finish()
    }
}

impl AckResponder {
    pub(crate) fn new(nsp: String, id: u64, commands: WeakUnboundedSender<Command>) -> Self {
        Self {
            nsp,
            id,
            sent: Arc::new(AtomicBool::new(false)),
            commands,
        }
    }

    /// Acknowledgement id of the event.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `true` once the acknowledgement went out.
    #[inline]
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }

    /// Sends the acknowledgement.
    ///
    /// Returns `false` if it was already sent or the connection is gone.
    pub fn send(&self, args: Vec<Payload>) -> bool {
        if self.sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Some(commands) = self.commands.upgrade() else {
            return false;
        };
        commands
            .send(Command::Ack {
                nsp: self.nsp.clone(),
                id: self.id,
                args,
            })
            .is_ok()
    }
}

// ============================================================================
// EventMessage
// ============================================================================

/// A received (or, for outgoing listeners, sent) event.
#[derive(Debug, Clone)]
pub struct EventMessage {
    event: String,
    args: Vec<Payload>,
    responder: Option<AckResponder>,
}

impl EventMessage {
    pub(crate) fn new(event: String, args: Vec<Payload>, responder: Option<AckResponder>) -> Self {
        Self {
            event,
            args,
            responder,
        }
    }

    /// Event name.
    #[inline]
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Event arguments.
    #[inline]
    #[must_use]
    pub fn args(&self) -> &[Payload] {
        &self.args
    }

    /// Argument at `index`.
    #[inline]
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&Payload> {
        self.args.get(index)
    }

    /// Returns `true` if the sender waits for an acknowledgement.
    #[inline]
    #[must_use]
    pub fn expects_ack(&self) -> bool {
        self.responder.is_some()
    }

    /// The acknowledgement sender, if one is expected.
    #[inline]
    #[must_use]
    pub fn responder(&self) -> Option<&AckResponder> {
        self.responder.as_ref()
    }

    /// Acknowledges the event. See [`AckResponder::send`].
    pub fn ack(&self, args: Vec<Payload>) -> bool {
        self.responder.as_ref().is_some_and(|r| r.send(args))
    }
}

// ============================================================================
// SocketShared
// ============================================================================

/// Snapshot of namespace state published by the event loop.
#[derive(Debug, Clone, Default)]
pub(crate) struct SocketStatus {
    pub(crate) id: Option<String>,
    pub(crate) connected: bool,
    pub(crate) active: bool,
    pub(crate) recovered: bool,
}

/// State shared between a [`Socket`] handle and the event loop.
#[derive(Debug)]
pub(crate) struct SocketShared {
    pub(crate) nsp: String,
    pub(crate) handlers: Mutex<FxHashMap<String, Arc<Listeners<EventMessage>>>>,
    pub(crate) any: Listeners<EventMessage>,
    pub(crate) any_outgoing: Listeners<EventMessage>,
    pub(crate) lifecycle: Listeners<SocketEvent>,
    pub(crate) status: Mutex<SocketStatus>,
}

impl SocketShared {
    pub(crate) fn new(nsp: impl Into<String>) -> Self {
        Self {
            nsp: nsp.into(),
            handlers: Mutex::new(FxHashMap::default()),
            any: Listeners::new(),
            any_outgoing: Listeners::new(),
            lifecycle: Listeners::new(),
            status: Mutex::new(SocketStatus::default()),
        }
    }

    /// Handlers registered for `event`.
    pub(crate) fn handlers_for(&self, event: &str) -> Option<Arc<Listeners<EventMessage>>> {
        self.handlers.lock().get(event).cloned()
    }

    fn handlers_entry(&self, event: &str) -> Arc<Listeners<EventMessage>> {
        Arc::clone(
            self.handlers
                .lock()
                .entry(event.to_string())
                .or_insert_with(|| Arc::new(Listeners::new())),
        )
    }
}

// ============================================================================
// Socket
// ============================================================================

/// Handle to one namespace.
///
/// Cheap to clone; clones share listeners and state.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<SocketShared>,
    manager: Manager,
    flags: EmitFlags,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("nsp", &self.shared.nsp)
            .field("status", &*self.shared.status.lock())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Socket - Accessors
// ============================================================================

impl Socket {
    pub(crate) fn new(shared: Arc<SocketShared>, manager: Manager) -> Self {
        Self {
            shared,
            manager,
            flags: EmitFlags::default(),
        }
    }

    /// Namespace name.
    #[inline]
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.shared.nsp
    }

    /// The manager carrying this namespace.
    #[inline]
    #[must_use]
    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Socket id assigned by the server, while connected.
    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.shared.status.lock().id.clone()
    }

    /// Returns `true` while the namespace is connected.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.shared.status.lock().connected
    }

    /// Returns `true` if the namespace wants to be connected.
    #[must_use]
    pub fn active(&self) -> bool {
        self.shared.status.lock().active
    }

    /// Returns `true` if the last connect restored the previous session.
    #[must_use]
    pub fn recovered(&self) -> bool {
        self.shared.status.lock().recovered
    }
}

// ============================================================================
// Socket - Lifecycle
// ============================================================================

impl Socket {
    /// Connects the namespace, opening the manager if needed.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the manager has shut down
    pub fn connect(&self) -> Result<()> {
        self.manager.send(Command::SocketConnect {
            nsp: self.shared.nsp.clone(),
        })
    }

    /// Disconnects the namespace.
    ///
    /// The manager closes its connection once no namespace is active.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the manager has shut down
    pub fn disconnect(&self) -> Result<()> {
        self.manager.send(Command::SocketDisconnect {
            nsp: self.shared.nsp.clone(),
        })
    }
}

// ============================================================================
// Socket - Emitting
// ============================================================================

impl Socket {
    /// Returns a handle whose emits are dropped rather than buffered when
    /// they cannot be sent right away.
    #[must_use]
    pub fn volatile(&self) -> Self {
        let mut socket = self.clone();
        socket.flags.volatile = true;
        socket
    }

    /// Returns a handle whose acknowledgements time out after `timeout`.
    #[must_use]
    pub fn timeout(&self, timeout: Duration) -> Self {
        let mut socket = self.clone();
        socket.flags.timeout = Some(timeout);
        socket
    }

    /// Emits an event.
    ///
    /// # Errors
    ///
    /// - [`Error::ReservedEvent`] if `event` is a reserved name
    /// - [`Error::ConnectionClosed`] if the manager has shut down
    pub fn emit(&self, event: impl Into<String>, args: Vec<Payload>) -> Result<()> {
        self.submit(event.into(), args, None)
    }

    /// Emits an event and calls `callback` with the acknowledgement.
    ///
    /// # Errors
    ///
    /// - [`Error::ReservedEvent`] if `event` is a reserved name
    /// - [`Error::ConnectionClosed`] if the manager has shut down
    pub fn emit_with_ack(
        &self,
        event: impl Into<String>,
        args: Vec<Payload>,
        callback: impl FnOnce(Result<Vec<Payload>>) + Send + 'static,
    ) -> Result<()> {
        self.submit(event.into(), args, Some(Box::new(callback)))
    }

    /// Emits an event and waits for the acknowledgement.
    ///
    /// # Errors
    ///
    /// - [`Error::ReservedEvent`] if `event` is a reserved name
    /// - [`Error::AckTimeout`] if a timeout is set and expires
    /// - [`Error::ConnectionClosed`] if the namespace disconnects first
    pub async fn emit_with_ack_async(
        &self,
        event: impl Into<String>,
        args: Vec<Payload>,
    ) -> Result<Vec<Payload>> {
        let (tx, rx) = oneshot::channel();
        self.emit_with_ack(event, args, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Emits a `message` event.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the manager has shut down
    pub fn send(&self, args: Vec<Payload>) -> Result<()> {
        self.emit(MESSAGE_EVENT, args)
    }

    fn submit(&self, event: String, args: Vec<Payload>, ack: Option<AckCallback>) -> Result<()> {
        if RESERVED_EVENTS.contains(&event.as_str()) {
            return Err(Error::reserved_event(event));
        }
        self.manager.send(Command::Emit {
            nsp: self.shared.nsp.clone(),
            emission: Emission {
                event,
                args,
                ack,
                flags: self.flags,
            },
        })
    }
}

// ============================================================================
// Socket - Listeners
// ============================================================================

impl Socket {
    /// Registers a handler for `event`.
    pub fn on(
        &self,
        event: &str,
        handler: impl Fn(&EventMessage) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared.handlers_entry(event).add(handler)
    }

    /// Registers a handler for the next `event` only.
    pub fn once(
        &self,
        event: &str,
        handler: impl Fn(&EventMessage) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared.handlers_entry(event).add_once(handler)
    }

    /// Removes a handler registered for `event`.
    pub fn off(&self, event: &str, id: SubscriptionId) -> bool {
        self.shared
            .handlers_for(event)
            .is_some_and(|listeners| listeners.remove(id))
    }

    /// Registers a handler for every incoming event.
    pub fn on_any(&self, handler: impl Fn(&EventMessage) + Send + Sync + 'static) -> SubscriptionId {
        self.shared.any.add(handler)
    }

    /// Removes a catch-all handler.
    pub fn off_any(&self, id: SubscriptionId) -> bool {
        self.shared.any.remove(id)
    }

    /// Registers a handler for every event written to the wire.
    pub fn on_any_outgoing(
        &self,
        handler: impl Fn(&EventMessage) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared.any_outgoing.add(handler)
    }

    /// Removes an outgoing catch-all handler.
    pub fn off_any_outgoing(&self, id: SubscriptionId) -> bool {
        self.shared.any_outgoing.remove(id)
    }

    /// Registers a handler for lifecycle events.
    pub fn subscribe(&self, handler: impl Fn(&SocketEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.shared.lifecycle.add(handler)
    }

    /// Removes a lifecycle handler.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.lifecycle.remove(id)
    }

    /// Called each time the namespace connects.
    pub fn on_connect(&self, handler: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        self.subscribe(move |event| {
            if matches!(event, SocketEvent::Connect) {
                handler();
            }
        })
    }

    /// Called when a connect attempt fails.
    pub fn on_connect_error(
        &self,
        handler: impl Fn(&Error) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(move |event| {
            if let SocketEvent::ConnectError(error) = event {
                handler(error);
            }
        })
    }

    /// Called each time the namespace disconnects.
    pub fn on_disconnect(
        &self,
        handler: impl Fn(CloseReason) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(move |event| {
            if let SocketEvent::Disconnect(reason) = event {
                handler(*reason);
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    #[test]
    fn test_responder_sends_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let responder = AckResponder::new("/".into(), 4, tx.downgrade());

        assert!(responder.send(vec![Payload::from(1)]));
        assert!(!responder.send(vec![Payload::from(2)]));
        assert!(responder.is_sent());

        let Ok(Command::Ack { nsp, id, args }) = rx.try_recv() else {
            panic!("expected ack command");
        };
        assert_eq!((nsp.as_str(), id), ("/", 4));
        assert_eq!(args, vec![Payload::from(1)]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_responder_without_loop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let responder = AckResponder::new("/".into(), 1, tx.downgrade());
        drop(tx);
        drop(rx);
        assert!(!responder.send(vec![]));
    }

    #[test]
    fn test_message_ack_without_responder() {
        let message = EventMessage::new("x".into(), vec![Payload::from("a")], None);
        assert!(!message.expects_ack());
        assert!(!message.ack(vec![]));
        assert_eq!(message.arg(0).and_then(Payload::as_str), Some("a"));
    }

    #[test]
    fn test_handlers_entry_is_shared() {
        let shared = SocketShared::new("/");
        let a = shared.handlers_entry("x");
        a.add(|_| {});
        assert_eq!(shared.handlers_for("x").map(|l| l.len()), Some(1));
        assert!(shared.handlers_for("y").is_none());
    }
}
