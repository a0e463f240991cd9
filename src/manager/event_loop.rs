//! Manager event loop.
//!
//! One task per manager owns the engine, every namespace and every timer.
//! It wakes for a command from a handle, an I/O completion from a
//! transport, or the earliest deadline, and never blocks otherwise.
//!
//! ```text
//!            ┌─────────────── commands ◄── Manager / Socket handles
//!            ▼
//!      ┌───────────┐  write/close   ┌────────┐
//!      │ ManagerCore│──────────────►│ Engine │◄── (TransportId, IoEvent)
//!      │            │◄──────────────│        │
//!      └───────────┘  EngineEvent   └────────┘
//!            │
//!            └──► NamespaceSocket (per namespace)
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{UnboundedReceiver, WeakUnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::engine::{CloseReason, Engine, EngineEvent, EngineOptions, EngineState};
use crate::error::{Error, Result};
use crate::identifiers::TransportId;
use crate::protocol::{Decoder, Encoder, EventPacket, Frame};
use crate::socket::state::{Link, NamespaceSocket, Outbox};
use crate::transport::{IoEvent, IoReceiver, IoSender, TransportFactory};

use super::timers::Timers;
use super::{Command, ManagerEvent, ManagerShared, ManagerState};

// ============================================================================
// Types
// ============================================================================

/// Manager-level timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum TimerKey {
    /// The opening engine must finish its handshake.
    ConnectTimeout,
    /// Next reconnection attempt.
    Reconnect,
}

/// Who asked for the engine being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenOrigin {
    /// A namespace connected with auto-connect.
    Auto,
    /// A caller awaits the result.
    Caller,
    /// A reconnection attempt.
    Reconnect,
}

// ============================================================================
// ManagerCore
// ============================================================================

/// State owned by the event loop.
pub(crate) struct ManagerCore {
    shared: Arc<ManagerShared>,
    base: Url,
    engine_options: Arc<EngineOptions>,
    factory: Arc<dyn TransportFactory>,
    io_tx: IoSender,
    commands: WeakUnboundedSender<Command>,
    prior_websocket_success: Arc<AtomicBool>,

    engine: Option<Engine>,
    retired: Vec<Engine>,

    state: ManagerState,
    reconnecting: bool,
    skip_reconnect: bool,
    open_origin: OpenOrigin,
    open_waiters: Vec<oneshot::Sender<Result<()>>>,

    backoff: Backoff,
    encoder: Encoder,
    decoder: Decoder,
    timers: Timers<TimerKey>,

    sockets: FxHashMap<String, NamespaceSocket>,
}

impl ManagerCore {
    pub(crate) fn new(
        shared: Arc<ManagerShared>,
        factory: Arc<dyn TransportFactory>,
        io_tx: IoSender,
        commands: WeakUnboundedSender<Command>,
    ) -> Self {
        let backoff = shared.options.backoff();
        Self {
            base: shared.base.clone(),
            engine_options: Arc::new(shared.options.engine.clone()),
            shared,
            factory,
            io_tx,
            commands,
            prior_websocket_success: Arc::new(AtomicBool::new(false)),
            engine: None,
            retired: Vec::new(),
            state: ManagerState::Closed,
            reconnecting: false,
            skip_reconnect: false,
            open_origin: OpenOrigin::Auto,
            open_waiters: Vec::new(),
            backoff,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            timers: Timers::default(),
            sockets: FxHashMap::default(),
        }
    }

    /// Runs until every handle is dropped.
    pub(crate) async fn run(
        mut self,
        mut commands: UnboundedReceiver<Command>,
        mut io_rx: IoReceiver,
    ) {
        debug!(uri = %self.base, "Manager event loop started");

        loop {
            self.publish_status();
            let deadline = self.next_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, Instant::now()),
                    None => break,
                },

                Some((id, io)) = io_rx.recv() => self.handle_io(id, io, Instant::now()),

                () = sleep_until_deadline(deadline) => self.handle_timeout(Instant::now()),
            }
        }

        self.close_manager(Instant::now());
        self.publish_status();
        debug!(uri = %self.base, "Manager event loop terminated");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .next_deadline()
            .into_iter()
            .chain(self.engine.as_ref().and_then(Engine::next_deadline))
            .chain(self.retired.iter().filter_map(Engine::next_deadline))
            .chain(self.sockets.values().filter_map(NamespaceSocket::next_deadline))
            .min()
    }

    fn publish_status(&self) {
        let mut status = self.shared.status.lock();
        status.state = self.state;
        status.reconnecting = self.reconnecting;
        status.transport = self.engine.as_ref().and_then(Engine::transport_kind);
    }

    fn emit(&self, event: ManagerEvent) {
        self.shared.events.emit(&event);
    }
}

/// Sleeps until `deadline`, or forever without one.
async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// ManagerCore - Dispatch
// ============================================================================

impl ManagerCore {
    fn handle_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::Open { reply } => {
                if let Some(reply) = reply {
                    if self.state == ManagerState::Open {
                        let _ = reply.send(Ok(()));
                        return;
                    }
                    self.open_waiters.push(reply);
                }
                if self.timers.is_set(TimerKey::Reconnect) {
                    debug!("Pending reconnect replaced by explicit open");
                    self.timers.clear(TimerKey::Reconnect);
                    self.reconnecting = false;
                }
                self.open_engine(OpenOrigin::Caller, now);
            }
            Command::Close => self.close_manager(now),
            Command::CancelUpgrade => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.cancel_upgrade(now);
                }
            }
            Command::CreateSocket {
                nsp,
                shared,
                options,
            } => {
                self.sockets
                    .entry(nsp)
                    .or_insert_with(|| NamespaceSocket::new(shared, options));
            }
            Command::SocketConnect { nsp } => self.connect_socket(&nsp, now),
            Command::SocketDisconnect { nsp } => {
                self.with_socket(&nsp, now, |socket, link, outbox| socket.disconnect(link, outbox));
            }
            Command::SendConnect { nsp, auth } => {
                if self.state == ManagerState::Open
                    && self.sockets.get(&nsp).is_some_and(NamespaceSocket::is_active)
                {
                    self.with_socket(&nsp, now, |socket, link, outbox| {
                        socket.send_connect(Some(auth), link, outbox);
                    });
                }
            }
            Command::Emit { nsp, emission } => {
                self.with_socket(&nsp, now, |socket, link, outbox| {
                    socket.emit(emission, link, outbox);
                });
            }
            Command::Ack { nsp, id, args } => {
                self.with_socket(&nsp, now, |socket, _, outbox| socket.send_ack(id, args, outbox));
            }
        }
        self.drain_engine(now);
    }

    fn handle_io(&mut self, id: TransportId, io: IoEvent, now: Instant) {
        if let Some(engine) = self.engine.as_mut()
            && engine.owns(id)
        {
            engine.handle_io(id, io, now);
        } else if let Some(engine) = self.retired.iter_mut().find(|e| e.owns(id)) {
            engine.handle_io(id, io, now);
        } else {
            trace!(transport = %id, "Dropping completion for a closed engine");
        }
        self.drain_engine(now);
    }

    fn handle_timeout(&mut self, now: Instant) {
        if let Some(engine) = self.engine.as_mut() {
            engine.handle_timeout(now);
        }
        for engine in &mut self.retired {
            engine.handle_timeout(now);
        }
        self.drain_engine(now);

        for key in self.timers.expired(now) {
            match key {
                TimerKey::ConnectTimeout => self.on_connect_timeout(now),
                TimerKey::Reconnect => self.on_reconnect_timer(now),
            }
        }

        let due: Vec<String> = self
            .sockets
            .iter()
            .filter(|(_, socket)| socket.next_deadline().is_some_and(|at| at <= now))
            .map(|(nsp, _)| nsp.clone())
            .collect();
        for nsp in due {
            self.with_socket(&nsp, now, |socket, link, outbox| socket.handle_timeout(link, outbox));
        }
        self.drain_engine(now);
    }
}

// ============================================================================
// ManagerCore - Namespaces
// ============================================================================

impl ManagerCore {
    fn link(&self, now: Instant) -> Link {
        Link {
            now,
            writable: self.engine.as_ref().is_some_and(Engine::is_writable),
            version: self.engine_options.version,
            engine_sid: self
                .engine
                .as_ref()
                .and_then(Engine::session_id)
                .map(|sid| sid.as_str().to_string()),
            commands: self.commands.clone(),
        }
    }

    /// Runs `f` against one namespace, then carries out its outbox.
    fn with_socket(
        &mut self,
        nsp: &str,
        now: Instant,
        f: impl FnOnce(&mut NamespaceSocket, &Link, &mut Outbox),
    ) {
        let link = self.link(now);
        let mut outbox = Outbox::default();
        let Some(socket) = self.sockets.get_mut(nsp) else {
            warn!(nsp, "Unknown namespace");
            return;
        };
        f(socket, &link, &mut outbox);
        self.apply_outbox(nsp, outbox, now);
    }

    fn apply_outbox(&mut self, nsp: &str, outbox: Outbox, now: Instant) {
        let Outbox {
            packets,
            auth,
            destroyed,
        } = outbox;

        for packet in packets {
            self.write_packet(&packet, now);
        }

        if let Some(provider) = auth {
            let commands = self.commands.clone();
            let nsp = nsp.to_string();
            tokio::spawn(async move {
                let auth = provider.auth().await;
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(Command::SendConnect { nsp, auth });
                }
            });
        }

        if destroyed {
            self.maybe_destroy(now);
        }
    }

    fn active_namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sockets
            .iter()
            .filter(|(_, socket)| socket.is_active())
            .map(|(nsp, _)| nsp.clone())
            .collect();
        names.sort_unstable();
        names
    }

    fn connect_socket(&mut self, nsp: &str, now: Instant) {
        let Some(socket) = self.sockets.get_mut(nsp) else {
            warn!(nsp, "Unknown namespace");
            return;
        };
        if socket.is_connected() {
            return;
        }
        socket.activate();

        if !self.reconnecting {
            self.open_engine(OpenOrigin::Auto, now);
        }
        if self.state == ManagerState::Open {
            self.with_socket(nsp, now, |socket, link, outbox| socket.on_open(link, outbox));
        }
    }

    /// Closes the connection once no namespace is active.
    fn maybe_destroy(&mut self, now: Instant) {
        if self.sockets.values().any(NamespaceSocket::is_active) {
            return;
        }
        debug!("No active namespace left, closing");
        self.close_manager(now);
    }

    /// Encodes a packet onto the engine.
    fn write_packet(&mut self, packet: &EventPacket, now: Instant) {
        let Some(engine) = self.engine.as_mut() else {
            trace!(nsp = %packet.nsp, "Dropping packet without a connection");
            return;
        };
        for frame in self.encoder.encode(packet) {
            engine.write(frame, now);
        }
    }
}

// ============================================================================
// ManagerCore - Opening
// ============================================================================

impl ManagerCore {
    fn open_engine(&mut self, origin: OpenOrigin, now: Instant) {
        if matches!(self.state, ManagerState::Opening | ManagerState::Open) {
            if origin == OpenOrigin::Caller && self.open_origin == OpenOrigin::Auto {
                self.open_origin = OpenOrigin::Caller;
            }
            return;
        }

        debug!(uri = %self.base, ?origin, "Opening connection");
        self.state = ManagerState::Opening;
        self.skip_reconnect = false;
        self.open_origin = origin;

        let mut engine = Engine::new(
            self.base.clone(),
            Arc::clone(&self.engine_options),
            Arc::clone(&self.factory),
            self.io_tx.clone(),
            Arc::clone(&self.prior_websocket_success),
        );
        if let Err(e) = engine.open(now) {
            self.on_open_failed(e, now);
            return;
        }
        self.engine = Some(engine);

        if let Some(timeout) = self.shared.options.timeout {
            self.timers.set(TimerKey::ConnectTimeout, now + timeout);
        }
    }

    fn on_open(&mut self, now: Instant) {
        info!(uri = %self.base, "Connection open");
        self.timers.clear(TimerKey::ConnectTimeout);
        self.decoder.reset();
        self.state = ManagerState::Open;
        self.publish_status();
        self.emit(ManagerEvent::Open);

        for nsp in self.active_namespaces() {
            self.with_socket(&nsp, now, |socket, link, outbox| socket.on_open(link, outbox));
        }

        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        if self.open_origin == OpenOrigin::Reconnect {
            let attempts = self.backoff.attempts();
            self.reconnecting = false;
            self.backoff.reset();
            info!(attempts, "Reconnected");
            self.emit(ManagerEvent::Reconnect(attempts));
        }
    }

    /// The engine failed or closed before its handshake completed.
    fn on_open_failed(&mut self, error: Error, now: Instant) {
        warn!(error = %error, "Connection failed to open");
        self.timers.clear(TimerKey::ConnectTimeout);
        if let Some(mut engine) = self.engine.take() {
            engine.fail(CloseReason::ForcedClose, None);
        }
        self.decoder.reset();
        self.state = ManagerState::Closed;
        self.publish_status();

        for nsp in self.active_namespaces() {
            if let Some(socket) = self.sockets.get(&nsp) {
                socket.on_error(&error);
            }
        }
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(error.duplicate()));
        }

        self.emit(ManagerEvent::Error(error.duplicate()));

        match self.open_origin {
            OpenOrigin::Reconnect => {
                self.reconnecting = false;
                self.reconnect(now);
                self.emit(ManagerEvent::ReconnectError(error));
            }
            OpenOrigin::Caller => {}
            OpenOrigin::Auto => {
                if self.shared.options.reconnection
                    && !self.reconnecting
                    && self.backoff.attempts() == 0
                {
                    self.reconnect(now);
                }
            }
        }
    }

    fn on_connect_timeout(&mut self, now: Instant) {
        if self.state != ManagerState::Opening {
            return;
        }
        let timeout_ms = self
            .shared
            .options
            .timeout
            .map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self.on_open_failed(Error::connection_timeout(timeout_ms), now);
    }
}

// ============================================================================
// ManagerCore - Engine Events
// ============================================================================

impl ManagerCore {
    /// Handles everything the engines queued.
    fn drain_engine(&mut self, now: Instant) {
        while let Some(event) = self.engine.as_mut().and_then(Engine::poll_event) {
            self.on_engine_event(event, now);
        }

        self.retired.retain_mut(|engine| {
            while engine.poll_event().is_some() {}
            engine.state() != EngineState::Closed
        });
    }

    fn on_engine_event(&mut self, event: EngineEvent, now: Instant) {
        if self.state == ManagerState::Opening {
            match event {
                EngineEvent::Open => self.on_open(now),
                EngineEvent::Error(error) => self.on_open_failed(error, now),
                EngineEvent::Close {
                    reason,
                    description,
                } => {
                    let error = Error::transport(reason.as_str(), description);
                    self.on_open_failed(error, now);
                }
                other => trace!(event = ?other, "Ignoring engine event while opening"),
            }
            return;
        }

        match event {
            EngineEvent::Message(frame) => self.on_data(frame, now),
            EngineEvent::Ping => self.emit(ManagerEvent::Ping),
            EngineEvent::Upgrade(kind) => self.emit(ManagerEvent::Upgrade(kind)),
            EngineEvent::Upgrading(kind) => debug!(transport = %kind, "Upgrading"),
            EngineEvent::UpgradeError(error) => debug!(error = %error, "Upgrade failed"),
            EngineEvent::Error(error) => {
                for nsp in self.active_namespaces() {
                    if let Some(socket) = self.sockets.get(&nsp) {
                        socket.on_error(&error);
                    }
                }
                self.emit(ManagerEvent::Error(error));
            }
            EngineEvent::Close {
                reason,
                description,
            } => {
                self.engine = None;
                self.on_close(reason, description, now);
            }
            EngineEvent::Open | EngineEvent::Drain => {}
        }
    }

    fn on_data(&mut self, frame: Frame, now: Instant) {
        match self.decoder.add(frame) {
            Ok(Some(packet)) => self.on_decoded(packet, now),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Undecodable packet");
                if let Some(engine) = self.engine.as_mut() {
                    engine.fail(CloseReason::ParseError, Some(e.to_string()));
                }
            }
        }
    }

    fn on_decoded(&mut self, packet: EventPacket, now: Instant) {
        trace!(nsp = %packet.nsp, packet_type = %packet.packet_type(), "Packet decoded");
        if !self.shared.events.is_empty() {
            self.emit(ManagerEvent::Packet(packet.clone()));
        }

        let nsp = packet.nsp.clone();
        if !self.sockets.get(&nsp).is_some_and(NamespaceSocket::is_active) {
            debug!(nsp = %nsp, "Packet for an inactive namespace");
            return;
        }
        self.with_socket(&nsp, now, |socket, link, outbox| socket.on_packet(packet, link, outbox));
    }
}

// ============================================================================
// ManagerCore - Closing and Reconnection
// ============================================================================

impl ManagerCore {
    fn on_close(&mut self, reason: CloseReason, description: Option<String>, now: Instant) {
        info!(%reason, description = ?description, "Connection closed");
        self.timers.clear_all();
        self.decoder.reset();
        self.backoff.reset();
        self.state = ManagerState::Closed;
        self.publish_status();
        self.emit(ManagerEvent::Close {
            reason,
            description,
        });

        for nsp in self.active_namespaces() {
            self.with_socket(&nsp, now, |socket, link, outbox| socket.on_close(reason, link, outbox));
        }

        if self.shared.options.reconnection && !self.skip_reconnect {
            self.reconnect(now);
        }
    }

    fn reconnect(&mut self, now: Instant) {
        if self.reconnecting || self.skip_reconnect {
            return;
        }

        let attempts = self.backoff.attempts();
        if let Some(max) = self.shared.options.reconnection_attempts
            && attempts >= max
        {
            warn!(attempts, "Reconnection failed");
            self.backoff.reset();
            self.emit(ManagerEvent::ReconnectFailed(Error::reconnect_exhausted(attempts)));
            self.reconnecting = false;
            return;
        }

        let delay = self.backoff.duration();
        self.reconnecting = true;
        self.timers.set(TimerKey::Reconnect, now + delay);
        debug!(
            attempt = attempts + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnect scheduled"
        );
    }

    fn on_reconnect_timer(&mut self, now: Instant) {
        if self.skip_reconnect {
            return;
        }
        let attempt = self.backoff.attempts();
        debug!(attempt, "Attempting reconnect");
        self.emit(ManagerEvent::ReconnectAttempt(attempt));
        self.open_engine(OpenOrigin::Reconnect, now);
    }

    /// Closes the connection and stops reconnecting.
    fn close_manager(&mut self, now: Instant) {
        debug!("Closing manager");
        self.skip_reconnect = true;
        self.reconnecting = false;
        self.timers.clear(TimerKey::Reconnect);

        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }

        if self.state != ManagerState::Closed {
            self.on_close(CloseReason::ForcedClose, None, now);
        }

        if let Some(mut engine) = self.engine.take() {
            engine.close(now);
            while engine.poll_event().is_some() {}
            if engine.state() != EngineState::Closed {
                self.retired.push(engine);
            }
        }
    }
}
