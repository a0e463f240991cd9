//! Engine connection.
//!
//! The engine owns exactly one active transport. It performs the handshake,
//! keeps the heartbeat, buffers writes until the transport is writable, and
//! probes for a better transport once the session is open.
//!
//! The engine is a synchronous state machine. It never sleeps: callers feed
//! it transport completions and the current time, ask for the next deadline,
//! and drain [`EngineEvent`]s.
//!
//! # Upgrade
//!
//! ```text
//! probe opening ──open──► ping "probe" ──pong "probe"──► pause active
//!                                                            │
//!                       swap, send upgrade, flush ◄──paused──┘
//! ```
//!
//! A probe that fails, closes, times out or is cancelled is discarded and
//! the active transport stays as it was.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `options` | [`EngineOptions`] |

// ============================================================================
// Submodules
// ============================================================================

/// Engine configuration.
pub mod options;

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::{SessionId, TransportId};
use crate::protocol::{Frame, Handshake, Packet, PacketType};
use crate::transport::{
    IoEvent, IoSender, Transport, TransportContext, TransportEvent, TransportFactory,
    TransportKind,
};

// ============================================================================
// Re-exports
// ============================================================================

pub use options::EngineOptions;

// ============================================================================
// CloseReason
// ============================================================================

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Closed locally.
    ForcedClose,
    /// The transport closed.
    TransportClose,
    /// The transport failed.
    TransportError,
    /// No packet arrived within the heartbeat window.
    PingTimeout,
    /// A frame could not be decoded.
    ParseError,
    /// The server disconnected the namespace.
    IoServerDisconnect,
    /// The namespace was disconnected locally.
    IoClientDisconnect,
}

impl CloseReason {
    /// Wire-compatible description.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ForcedClose => "forced close",
            Self::TransportClose => "transport close",
            Self::TransportError => "transport error",
            Self::PingTimeout => "ping timeout",
            Self::ParseError => "parse error",
            Self::IoServerDisconnect => "io server disconnect",
            Self::IoClientDisconnect => "io client disconnect",
        }
    }

    /// Returns `true` if the application asked for the disconnect.
    #[inline]
    #[must_use]
    pub const fn is_deliberate(self) -> bool {
        matches!(
            self,
            Self::ForcedClose | Self::IoServerDisconnect | Self::IoClientDisconnect
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// EngineState
// ============================================================================

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Created, not yet opened.
    Idle,
    /// Waiting for the handshake.
    Opening,
    /// Handshake completed.
    Open,
    /// Close requested, waiting for writes or an upgrade to finish.
    Closing,
    /// Finished.
    Closed,
}

// ============================================================================
// EngineEvent
// ============================================================================

/// Notification from the engine to its owner.
#[derive(Debug)]
pub enum EngineEvent {
    /// Handshake completed.
    Open,
    /// A message packet arrived.
    Message(Frame),
    /// A heartbeat exchange completed.
    Ping,
    /// The write buffer is empty.
    Drain,
    /// A probe answered and the active transport is pausing.
    Upgrading(TransportKind),
    /// The probe replaced the active transport.
    Upgrade(TransportKind),
    /// A probe failed and was discarded.
    UpgradeError(Error),
    /// The connection failed. Always followed by [`EngineEvent::Close`].
    Error(Error),
    /// The connection closed.
    Close {
        /// Why it closed.
        reason: CloseReason,
        /// Transport-level detail, if any.
        description: Option<String>,
    },
}

// ============================================================================
// Session
// ============================================================================

/// Parameters negotiated by the handshake.
#[derive(Debug, Clone)]
struct Session {
    sid: SessionId,
    upgrades: Vec<TransportKind>,
    ping_interval: Duration,
    ping_timeout: Duration,
    max_payload: usize,
}

impl Session {
    fn heartbeat_window(&self) -> Duration {
        self.ping_interval + self.ping_timeout
    }
}

// ============================================================================
// Probe
// ============================================================================

/// Progress of an upgrade probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbePhase {
    /// Transport connecting.
    Opening,
    /// Ping sent, waiting for the matching pong.
    AwaitingPong,
    /// Pong received, waiting for the active transport to pause.
    Pausing,
}

/// One in-flight upgrade attempt.
#[derive(Debug)]
struct Probe {
    transport: Box<dyn Transport>,
    phase: ProbePhase,
    deadline: Instant,
    held: Vec<Packet>,
}

/// Deferred close step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseAfter {
    Drain,
    Upgrade,
}

// ============================================================================
// Engine
// ============================================================================

/// One engine session over an upgradable transport.
pub struct Engine {
    base: Url,
    options: Arc<EngineOptions>,
    factory: Arc<dyn TransportFactory>,
    io_tx: IoSender,
    prior_websocket_success: Arc<AtomicBool>,

    state: EngineState,
    session: Option<Session>,
    transport: Option<Box<dyn Transport>>,
    probes: Vec<Probe>,
    upgrading: bool,
    close_after: Option<CloseAfter>,

    write_buffer: Vec<Packet>,
    prev_len: usize,

    heartbeat_at: Option<Instant>,
    ping_at: Option<Instant>,

    events: VecDeque<EngineEvent>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("transport", &self.transport_kind())
            .field("probes", &self.probes.len())
            .field("buffered", &self.write_buffer.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Engine - Construction
// ============================================================================

impl Engine {
    /// Creates an idle engine for `base`.
    ///
    /// `prior_websocket_success` is shared by the engines of one owner and
    /// drives [`EngineOptions::remember_upgrade`].
    #[must_use]
    pub fn new(
        base: Url,
        options: Arc<EngineOptions>,
        factory: Arc<dyn TransportFactory>,
        io_tx: IoSender,
        prior_websocket_success: Arc<AtomicBool>,
    ) -> Self {
        Self {
            base,
            options,
            factory,
            io_tx,
            prior_websocket_success,
            state: EngineState::Idle,
            session: None,
            transport: None,
            probes: Vec::new(),
            upgrading: false,
            close_after: None,
            write_buffer: Vec::new(),
            prev_len: 0,
            heartbeat_at: None,
            ping_at: None,
            events: VecDeque::new(),
        }
    }

    /// Starts the first transport.
    ///
    /// # Errors
    ///
    /// - [`Error::NoTransports`] if no transport is configured
    pub fn open(&mut self, now: Instant) -> Result<()> {
        let remembered = self.options.remember_upgrade
            && self.prior_websocket_success.load(Ordering::SeqCst)
            && self.options.transports.contains(&TransportKind::WebSocket);

        let kind = if remembered {
            TransportKind::WebSocket
        } else {
            *self.options.transports.first().ok_or(Error::NoTransports)?
        };

        debug!(transport = %kind, base = %self.base, "Opening engine");
        self.state = EngineState::Opening;

        let mut transport = self.create_transport(kind);
        transport.open();
        self.transport = Some(transport);
        self.pump_active(now);
        Ok(())
    }

    fn create_transport(&self, kind: TransportKind) -> Box<dyn Transport> {
        let context = TransportContext {
            base: self.base.clone(),
            options: Arc::clone(&self.options),
            session_id: self.session.as_ref().map(|s| s.sid.clone()),
            io_tx: self.io_tx.clone(),
        };
        self.factory.create(kind, context)
    }
}

// ============================================================================
// Engine - Accessors
// ============================================================================

impl Engine {
    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Session id, once the handshake completed.
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session.as_ref().map(|s| &s.sid)
    }

    /// Variant of the active transport.
    #[inline]
    #[must_use]
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.transport.as_ref().map(|t| t.kind())
    }

    /// Returns `true` if the active transport would accept a write now.
    #[inline]
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_writable())
    }

    /// Returns `true` while an upgrade swap is pending.
    #[inline]
    #[must_use]
    pub fn is_upgrading(&self) -> bool {
        self.upgrading
    }

    /// Returns `true` if `id` belongs to the active transport or a probe.
    #[must_use]
    pub fn owns(&self, id: TransportId) -> bool {
        self.transport.as_ref().is_some_and(|t| t.id() == id)
            || self.probes.iter().any(|p| p.transport.id() == id)
    }

    /// Earliest instant at which [`Engine::handle_timeout`] has work.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.probes
            .iter()
            .map(|p| p.deadline)
            .chain(self.heartbeat_at)
            .chain(self.ping_at)
            .min()
    }

    /// Pops the next pending notification.
    #[inline]
    pub fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }
}

// ============================================================================
// Engine - Input
// ============================================================================

impl Engine {
    /// Applies an I/O completion for one of this engine's transports.
    pub fn handle_io(&mut self, id: TransportId, event: IoEvent, now: Instant) {
        if let Some(transport) = self.transport.as_mut()
            && transport.id() == id
        {
            transport.handle_io(event);
            self.pump_active(now);
            return;
        }

        if let Some(probe) = self.probes.iter_mut().find(|p| p.transport.id() == id) {
            probe.transport.handle_io(event);
            self.pump_probe(id, now);
            return;
        }

        trace!(transport = %id, "Dropping completion for a discarded transport");
    }

    /// Fires every deadline that has passed.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.heartbeat_at.is_some_and(|at| at <= now) {
            warn!(sid = ?self.session_id().map(SessionId::as_str), "Heartbeat timed out");
            self.on_close(CloseReason::PingTimeout, None);
            return;
        }

        if self.ping_at.is_some_and(|at| at <= now) {
            self.ping_at = None;
            if let Some(session) = &self.session {
                self.heartbeat_at = Some(now + session.ping_timeout);
            }
            self.send_packet(Packet::new(PacketType::Ping));
        }

        let expired: Vec<TransportId> = self
            .probes
            .iter()
            .filter(|p| p.deadline <= now)
            .map(|p| p.transport.id())
            .collect();
        for id in expired {
            self.fail_probe(id, "probe error: timeout");
        }

        self.pump_active(now);
    }

    /// Queues a message packet.
    pub fn write(&mut self, data: impl Into<Frame>, now: Instant) {
        self.send_packet(Packet::message(data));
        self.pump_active(now);
    }

    /// Closes the connection once buffered writes and any pending upgrade
    /// have completed.
    pub fn close(&mut self, now: Instant) {
        if !matches!(self.state, EngineState::Opening | EngineState::Open) {
            return;
        }

        self.state = EngineState::Closing;
        if !self.write_buffer.is_empty() {
            self.close_after = Some(CloseAfter::Drain);
        } else if self.upgrading {
            self.close_after = Some(CloseAfter::Upgrade);
        } else {
            self.on_close(CloseReason::ForcedClose, None);
        }
        self.pump_active(now);
    }

    /// Closes immediately with `reason`, discarding buffered writes.
    pub fn fail(&mut self, reason: CloseReason, description: Option<String>) {
        self.on_close(reason, description);
    }

    /// Discards every in-flight probe.
    pub fn cancel_upgrade(&mut self, now: Instant) {
        let ids: Vec<TransportId> = self.probes.iter().map(|p| p.transport.id()).collect();
        for id in ids {
            self.fail_probe(id, "probe error: cancelled");
        }
        self.pump_active(now);
    }
}

// ============================================================================
// Engine - Active Transport
// ============================================================================

impl Engine {
    /// Drains notifications from whichever transport is active.
    fn pump_active(&mut self, now: Instant) {
        loop {
            let Some(event) = self.transport.as_mut().and_then(|t| t.next_event()) else {
                return;
            };
            self.on_transport_event(event, now);
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Open => trace!("Transport open"),
            TransportEvent::Packet(packet) => self.on_packet(packet, now),
            TransportEvent::Drain => self.on_drain(),
            TransportEvent::Paused => self.complete_upgrade(now),
            TransportEvent::Close => self.on_close(CloseReason::TransportClose, None),
            TransportEvent::Error(e) => self.on_error(e),
        }
    }

    fn on_packet(&mut self, packet: Packet, now: Instant) {
        if !matches!(
            self.state,
            EngineState::Opening | EngineState::Open | EngineState::Closing
        ) {
            return;
        }

        trace!(packet_type = packet.kind.as_str(), "Packet received");
        if let Some(session) = &self.session {
            self.heartbeat_at = Some(now + session.heartbeat_window());
        }

        match packet.kind {
            PacketType::Open => match Handshake::parse(packet.text().unwrap_or_default()) {
                Ok(handshake) => self.on_handshake(handshake, now),
                Err(e) => {
                    warn!(error = %e, "Invalid handshake");
                    self.on_close(CloseReason::ParseError, Some(e.to_string()));
                }
            },
            PacketType::Ping => {
                self.send_packet(Packet::new(PacketType::Pong));
                self.events.push_back(EngineEvent::Ping);
            }
            PacketType::Pong => {
                if !self.options.version.server_pings()
                    && let Some(session) = &self.session
                {
                    self.ping_at = Some(now + session.ping_interval);
                    self.events.push_back(EngineEvent::Ping);
                }
            }
            PacketType::Error => {
                let code = packet.text().unwrap_or_default().to_string();
                self.on_error(Error::server(code));
            }
            PacketType::Message => {
                let data = packet.data.unwrap_or_else(|| Frame::Text(String::new()));
                self.events.push_back(EngineEvent::Message(data));
            }
            PacketType::Close | PacketType::Upgrade | PacketType::Noop => {}
        }
    }

    fn on_handshake(&mut self, handshake: Handshake, now: Instant) {
        let Some(active) = self.transport_kind() else {
            return;
        };

        let upgrades = handshake
            .upgrades
            .iter()
            .filter_map(|name| TransportKind::from_name(name))
            .filter(|kind| self.options.transports.contains(kind) && *kind != active)
            .collect();

        let session = Session {
            sid: SessionId::new(handshake.sid),
            upgrades,
            ping_interval: Duration::from_millis(handshake.ping_interval),
            ping_timeout: Duration::from_millis(handshake.ping_timeout),
            max_payload: usize::try_from(handshake.max_payload).unwrap_or(usize::MAX),
        };

        info!(sid = %session.sid, transport = %active, "Handshake complete");

        if let Some(transport) = self.transport.as_mut() {
            transport.set_session_id(session.sid.clone());
        }
        self.heartbeat_at = Some(now + session.heartbeat_window());
        if !self.options.version.server_pings() {
            self.ping_at = Some(now + session.ping_interval);
        }
        let upgrades = session.upgrades.clone();
        self.session = Some(session);

        self.state = EngineState::Open;
        self.prior_websocket_success
            .store(active == TransportKind::WebSocket, Ordering::SeqCst);
        self.events.push_back(EngineEvent::Open);
        self.flush();

        if self.state == EngineState::Open
            && self.options.upgrade
            && active == TransportKind::Polling
        {
            for kind in upgrades {
                self.probe(kind, now);
            }
        }
    }

    fn on_drain(&mut self) {
        let sent = self.prev_len.min(self.write_buffer.len());
        self.write_buffer.drain(..sent);
        self.prev_len = 0;

        if !self.write_buffer.is_empty() {
            self.flush();
            return;
        }

        self.events.push_back(EngineEvent::Drain);
        if self.close_after == Some(CloseAfter::Drain) {
            if self.upgrading {
                self.close_after = Some(CloseAfter::Upgrade);
            } else {
                self.on_close(CloseReason::ForcedClose, None);
            }
        }
    }

    fn on_error(&mut self, error: Error) {
        warn!(error = %error, "Engine error");
        self.prior_websocket_success.store(false, Ordering::SeqCst);
        let description = error.to_string();
        self.events.push_back(EngineEvent::Error(error));
        self.on_close(CloseReason::TransportError, Some(description));
    }

    /// Full teardown. Idempotent.
    fn on_close(&mut self, reason: CloseReason, description: Option<String>) {
        if !matches!(
            self.state,
            EngineState::Opening | EngineState::Open | EngineState::Closing
        ) {
            return;
        }

        debug!(%reason, sid = ?self.session_id().map(SessionId::as_str), "Engine closed");

        self.heartbeat_at = None;
        self.ping_at = None;
        self.close_after = None;
        self.upgrading = false;
        for mut probe in self.probes.drain(..) {
            probe.transport.close();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }

        self.state = EngineState::Closed;
        self.session = None;
        self.events.push_back(EngineEvent::Close {
            reason,
            description,
        });
        self.write_buffer.clear();
        self.prev_len = 0;
    }

    fn send_packet(&mut self, packet: Packet) {
        if matches!(self.state, EngineState::Closing | EngineState::Closed) {
            trace!(packet_type = packet.kind.as_str(), "Dropping packet on closing engine");
            return;
        }
        self.write_buffer.push(packet);
        self.flush();
    }

    fn flush(&mut self) {
        if self.state == EngineState::Closed
            || self.upgrading
            || self.write_buffer.is_empty()
            || !self.is_writable()
        {
            return;
        }

        let packets = self.writable_packets();
        self.prev_len = packets.len();
        if let Some(transport) = self.transport.as_mut() {
            transport.send(packets);
        }
    }

    /// Leading packets that fit the polling payload budget.
    ///
    /// The first packet is always included.
    fn writable_packets(&self) -> Vec<Packet> {
        let max_payload = self.session.as_ref().map_or(0, |s| s.max_payload);
        let budgeted = max_payload > 0
            && self.transport_kind() == Some(TransportKind::Polling)
            && self.write_buffer.len() > 1;
        if !budgeted {
            return self.write_buffer.clone();
        }

        let mut size = 1;
        for (i, packet) in self.write_buffer.iter().enumerate() {
            size += packet.byte_length();
            if i > 0 && size > max_payload {
                return self.write_buffer[..i].to_vec();
            }
            size += 2;
        }
        self.write_buffer.clone()
    }
}

// ============================================================================
// Engine - Upgrade Probes
// ============================================================================

impl Engine {
    fn probe(&mut self, kind: TransportKind, now: Instant) {
        debug!(transport = %kind, "Probing");
        self.prior_websocket_success.store(false, Ordering::SeqCst);

        let mut transport = self.create_transport(kind);
        let id = transport.id();
        transport.open();
        self.probes.push(Probe {
            transport,
            phase: ProbePhase::Opening,
            deadline: now + self.options.probe_timeout,
            held: Vec::new(),
        });
        self.pump_probe(id, now);
    }

    /// Drains notifications from probe `id`, following it if it becomes
    /// the active transport.
    fn pump_probe(&mut self, id: TransportId, now: Instant) {
        loop {
            let Some(probe) = self.probes.iter_mut().find(|p| p.transport.id() == id) else {
                if self.transport.as_ref().is_some_and(|t| t.id() == id) {
                    self.pump_active(now);
                }
                return;
            };
            let Some(event) = probe.transport.next_event() else {
                return;
            };
            self.on_probe_event(id, event, now);
        }
    }

    fn on_probe_event(&mut self, id: TransportId, event: TransportEvent, now: Instant) {
        let Some(index) = self.probes.iter().position(|p| p.transport.id() == id) else {
            return;
        };

        match event {
            TransportEvent::Open => {
                let probe = &mut self.probes[index];
                if probe.phase == ProbePhase::Opening {
                    trace!(transport = %probe.transport.kind(), "Probe open, sending ping");
                    probe
                        .transport
                        .send(vec![Packet::with_data(PacketType::Ping, "probe")]);
                    probe.phase = ProbePhase::AwaitingPong;
                }
            }
            TransportEvent::Packet(packet) => match self.probes[index].phase {
                ProbePhase::AwaitingPong => {
                    if packet.kind == PacketType::Pong && packet.text() == Some("probe") {
                        self.begin_upgrade(id, now);
                    } else {
                        self.fail_probe(id, "probe error");
                    }
                }
                ProbePhase::Pausing => self.probes[index].held.push(packet),
                ProbePhase::Opening => {}
            },
            TransportEvent::Error(e) => self.fail_probe(id, &format!("probe error: {e}")),
            TransportEvent::Close => self.fail_probe(id, "probe error: transport closed"),
            TransportEvent::Drain | TransportEvent::Paused => {}
        }
    }

    /// The probe answered; pause the active transport.
    fn begin_upgrade(&mut self, id: TransportId, now: Instant) {
        let Some(index) = self.probes.iter().position(|p| p.transport.id() == id) else {
            return;
        };
        let kind = self.probes[index].transport.kind();
        debug!(transport = %kind, "Probe succeeded, pausing active transport");

        self.upgrading = true;
        self.probes[index].phase = ProbePhase::Pausing;
        self.events.push_back(EngineEvent::Upgrading(kind));
        self.prior_websocket_success
            .store(kind == TransportKind::WebSocket, Ordering::SeqCst);

        let others: Vec<TransportId> = self
            .probes
            .iter()
            .map(|p| p.transport.id())
            .filter(|other| *other != id)
            .collect();
        for other in others {
            self.discard_probe(other);
        }

        if let Some(transport) = self.transport.as_mut() {
            transport.pause();
        }
        self.pump_active(now);
    }

    /// The active transport paused; swap in the winning probe.
    fn complete_upgrade(&mut self, now: Instant) {
        if !self.upgrading || self.state == EngineState::Closed {
            return;
        }
        let Some(index) = self
            .probes
            .iter()
            .position(|p| p.phase == ProbePhase::Pausing)
        else {
            return;
        };

        let Probe {
            mut transport,
            held,
            ..
        } = self.probes.remove(index);
        let kind = transport.kind();

        transport.send(vec![Packet::new(PacketType::Upgrade)]);
        // The paused transport is dropped without a close packet; the
        // session lives on over the new one.
        self.transport = Some(transport);
        self.upgrading = false;
        info!(transport = %kind, "Upgraded");
        self.events.push_back(EngineEvent::Upgrade(kind));

        for packet in held {
            self.on_packet(packet, now);
        }
        self.flush();

        if self.close_after == Some(CloseAfter::Upgrade) {
            self.on_close(CloseReason::ForcedClose, None);
        }
    }

    fn fail_probe(&mut self, id: TransportId, message: &str) {
        let Some(index) = self.probes.iter().position(|p| p.transport.id() == id) else {
            return;
        };
        let mut probe = self.probes.remove(index);
        let kind = probe.transport.kind();
        debug!(transport = %kind, message, "Probe failed");
        probe.transport.close();

        self.events
            .push_back(EngineEvent::UpgradeError(Error::probe(kind.as_str(), message)));

        if probe.phase == ProbePhase::Pausing {
            self.upgrading = false;
            if let Some(transport) = self.transport.as_mut() {
                transport.resume();
            }
            if self.close_after == Some(CloseAfter::Upgrade) {
                self.on_close(CloseReason::ForcedClose, None);
                return;
            }
            self.flush();
        }
    }

    /// Drops a probe without reporting it.
    fn discard_probe(&mut self, id: TransportId) {
        if let Some(index) = self.probes.iter().position(|p| p.transport.id() == id) {
            let mut probe = self.probes.remove(index);
            probe.transport.close();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    use crate::protocol::ProtocolVersion;
    use crate::transport::mock::{Method, MockPeer, MockPolling, MockRequest, MockStreaming};
    use crate::transport::{IoReceiver, IoTransportFactory};

    const POLLING_HANDSHAKE: &str = r#"0{"sid":"abc","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;

    struct Harness {
        engine: Engine,
        io_rx: IoReceiver,
        polls: mpsc::UnboundedReceiver<MockRequest>,
        peers: mpsc::UnboundedReceiver<MockPeer>,
        events: Vec<EngineEvent>,
    }

    impl Harness {
        fn new(options: EngineOptions) -> Self {
            let (polling, polls) = MockPolling::new();
            let (streaming, peers) = MockStreaming::new();
            let factory = IoTransportFactory::new(Arc::new(polling), Arc::new(streaming));
            let (io_tx, io_rx) = mpsc::unbounded_channel();
            let engine = Engine::new(
                Url::parse("http://localhost/").unwrap(),
                Arc::new(options),
                Arc::new(factory),
                io_tx,
                Arc::new(AtomicBool::new(false)),
            );
            Self {
                engine,
                io_rx,
                polls,
                peers,
                events: Vec::new(),
            }
        }

        fn collect(&mut self) {
            while let Some(event) = self.engine.poll_event() {
                self.events.push(event);
            }
        }

        /// Applies the next I/O completion.
        async fn step(&mut self, now: Instant) {
            let (id, io) = self.io_rx.recv().await.unwrap();
            self.engine.handle_io(id, io, now);
            self.collect();
        }

        /// Applies completions until `done` holds.
        async fn step_until(&mut self, now: Instant, done: impl Fn(&Self) -> bool) {
            while !done(self) {
                self.step(now).await;
            }
        }

        /// Opens a polling session that advertises a websocket upgrade.
        async fn open_polling(&mut self, now: Instant) {
            self.engine.open(now).unwrap();
            let request = self.polls.recv().await.unwrap();
            assert_eq!(request.method, Method::Get);
            request.reply_text(POLLING_HANDSHAKE);
            self.step_until(now, |h| h.engine.state() == EngineState::Open)
                .await;
        }

        /// Opens a websocket-only session.
        async fn open_websocket(&mut self, now: Instant, handshake: &str) -> MockPeer {
            self.engine.open(now).unwrap();
            let peer = self.peers.recv().await.unwrap();
            self.step(now).await;
            peer.send_text(handshake);
            self.step_until(now, |h| h.engine.state() == EngineState::Open)
                .await;
            peer
        }

        fn has_close(&self, expected: CloseReason) -> bool {
            self.events
                .iter()
                .any(|e| matches!(e, EngineEvent::Close { reason, .. } if *reason == expected))
        }
    }

    fn websocket_only() -> EngineOptions {
        EngineOptions::new().with_transports([TransportKind::WebSocket])
    }

    #[tokio::test]
    async fn test_heartbeat_window() {
        let mut h = Harness::new(websocket_only());
        let t0 = Instant::now();
        let _peer = h
            .open_websocket(
                t0,
                r#"0{"sid":"s","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":100}"#,
            )
            .await;
        assert!(matches!(h.events[0], EngineEvent::Open));
        assert_eq!(h.engine.next_deadline(), Some(t0 + Duration::from_millis(45_000)));

        h.engine.handle_timeout(t0 + Duration::from_millis(44_999));
        h.collect();
        assert_eq!(h.engine.state(), EngineState::Open);

        h.engine.handle_timeout(t0 + Duration::from_millis(45_000));
        h.collect();
        assert_eq!(h.engine.state(), EngineState::Closed);
        assert!(h.has_close(CloseReason::PingTimeout));
    }

    #[tokio::test]
    async fn test_ping_answered_and_rearms_heartbeat() {
        let mut h = Harness::new(websocket_only());
        let t0 = Instant::now();
        let mut peer = h
            .open_websocket(
                t0,
                r#"0{"sid":"s","upgrades":[],"pingInterval":100,"pingTimeout":50,"maxPayload":100}"#,
            )
            .await;

        let later = t0 + Duration::from_millis(120);
        peer.send_text("2");
        h.step(later).await;

        assert_eq!(peer.recv_text().await.as_deref(), Some("3"));
        assert!(h.events.iter().any(|e| matches!(e, EngineEvent::Ping)));
        assert_eq!(h.engine.next_deadline(), Some(later + Duration::from_millis(150)));
    }

    #[tokio::test]
    async fn test_legacy_client_pings() {
        let mut h = Harness::new(websocket_only().with_version(ProtocolVersion::V3));
        let t0 = Instant::now();
        let mut peer = h
            .open_websocket(
                t0,
                r#"0{"sid":"s","upgrades":[],"pingInterval":100,"pingTimeout":50}"#,
            )
            .await;
        assert_eq!(h.engine.next_deadline(), Some(t0 + Duration::from_millis(100)));

        let ping_time = t0 + Duration::from_millis(100);
        h.engine.handle_timeout(ping_time);
        assert_eq!(peer.recv_text().await.as_deref(), Some("2"));
        assert_eq!(h.engine.next_deadline(), Some(ping_time + Duration::from_millis(50)));

        h.step(ping_time).await;
        peer.send_text("3");
        h.step(ping_time).await;
        assert!(h.events.iter().any(|e| matches!(e, EngineEvent::Ping)));
        assert_eq!(h.engine.state(), EngineState::Open);
    }

    #[tokio::test]
    async fn test_upgrade_swaps_transport() {
        let mut h = Harness::new(EngineOptions::new());
        let now = Instant::now();
        h.open_polling(now).await;
        assert_eq!(h.engine.transport_kind(), Some(TransportKind::Polling));

        let mut peer = h.peers.recv().await.unwrap();
        assert!(peer.url.query().unwrap().contains("sid=abc"));
        h.step_until(now, |h| !h.engine.probes.is_empty() && h.engine.probes[0].phase == ProbePhase::AwaitingPong)
            .await;
        assert_eq!(peer.recv_text().await.as_deref(), Some("2probe"));

        // Probe write completion, then the pong.
        h.step(now).await;
        peer.send_text("3probe");
        h.step_until(now, |h| h.engine.is_upgrading()).await;

        // The active poll is still in flight; answering it lets the pause finish.
        h.polls.recv().await.unwrap().reply_text("6");
        h.step_until(now, |h| h.engine.transport_kind() == Some(TransportKind::WebSocket))
            .await;

        assert_eq!(peer.recv_text().await.as_deref(), Some("5"));
        assert!(!h.engine.is_upgrading());
        assert!(h
            .events
            .iter()
            .any(|e| matches!(e, EngineEvent::Upgrade(TransportKind::WebSocket))));

        h.step(now).await;
        h.engine.write("hello", now);
        assert_eq!(peer.recv_text().await.as_deref(), Some("4hello"));
    }

    #[tokio::test]
    async fn test_cancelled_probe_keeps_polling_writable() {
        let mut h = Harness::new(EngineOptions::new());
        let now = Instant::now();
        h.open_polling(now).await;
        let _peer = h.peers.recv().await.unwrap();

        h.engine.cancel_upgrade(now);
        h.collect();

        assert_eq!(h.engine.transport_kind(), Some(TransportKind::Polling));
        assert!(h.engine.is_writable());
        assert!(h.engine.probes.is_empty());
        assert!(h
            .events
            .iter()
            .any(|e| matches!(e, EngineEvent::UpgradeError(Error::Probe { .. }))));

        h.engine.write("still here", now);
        let post = loop {
            let request = h.polls.recv().await.unwrap();
            if request.method == Method::Post {
                break request;
            }
        };
        assert_eq!(post.body, Some(Frame::from("4still here")));
    }

    #[tokio::test]
    async fn test_wrong_pong_fails_probe() {
        let mut h = Harness::new(EngineOptions::new());
        let now = Instant::now();
        h.open_polling(now).await;
        let peer = h.peers.recv().await.unwrap();
        h.step_until(now, |h| h.engine.probes.first().is_some_and(|p| p.phase == ProbePhase::AwaitingPong))
            .await;

        peer.send_text("3nope");
        h.step_until(now, |h| h.engine.probes.is_empty()).await;

        assert_eq!(h.engine.transport_kind(), Some(TransportKind::Polling));
        assert!(h.events.iter().any(|e| matches!(e, EngineEvent::UpgradeError(_))));
        assert_eq!(h.engine.state(), EngineState::Open);
    }

    #[tokio::test]
    async fn test_probe_closed_while_pausing_resumes_active() {
        let mut h = Harness::new(EngineOptions::new());
        let now = Instant::now();
        h.open_polling(now).await;
        let peer = h.peers.recv().await.unwrap();
        h.step_until(now, |h| h.engine.probes.first().is_some_and(|p| p.phase == ProbePhase::AwaitingPong))
            .await;

        peer.send_text("3probe");
        h.step_until(now, |h| h.engine.is_upgrading()).await;
        peer.close();
        h.step_until(now, |h| !h.engine.is_upgrading()).await;

        assert_eq!(h.engine.transport_kind(), Some(TransportKind::Polling));
        assert_eq!(h.engine.state(), EngineState::Open);
        assert!(h.engine.is_writable());
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let mut h = Harness::new(EngineOptions::new().with_probe_timeout(Duration::from_secs(1)));
        let now = Instant::now();
        h.open_polling(now).await;

        h.engine.handle_timeout(now + Duration::from_secs(1));
        h.collect();
        assert!(h.engine.probes.is_empty());
        assert!(h.events.iter().any(|e| matches!(
            e,
            EngineEvent::UpgradeError(Error::Probe { message, .. }) if message.contains("timeout")
        )));
        assert_eq!(h.engine.state(), EngineState::Open);
    }

    #[tokio::test]
    async fn test_payload_budget_splits_batches() {
        let handshake = r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":8}"#;
        let mut h = Harness::new(EngineOptions::new());
        let now = Instant::now();
        h.engine.open(now).unwrap();
        h.polls.recv().await.unwrap().reply_text(handshake);
        h.step_until(now, |h| h.engine.state() == EngineState::Open).await;

        h.engine.write("aaaaa", now);
        h.engine.write("bbbbb", now);
        h.engine.write("ccccc", now);

        let mut bodies = Vec::new();
        let mut held_polls = Vec::new();
        while bodies.len() < 3 {
            let request = h.polls.recv().await.unwrap();
            if request.method == Method::Get {
                held_polls.push(request);
                continue;
            }
            bodies.push(request.body.clone());
            request.reply_ok();
            // The drain flushes the next batch straight away.
            h.step(now).await;
        }

        assert_eq!(
            bodies,
            [
                Some(Frame::from("4aaaaa")),
                Some(Frame::from("4bbbbb")),
                Some(Frame::from("4ccccc")),
            ]
        );
    }

    #[tokio::test]
    async fn test_close_waits_for_drain() {
        let mut h = Harness::new(websocket_only());
        let now = Instant::now();
        let mut peer = h
            .open_websocket(
                now,
                r#"0{"sid":"s","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":100}"#,
            )
            .await;

        h.engine.write("a", now);
        h.engine.write("b", now);
        h.engine.close(now);
        h.collect();
        assert_eq!(h.engine.state(), EngineState::Closing);
        assert!(!h.has_close(CloseReason::ForcedClose));

        assert_eq!(peer.recv_text().await.as_deref(), Some("4a"));
        h.step_until(now, |h| h.engine.state() == EngineState::Closed).await;
        assert_eq!(peer.recv_text().await.as_deref(), Some("4b"));
        assert!(h.has_close(CloseReason::ForcedClose));
    }

    #[tokio::test]
    async fn test_server_error_packet_closes() {
        let mut h = Harness::new(websocket_only());
        let now = Instant::now();
        let peer = h
            .open_websocket(
                now,
                r#"0{"sid":"s","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":100}"#,
            )
            .await;

        peer.send_text("x");
        h.step_until(now, |h| h.engine.state() == EngineState::Closed).await;

        assert!(h.events.iter().any(|e| matches!(e, EngineEvent::Error(Error::Server { .. }))));
        assert!(h.has_close(CloseReason::TransportError));
    }

    #[tokio::test]
    async fn test_invalid_handshake_is_parse_error() {
        let mut h = Harness::new(websocket_only());
        let now = Instant::now();
        h.engine.open(now).unwrap();
        let peer = h.peers.recv().await.unwrap();
        h.step(now).await;

        peer.send_text("0{not json");
        h.step_until(now, |h| h.engine.state() == EngineState::Closed).await;
        assert!(h.has_close(CloseReason::ParseError));
    }

    #[tokio::test]
    async fn test_remember_upgrade_starts_on_websocket() {
        let mut h = Harness::new(EngineOptions::new().with_remember_upgrade());
        h.engine.prior_websocket_success.store(true, Ordering::SeqCst);
        h.engine.open(Instant::now()).unwrap();
        assert_eq!(h.engine.transport_kind(), Some(TransportKind::WebSocket));
    }

    #[test]
    fn test_no_transports() {
        let (io_tx, _io_rx) = mpsc::unbounded_channel();
        let mut engine = Engine::new(
            Url::parse("http://localhost/").unwrap(),
            Arc::new(EngineOptions::new().with_transports([])),
            Arc::new(IoTransportFactory::new(
                Arc::new(MockPolling::new().0),
                Arc::new(MockStreaming::new().0),
            )),
            io_tx,
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(engine.open(Instant::now()), Err(Error::NoTransports)));
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::PingTimeout.to_string(), "ping timeout");
        assert_eq!(CloseReason::IoServerDisconnect.to_string(), "io server disconnect");
        assert!(CloseReason::IoClientDisconnect.is_deliberate());
        assert!(!CloseReason::TransportClose.is_deliberate());
    }
}
