//! Namespace state machine.
//!
//! Runs on the manager's event loop. Every entry point receives a [`Link`]
//! describing the shared connection and an [`Outbox`] collecting what the
//! loop must do afterwards: packets to write, an auth provider to consult,
//! or the namespace going inactive.
//!
//! # Acknowledgements
//!
//! ```text
//! emit ──► acks[id] ──ack packet──► callback(Ok(args))
//!             │
//!             └──timeout──► callback(Err(AckTimeout))
//! ```
//!
//! In retry mode emissions wait in a queue. Only the head is in flight;
//! it keeps its id on every attempt and is given up after `retries + 1`
//! attempts.

// ============================================================================
// Imports
// ============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::engine::CloseReason;
use crate::error::{Error, Result};
use crate::identifiers::AckId;
use crate::manager::Command;
use crate::manager::timers::Timers;
use crate::protocol::{DEFAULT_NAMESPACE, EventPacket, PacketKind, Payload, ProtocolVersion};

use super::options::{Auth, AuthProvider, SocketOptions};
use super::{AckCallback, AckResponder, Emission, EventMessage, SocketEvent, SocketShared};

// ============================================================================
// Constants
// ============================================================================

/// Reported when a legacy server answers a current client.
const LEGACY_SERVER_MESSAGE: &str = "It seems you are trying to reach a Socket.IO server in v2.x with a v3.x client, but they are not compatible (more information here: https://socket.io/docs/v3/migrating-from-2-x-to-3-0/)";

// ============================================================================
// Link / Outbox
// ============================================================================

/// View of the shared connection at the time of a call.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    pub(crate) now: Instant,
    pub(crate) writable: bool,
    pub(crate) version: ProtocolVersion,
    pub(crate) engine_sid: Option<String>,
    pub(crate) commands: WeakUnboundedSender<Command>,
}

/// Work produced by a call, carried out by the event loop.
#[derive(Default)]
pub(crate) struct Outbox {
    /// Packets to write, in order.
    pub(crate) packets: Vec<EventPacket>,
    /// Provider whose answer becomes the CONNECT payload.
    pub(crate) auth: Option<Arc<dyn AuthProvider>>,
    /// The namespace stopped participating.
    pub(crate) destroyed: bool,
}

// ============================================================================
// Pending Acknowledgements
// ============================================================================

/// Entry in the acknowledgement table.
enum PendingAck {
    /// A plain emit waiting for its callback.
    User {
        callback: AckCallback,
        timeout: Option<Duration>,
    },
    /// The retry-queue head; the queue entry holds the callback.
    Queued { timeout: Option<Duration> },
}

/// An emission waiting in the retry queue.
struct QueuedEmit {
    id: u64,
    event: String,
    args: Vec<Payload>,
    ack: Option<AckCallback>,
    timeout: Option<Duration>,
    try_count: u32,
    pending: bool,
}

fn millis(duration: Option<Duration>) -> u64 {
    duration.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// ============================================================================
// NamespaceSocket
// ============================================================================

/// State of one namespace.
pub(crate) struct NamespaceSocket {
    shared: Arc<SocketShared>,
    options: SocketOptions,

    active: bool,
    connected: bool,
    id: Option<String>,
    pid: Option<String>,
    last_offset: Option<String>,
    recovered: bool,

    receive_buffer: Vec<EventMessage>,
    send_buffer: Vec<EventPacket>,

    next_id: u64,
    acks: FxHashMap<u64, PendingAck>,
    ack_timers: Timers<u64>,
    queue: VecDeque<QueuedEmit>,
}

impl NamespaceSocket {
    pub(crate) fn new(shared: Arc<SocketShared>, options: SocketOptions) -> Self {
        Self {
            shared,
            options,
            active: false,
            connected: false,
            id: None,
            pid: None,
            last_offset: None,
            recovered: false,
            receive_buffer: Vec::new(),
            send_buffer: Vec::new(),
            next_id: 0,
            acks: FxHashMap::default(),
            ack_timers: Timers::default(),
            queue: VecDeque::new(),
        }
    }

    #[inline]
    pub(crate) fn nsp(&self) -> &str {
        &self.shared.nsp
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    #[inline]
    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    /// Earliest acknowledgement deadline.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.ack_timers.next_deadline()
    }

    fn publish(&self) {
        let mut status = self.shared.status.lock();
        status.id.clone_from(&self.id);
        status.connected = self.connected;
        status.active = self.active;
        status.recovered = self.recovered;
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

// ============================================================================
// NamespaceSocket - Connecting
// ============================================================================

impl NamespaceSocket {
    /// Marks the namespace as wanting a connection.
    pub(crate) fn activate(&mut self) {
        self.active = true;
        self.publish();
    }

    /// The shared connection opened; request the namespace.
    pub(crate) fn on_open(&mut self, link: &Link, outbox: &mut Outbox) {
        match &self.options.auth {
            Some(Auth::Provider(provider)) if link.version == ProtocolVersion::V4 => {
                outbox.auth = Some(Arc::clone(provider));
            }
            Some(Auth::Static(auth)) => {
                let auth = auth.clone();
                self.send_connect(Some(auth), link, outbox);
            }
            _ => self.send_connect(None, link, outbox),
        }
    }

    /// Queues the CONNECT packet carrying `auth` and any recovery state.
    pub(crate) fn send_connect(&mut self, auth: Option<Payload>, link: &Link, outbox: &mut Outbox) {
        if link.version == ProtocolVersion::V3 {
            if self.nsp() != DEFAULT_NAMESPACE {
                outbox.packets.push(EventPacket::connect(self.nsp(), None));
            }
            return;
        }

        let data = match &self.pid {
            Some(pid) => {
                let mut merged = BTreeMap::new();
                merged.insert("pid".to_string(), Payload::from(pid.as_str()));
                merged.insert(
                    "offset".to_string(),
                    self.last_offset.as_deref().map_or(Payload::Null, Payload::from),
                );
                if let Some(Payload::Object(fields)) = auth {
                    merged.extend(fields);
                }
                Some(Payload::Object(merged))
            }
            None => auth,
        };

        debug!(nsp = %self.nsp(), recovering = self.pid.is_some(), "Requesting namespace");
        outbox.packets.push(EventPacket::connect(self.nsp(), data));
    }

    fn on_connect(&mut self, id: String, pid: Option<String>, link: &Link, outbox: &mut Outbox) {
        self.recovered = pid.is_some() && self.pid == pid;
        self.pid = pid;
        debug!(nsp = %self.nsp(), id = %id, recovered = self.recovered, "Namespace connected");

        self.id = Some(id);
        self.connected = true;
        self.emit_buffered(outbox);
        self.publish();
        self.shared.lifecycle.emit(&SocketEvent::Connect);
        self.drain_queue(true, link, outbox);
    }

    /// Replays events received and emitted before the connect completed.
    fn emit_buffered(&mut self, outbox: &mut Outbox) {
        for message in std::mem::take(&mut self.receive_buffer) {
            self.emit_event(&message);
        }
        for packet in std::mem::take(&mut self.send_buffer) {
            self.write(packet, outbox);
        }
    }

    /// The shared connection failed.
    pub(crate) fn on_error(&self, error: &Error) {
        if !self.connected {
            self.shared
                .lifecycle
                .emit(&SocketEvent::ConnectError(error.duplicate()));
        }
    }
}

// ============================================================================
// NamespaceSocket - Disconnecting
// ============================================================================

impl NamespaceSocket {
    /// Leaves the namespace at the application's request.
    pub(crate) fn disconnect(&mut self, link: &Link, outbox: &mut Outbox) {
        let was_connected = self.connected;
        if was_connected {
            outbox.packets.push(EventPacket::disconnect(self.nsp()));
        }
        self.destroy(outbox);
        if was_connected {
            self.on_close(CloseReason::IoClientDisconnect, link, outbox);
        }
    }

    /// Stops participating in the shared connection.
    fn destroy(&mut self, outbox: &mut Outbox) {
        self.active = false;
        outbox.destroyed = true;
        self.publish();
    }

    /// The namespace or the shared connection closed.
    pub(crate) fn on_close(&mut self, reason: CloseReason, link: &Link, outbox: &mut Outbox) {
        debug!(nsp = %self.nsp(), %reason, "Namespace disconnected");
        self.connected = false;
        self.id = None;
        self.publish();
        self.shared.lifecycle.emit(&SocketEvent::Disconnect(reason));
        self.clear_acks(link, outbox);
    }

    /// Fails acknowledgements whose packets already left.
    ///
    /// Entries whose packets are still buffered survive to the next connect.
    fn clear_acks(&mut self, link: &Link, outbox: &mut Outbox) {
        let mut ids: Vec<u64> = self
            .acks
            .keys()
            .copied()
            .filter(|id| !self.send_buffer.iter().any(|p| p.id() == Some(*id)))
            .collect();
        ids.sort_unstable();

        for id in ids {
            self.ack_timers.clear(id);
            match self.acks.remove(&id) {
                Some(PendingAck::User { callback, .. }) => callback(Err(Error::ConnectionClosed)),
                Some(PendingAck::Queued { .. }) => {
                    self.on_queued_result(id, Err(Error::ConnectionClosed), link, outbox);
                }
                None => {}
            }
        }
    }
}

// ============================================================================
// NamespaceSocket - Emitting
// ============================================================================

impl NamespaceSocket {
    /// Sends, buffers, queues or drops an emission.
    pub(crate) fn emit(&mut self, emission: Emission, link: &Link, outbox: &mut Outbox) {
        let Emission {
            event,
            args,
            ack,
            flags,
        } = emission;
        let timeout = flags.timeout.or(self.options.ack_timeout);

        if self.options.retries > 0 && !flags.volatile {
            let id = self.allocate_id();
            self.queue.push_back(QueuedEmit {
                id,
                event,
                args,
                ack,
                timeout,
                try_count: 0,
                pending: false,
            });
            self.drain_queue(false, link, outbox);
            return;
        }

        if flags.volatile && !(link.writable && self.connected) {
            trace!(nsp = %self.nsp(), event = %event, "Discarding volatile packet");
            if let Some(ack) = ack {
                ack(Err(Error::ConnectionClosed));
            }
            return;
        }

        let id = ack.is_some().then(|| self.allocate_id());
        if let (Some(id), Some(callback)) = (id, ack) {
            self.acks.insert(id, PendingAck::User { callback, timeout });
            if let Some(timeout) = timeout {
                self.ack_timers.set(id, link.now + timeout);
            }
        }

        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Payload::String(event));
        data.extend(args);
        let packet = EventPacket::event(self.nsp(), id, data);

        if self.connected {
            self.write(packet, outbox);
        } else {
            trace!(nsp = %self.nsp(), "Buffering packet until connected");
            self.send_buffer.push(packet);
        }
    }

    /// Queues a packet for the wire, notifying outgoing listeners of events.
    fn write(&self, packet: EventPacket, outbox: &mut Outbox) {
        if !self.shared.any_outgoing.is_empty()
            && let PacketKind::Event { data, .. } = &packet.kind
            && let Some((name, args)) = data.split_first()
        {
            let message = EventMessage::new(
                name.as_str().unwrap_or_default().to_string(),
                args.to_vec(),
                None,
            );
            self.shared.any_outgoing.emit(&message);
        }
        outbox.packets.push(packet);
    }

    /// Sends the head of the retry queue if nothing is in flight.
    fn drain_queue(&mut self, force: bool, link: &Link, outbox: &mut Outbox) {
        if !self.connected {
            return;
        }
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        if head.pending && !force {
            return;
        }

        head.pending = true;
        head.try_count += 1;
        let id = head.id;
        let timeout = head.timeout;
        trace!(nsp = %self.shared.nsp, id, attempt = head.try_count, "Sending queued packet");

        let mut data = Vec::with_capacity(head.args.len() + 1);
        data.push(Payload::String(head.event.clone()));
        data.extend(head.args.iter().cloned());
        let packet = EventPacket::event(self.shared.nsp.as_str(), Some(id), data);

        self.acks.insert(id, PendingAck::Queued { timeout });
        self.ack_timers.clear(id);
        if let Some(timeout) = timeout {
            self.ack_timers.set(id, link.now + timeout);
        }
        self.write(packet, outbox);
    }

    /// Settles an attempt of the queue head.
    fn on_queued_result(
        &mut self,
        id: u64,
        result: Result<Vec<Payload>>,
        link: &Link,
        outbox: &mut Outbox,
    ) {
        let retries = self.options.retries;
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        if head.id != id {
            return;
        }

        let settled = match result {
            Ok(args) => Some(Ok(args)),
            Err(e) if head.try_count > retries => {
                debug!(nsp = %self.shared.nsp, id, attempts = head.try_count, "Giving up on queued packet");
                Some(Err(e))
            }
            Err(e) => {
                trace!(nsp = %self.shared.nsp, id, error = %e, "Queued packet will be retried");
                head.pending = false;
                None
            }
        };

        if let Some(result) = settled
            && let Some(entry) = self.queue.pop_front()
            && let Some(ack) = entry.ack
        {
            ack(result);
        }

        self.drain_queue(false, link, outbox);
    }

    /// Queues an acknowledgement for a received event.
    pub(crate) fn send_ack(&self, id: u64, args: Vec<Payload>, outbox: &mut Outbox) {
        outbox.packets.push(EventPacket::ack(self.nsp(), id, args));
    }
}

// ============================================================================
// NamespaceSocket - Receiving
// ============================================================================

impl NamespaceSocket {
    /// Handles a packet addressed to this namespace.
    pub(crate) fn on_packet(&mut self, packet: EventPacket, link: &Link, outbox: &mut Outbox) {
        match packet.kind {
            PacketKind::Connect(data) => {
                let field = |name: &str| {
                    data.as_ref()
                        .and_then(|d| d.get(name))
                        .and_then(Payload::as_str)
                        .map(str::to_string)
                };
                if let Some(sid) = field("sid") {
                    self.on_connect(sid, field("pid"), link, outbox);
                } else if link.version == ProtocolVersion::V3 {
                    let engine_sid = link.engine_sid.clone().unwrap_or_default();
                    let id = if self.nsp() == DEFAULT_NAMESPACE {
                        engine_sid
                    } else {
                        format!("{}#{engine_sid}", self.nsp())
                    };
                    self.on_connect(id, None, link, outbox);
                } else {
                    warn!(nsp = %self.nsp(), "CONNECT without sid");
                    self.shared
                        .lifecycle
                        .emit(&SocketEvent::ConnectError(Error::connect(LEGACY_SERVER_MESSAGE, None)));
                }
            }
            PacketKind::Event { id, data } => self.on_event(id, data, link),
            PacketKind::Ack { id, data } => self.on_ack(id, data, link, outbox),
            PacketKind::Disconnect => {
                debug!(nsp = %self.nsp(), "Server disconnected namespace");
                self.destroy(outbox);
                self.on_close(CloseReason::IoServerDisconnect, link, outbox);
            }
            PacketKind::ConnectError(payload) => {
                self.destroy(outbox);
                let (message, data) = match &payload {
                    Payload::String(message) => (message.clone(), None),
                    other => (
                        other
                            .get("message")
                            .and_then(Payload::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        other.get("data").and_then(Payload::to_json),
                    ),
                };
                warn!(nsp = %self.nsp(), message = %message, "Namespace refused");
                self.shared
                    .lifecycle
                    .emit(&SocketEvent::ConnectError(Error::connect(message, data)));
            }
        }
    }

    fn on_event(&mut self, id: Option<u64>, mut data: Vec<Payload>, link: &Link) {
        if data.is_empty() {
            return;
        }
        let event = event_name(data.remove(0));
        let responder = id.map(|id| AckResponder::new(self.nsp().to_string(), id, link.commands.clone()));
        let message = EventMessage::new(event, data, responder);

        if self.connected {
            self.emit_event(&message);
        } else {
            trace!(nsp = %self.nsp(), "Buffering event until connected");
            self.receive_buffer.push(message);
        }
    }

    fn emit_event(&mut self, message: &EventMessage) {
        self.shared.any.emit(message);
        if let Some(handlers) = self.shared.handlers_for(message.event()) {
            handlers.emit(message);
        }
        if self.pid.is_some()
            && let Some(Payload::String(offset)) = message.args().last()
        {
            self.last_offset = Some(offset.clone());
        }
    }

    fn on_ack(&mut self, id: u64, args: Vec<Payload>, link: &Link, outbox: &mut Outbox) {
        self.ack_timers.clear(id);
        match self.acks.remove(&id) {
            Some(PendingAck::User { callback, .. }) => callback(Ok(args)),
            Some(PendingAck::Queued { .. }) => self.on_queued_result(id, Ok(args), link, outbox),
            None => debug!(nsp = %self.nsp(), id, "Ignoring unknown acknowledgement"),
        }
    }

    /// Fires expired acknowledgement timers.
    pub(crate) fn handle_timeout(&mut self, link: &Link, outbox: &mut Outbox) {
        for id in self.ack_timers.expired(link.now) {
            match self.acks.remove(&id) {
                Some(PendingAck::User { callback, timeout }) => {
                    debug!(nsp = %self.nsp(), id, "Acknowledgement timed out");
                    self.send_buffer.retain(|p| p.id() != Some(id));
                    callback(Err(Error::ack_timeout(AckId::new(id), millis(timeout))));
                }
                Some(PendingAck::Queued { timeout }) => {
                    let error = Error::ack_timeout(AckId::new(id), millis(timeout));
                    self.on_queued_result(id, Err(error), link, outbox);
                }
                None => {}
            }
        }
    }
}

/// Event name for dispatch. Non-string names are keyed by their JSON text,
/// so `2[1]` reaches handlers registered for `"1"`.
fn event_name(name: Payload) -> String {
    match name {
        Payload::String(name) => name,
        other => other
            .to_json()
            .map_or_else(|| String::from("[binary]"), |value| value.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::manager::Command;
    use crate::protocol::{Decoder, Encoder, Frame};
    use crate::socket::EmitFlags;

    type Results = Arc<Mutex<Vec<Result<Vec<Payload>>>>>;

    struct Fixture {
        socket: NamespaceSocket,
        shared: Arc<SocketShared>,
        link: Link,
        commands: mpsc::UnboundedReceiver<Command>,
        _tx: mpsc::UnboundedSender<Command>,
    }

    impl Fixture {
        fn new(nsp: &str, options: SocketOptions) -> Self {
            let (tx, commands) = mpsc::unbounded_channel();
            let shared = Arc::new(SocketShared::new(nsp));
            let mut socket = NamespaceSocket::new(Arc::clone(&shared), options);
            socket.activate();
            let link = Link {
                now: Instant::now(),
                writable: true,
                version: ProtocolVersion::V4,
                engine_sid: Some("engine".into()),
                commands: tx.downgrade(),
            };
            Self {
                socket,
                shared,
                link,
                commands,
                _tx: tx,
            }
        }

        /// Runs `f` and returns the wire text of every packet it wrote.
        fn run(&mut self, f: impl FnOnce(&mut NamespaceSocket, &Link, &mut Outbox)) -> Vec<String> {
            let mut outbox = Outbox::default();
            f(&mut self.socket, &self.link, &mut outbox);
            outbox
                .packets
                .iter()
                .map(|p| match Encoder::new().encode(p).remove(0) {
                    crate::protocol::Frame::Text(text) => text,
                    crate::protocol::Frame::Binary(_) => String::from("<binary>"),
                })
                .collect()
        }

        fn receive(&mut self, json: serde_json::Value) -> Vec<String> {
            let packet = decode(json);
            self.run(|s, l, o| s.on_packet(packet, l, o))
        }

        fn connect(&mut self) -> Vec<String> {
            self.receive(json!({"connect": {"sid": "s1"}}))
        }

        fn emit(&mut self, event: &str, args: Vec<Payload>, results: Option<&Results>) -> Vec<String> {
            self.emit_with(event, args, results, EmitFlags::default())
        }

        fn emit_with(
            &mut self,
            event: &str,
            args: Vec<Payload>,
            results: Option<&Results>,
            flags: EmitFlags,
        ) -> Vec<String> {
            let ack = results.map(|results| {
                let results = Arc::clone(results);
                Box::new(move |r| results.lock().push(r)) as AckCallback
            });
            let emission = Emission {
                event: event.into(),
                args,
                ack,
                flags,
            };
            self.run(|s, l, o| s.emit(emission, l, o))
        }

        fn advance(&mut self, by: Duration) -> Vec<String> {
            self.link.now += by;
            self.run(|s, l, o| s.handle_timeout(l, o))
        }
    }

    /// Builds a packet from a compact description.
    fn decode(json: serde_json::Value) -> EventPacket {
        let (kind, value) = json
            .as_object()
            .and_then(|o| o.iter().next())
            .map(|(k, v)| (k.clone(), v.clone()))
            .unwrap();
        let payload = |v: serde_json::Value| Payload::from(v);
        let kind = match kind.as_str() {
            "connect" => PacketKind::Connect(Some(payload(value))),
            "ack" => PacketKind::Ack {
                id: value["id"].as_u64().unwrap(),
                data: value["data"].as_array().unwrap().iter().cloned().map(payload).collect(),
            },
            "event" => PacketKind::Event {
                id: value["id"].as_u64(),
                data: value["data"].as_array().unwrap().iter().cloned().map(payload).collect(),
            },
            "disconnect" => PacketKind::Disconnect,
            "connect_error" => PacketKind::ConnectError(payload(value)),
            other => panic!("unknown kind {other}"),
        };
        EventPacket::new("/", kind)
    }

    fn results() -> Results {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn lifecycle(shared: &SocketShared) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        shared.lifecycle.add(move |event| {
            s.lock().push(match event {
                SocketEvent::Connect => "connect".to_string(),
                SocketEvent::ConnectError(e) => format!("connect_error: {e}"),
                SocketEvent::Disconnect(reason) => format!("disconnect: {reason}"),
            });
        });
        seen
    }

    #[test]
    fn test_connect_packet_with_auth() {
        let mut f = Fixture::new("/", SocketOptions::new().with_auth(json!({"token": "abc"})));
        let sent = f.run(|s, l, o| s.on_open(l, o));
        assert_eq!(sent, [r#"0{"token":"abc"}"#]);
    }

    #[test]
    fn test_emit_before_connect_is_buffered_in_order() {
        let mut f = Fixture::new("/", SocketOptions::new());
        assert!(f.emit("msg", vec![Payload::from(json!({"a": 1}))], None).is_empty());

        let seen = lifecycle(&f.shared);
        let sent = f.connect();
        assert_eq!(sent, [r#"2["msg",{"a":1}]"#]);
        assert_eq!(*seen.lock(), ["connect"]);
        assert!(f.socket.is_connected());
        assert_eq!(f.shared.status.lock().id.as_deref(), Some("s1"));

        let sent = f.emit("after", vec![], None);
        assert_eq!(sent, [r#"2["after"]"#]);
    }

    #[test]
    fn test_ack_called_once() {
        let mut f = Fixture::new("/", SocketOptions::new());
        f.connect();
        let results = results();

        let sent = f.emit("foo", vec![], Some(&results));
        assert_eq!(sent, [r#"20["foo"]"#]);

        f.receive(json!({"ack": {"id": 0, "data": [42]}}));
        f.receive(json!({"ack": {"id": 0, "data": [43]}}));

        let results = results.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &vec![Payload::from(42)]);
    }

    #[test]
    fn test_ack_timeout() {
        let mut f = Fixture::new("/", SocketOptions::new());
        f.connect();
        let results = results();
        let flags = EmitFlags {
            volatile: false,
            timeout: Some(Duration::from_millis(500)),
        };
        f.emit_with("slow", vec![], Some(&results), flags);

        f.advance(Duration::from_millis(499));
        assert!(results.lock().is_empty());
        f.advance(Duration::from_millis(1));
        assert!(matches!(
            results.lock()[0],
            Err(Error::AckTimeout { timeout_ms: 500, .. })
        ));

        // A late acknowledgement is ignored.
        f.receive(json!({"ack": {"id": 0, "data": []}}));
        assert_eq!(results.lock().len(), 1);
    }

    #[test]
    fn test_retry_queue_reuses_id() {
        let options = SocketOptions::new()
            .with_retries(2)
            .with_ack_timeout(Duration::from_secs(1));
        let mut f = Fixture::new("/", options);
        f.connect();
        let results = results();

        let mut wire = f.emit("job", vec![Payload::from(1)], Some(&results));
        // A second emission waits behind the head.
        wire.extend(f.emit("next", vec![], None));
        wire.extend(f.advance(Duration::from_secs(1)));
        wire.extend(f.advance(Duration::from_secs(1)));
        assert_eq!(wire, [r#"20["job",1]"#, r#"20["job",1]"#, r#"20["job",1]"#]);

        let after = f.receive(json!({"ack": {"id": 0, "data": ["done"]}}));
        assert_eq!(results.lock().len(), 1);
        assert!(results.lock()[0].is_ok());
        assert_eq!(after, [r#"21["next"]"#]);
    }

    #[test]
    fn test_retry_queue_gives_up() {
        let options = SocketOptions::new()
            .with_retries(1)
            .with_ack_timeout(Duration::from_secs(1));
        let mut f = Fixture::new("/", options);
        f.connect();
        let results = results();

        f.emit("job", vec![], Some(&results));
        assert_eq!(f.advance(Duration::from_secs(1)), [r#"20["job"]"#]);
        assert!(f.advance(Duration::from_secs(1)).is_empty());

        let results = results.lock();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::AckTimeout { .. })));
        assert!(f.socket.queue.is_empty());
    }

    #[test]
    fn test_volatile_dropped_when_not_connected() {
        let mut f = Fixture::new("/", SocketOptions::new());
        let flags = EmitFlags {
            volatile: true,
            timeout: None,
        };
        assert!(f.emit_with("tick", vec![], None, flags).is_empty());
        assert!(f.connect().is_empty());

        f.link.writable = false;
        assert!(f.emit_with("tick", vec![], None, flags).is_empty());
        f.link.writable = true;
        assert_eq!(f.emit_with("tick", vec![], None, flags), [r#"2["tick"]"#]);
    }

    #[test]
    fn test_incoming_event_with_numeric_name() {
        let mut f = Fixture::new("/", SocketOptions::new());
        f.connect();
        let any = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&any);
        f.shared.any.add(move |m: &EventMessage| {
            a.lock().push((m.event().to_string(), m.args().to_vec()));
        });
        let named = Arc::new(Mutex::new(0));
        let n = Arc::clone(&named);
        f.shared.handlers.lock().insert(
            "1".into(),
            Arc::new({
                let listeners = crate::emitter::Listeners::new();
                listeners.add(move |_: &EventMessage| *n.lock() += 1);
                listeners
            }),
        );

        let packet = Decoder::new().add(Frame::from(r#"2[1,"x"]"#)).unwrap().unwrap();
        f.run(|s, l, o| s.on_packet(packet, l, o));

        assert_eq!(*any.lock(), [("1".to_string(), vec![Payload::from("x")])]);
        assert_eq!(*named.lock(), 1);
        assert_eq!(event_name(Payload::from(2.5)), "2.5");
        assert_eq!(event_name(Payload::Null), "null");
    }

    #[test]
    fn test_incoming_event_with_responder() {
        let mut f = Fixture::new("/", SocketOptions::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        f.shared.handlers.lock().insert(
            "greet".into(),
            Arc::new({
                let listeners = crate::emitter::Listeners::new();
                listeners.add(move |m: &EventMessage| {
                    s.lock().push(m.arg(0).and_then(Payload::as_str).map(str::to_string));
                    assert!(m.ack(vec![Payload::from("hi")]));
                    assert!(!m.ack(vec![]));
                });
                listeners
            }),
        );

        // Received before the connect: held until then.
        f.receive(json!({"event": {"id": 3, "data": ["greet", "bob"]}}));
        assert!(seen.lock().is_empty());
        f.connect();
        assert_eq!(*seen.lock(), [Some("bob".to_string())]);

        let Ok(Command::Ack { id, args, .. }) = f.commands.try_recv() else {
            panic!("expected ack");
        };
        assert_eq!(id, 3);
        assert_eq!(args, vec![Payload::from("hi")]);
        let sent = f.run(|s, _, o| s.send_ack(id, args, o));
        assert_eq!(sent, [r#"33["hi"]"#]);
    }

    #[test]
    fn test_disconnect_fails_pending_acks() {
        let mut f = Fixture::new("/", SocketOptions::new());
        let seen = lifecycle(&f.shared);
        let buffered = results();
        f.emit("early", vec![], Some(&buffered));
        f.connect();
        let sent = results();
        f.emit("late", vec![], Some(&sent));

        let wire = f.run(|s, l, o| s.disconnect(l, o));
        assert_eq!(wire, ["1"]);
        assert!(!f.socket.is_active());
        assert_eq!(*seen.lock(), ["connect", "disconnect: io client disconnect"]);
        // Both packets were written before the disconnect.
        assert!(matches!(sent.lock()[0], Err(Error::ConnectionClosed)));
        assert!(matches!(buffered.lock()[0], Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_close_keeps_acks_of_buffered_packets() {
        let mut f = Fixture::new("/", SocketOptions::new());
        let buffered = results();
        f.emit("early", vec![], Some(&buffered));
        f.run(|s, l, o| s.on_close(CloseReason::TransportClose, l, o));
        assert!(buffered.lock().is_empty());
        assert_eq!(f.connect(), [r#"20["early"]"#]);
    }

    #[test]
    fn test_server_disconnect() {
        let mut f = Fixture::new("/", SocketOptions::new());
        let seen = lifecycle(&f.shared);
        f.connect();
        let mut outbox = Outbox::default();
        f.socket
            .on_packet(decode(json!({"disconnect": null})), &f.link, &mut outbox);
        assert!(outbox.destroyed);
        assert!(!f.socket.is_active());
        assert_eq!(seen.lock().last().map(String::as_str), Some("disconnect: io server disconnect"));
    }

    #[test]
    fn test_connect_error() {
        let mut f = Fixture::new("/", SocketOptions::new());
        let seen = lifecycle(&f.shared);
        f.receive(json!({"connect_error": {"message": "denied", "data": {"code": 1}}}));
        assert_eq!(*seen.lock(), ["connect_error: Connect error: denied"]);
        assert!(!f.socket.is_active());
    }

    #[test]
    fn test_connect_without_sid_is_rejected_on_current_protocol() {
        let mut f = Fixture::new("/", SocketOptions::new());
        let seen = lifecycle(&f.shared);
        f.receive(json!({"connect": {}}));
        assert!(!f.socket.is_connected());
        assert!(seen.lock()[0].starts_with("connect_error"));
    }

    #[test]
    fn test_legacy_protocol() {
        let mut f = Fixture::new("/admin", SocketOptions::new().with_auth(json!({"t": 1})));
        f.link.version = ProtocolVersion::V3;
        assert_eq!(f.run(|s, l, o| s.on_open(l, o)), ["0/admin,"]);

        let packet = EventPacket::new("/admin", PacketKind::Connect(None));
        f.run(|s, l, o| s.on_packet(packet, l, o));
        assert!(f.socket.is_connected());
        assert_eq!(f.shared.status.lock().id.as_deref(), Some("/admin#engine"));

        let mut root = Fixture::new("/", SocketOptions::new());
        root.link.version = ProtocolVersion::V3;
        assert!(root.run(|s, l, o| s.on_open(l, o)).is_empty());
    }

    #[test]
    fn test_recovery_state_in_connect_payload() {
        let mut f = Fixture::new("/", SocketOptions::new().with_auth(json!({"token": "x"})));
        f.receive(json!({"connect": {"sid": "s1", "pid": "p1"}}));
        assert!(!f.shared.status.lock().recovered);
        f.receive(json!({"event": {"data": ["news", "first", "off-1"]}}));
        f.run(|s, l, o| s.on_close(CloseReason::TransportClose, l, o));

        let sent = f.run(|s, l, o| s.on_open(l, o));
        assert_eq!(sent, [r#"0{"offset":"off-1","pid":"p1","token":"x"}"#]);

        f.receive(json!({"connect": {"sid": "s2", "pid": "p1"}}));
        assert!(f.shared.status.lock().recovered);
    }

    #[test]
    fn test_auth_provider_is_deferred() {
        struct Provider;

        #[async_trait::async_trait]
        impl AuthProvider for Provider {
            async fn auth(&self) -> Payload {
                Payload::Null
            }
        }

        let mut f = Fixture::new("/", SocketOptions::new().with_auth_provider(Arc::new(Provider)));
        let mut outbox = Outbox::default();
        f.socket.on_open(&f.link, &mut outbox);
        assert!(outbox.packets.is_empty());
        assert!(outbox.auth.is_some());
    }

    #[test]
    fn test_outgoing_listener() {
        let mut f = Fixture::new("/", SocketOptions::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        f.shared
            .any_outgoing
            .add(move |m| s.lock().push(m.event().to_string()));

        f.emit("buffered", vec![], None);
        assert!(seen.lock().is_empty());
        f.connect();
        f.emit("direct", vec![], None);
        assert_eq!(*seen.lock(), ["buffered", "direct"]);
    }
}
