//! Persistent duplex transport.
//!
//! Every packet is sent as its own frame. A bridge task owns the provider
//! channel and relays commands out and frames in.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::{SessionId, TransportId};
use crate::protocol::{Frame, Packet, PacketType, decode_packet, encode_packet};

use super::{
    DuplexChannel, DuplexEvent, IoEvent, IoSender, ReadyState, StreamingProvider, TaskSet,
    Transport, TransportContext, TransportEvent, TransportKind,
};

// ============================================================================
// Constants
// ============================================================================

/// Error reported when the channel fails.
const SOCKET_ERROR: &str = "websocket error";

// ============================================================================
// StreamCommand
// ============================================================================

/// Commands for the bridge task.
#[derive(Debug)]
enum StreamCommand {
    /// Send frames, then report completion.
    Write(Vec<Frame>),
    /// Close the channel.
    Close,
}

// ============================================================================
// StreamingTransport
// ============================================================================

/// WebSocket-style transport over a [`StreamingProvider`].
pub struct StreamingTransport {
    id: TransportId,
    context: TransportContext,
    provider: Arc<dyn StreamingProvider>,
    state: ReadyState,
    writable: bool,
    commands: Option<mpsc::UnboundedSender<StreamCommand>>,
    events: VecDeque<TransportEvent>,
    tasks: TaskSet,
}

impl fmt::Debug for StreamingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingTransport")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

impl StreamingTransport {
    /// Creates an unopened transport.
    #[must_use]
    pub fn new(context: TransportContext, provider: Arc<dyn StreamingProvider>) -> Self {
        Self {
            id: TransportId::next(),
            context,
            provider,
            state: ReadyState::Unopened,
            writable: false,
            commands: None,
            events: VecDeque::new(),
            tasks: TaskSet::default(),
        }
    }

    fn on_open(&mut self) {
        self.state = ReadyState::Open;
        self.writable = true;
        self.events.push_back(TransportEvent::Open);
    }

    fn on_drain(&mut self) {
        self.writable = true;
        self.events.push_back(TransportEvent::Drain);
        if self.state == ReadyState::Pausing {
            self.state = ReadyState::Paused;
            self.events.push_back(TransportEvent::Paused);
        }
    }

    fn on_close(&mut self) {
        self.state = ReadyState::Closed;
        self.writable = false;
        self.commands = None;
        self.events.push_back(TransportEvent::Close);
    }

    fn on_error(&mut self, cause: &Error) {
        warn!(transport = %self.id, error = %cause, "{SOCKET_ERROR}");
        self.events.push_back(TransportEvent::Error(Error::transport(
            SOCKET_ERROR,
            Some(cause.to_string()),
        )));
    }
}

// ============================================================================
// Bridge Task
// ============================================================================

/// Connects, then relays until either side closes.
async fn run_bridge(
    id: TransportId,
    provider: Arc<dyn StreamingProvider>,
    url: Url,
    headers: Vec<(String, String)>,
    mut commands: mpsc::UnboundedReceiver<StreamCommand>,
    io_tx: IoSender,
) {
    let DuplexChannel {
        sender,
        mut receiver,
    } = match provider.connect(&url, &headers).await {
        Ok(channel) => channel,
        Err(e) => {
            let _ = io_tx.send((id, IoEvent::Failed(e)));
            return;
        }
    };

    let _ = io_tx.send((id, IoEvent::Connected));

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(StreamCommand::Write(frames)) => {
                    let result: Result<()> = frames
                        .into_iter()
                        .try_for_each(|frame| sender.send(frame).map_err(|_| Error::ConnectionClosed));
                    let _ = io_tx.send((id, IoEvent::Written(result)));
                }
                Some(StreamCommand::Close) | None => {
                    trace!(transport = %id, "Closing duplex channel");
                    break;
                }
            },

            event = receiver.recv() => match event {
                Some(DuplexEvent::Frame(frame)) => {
                    let _ = io_tx.send((id, IoEvent::Received(frame)));
                }
                Some(DuplexEvent::Closed) | None => {
                    let _ = io_tx.send((id, IoEvent::Disconnected));
                    break;
                }
                Some(DuplexEvent::Error(e)) => {
                    let _ = io_tx.send((id, IoEvent::Failed(e)));
                    break;
                }
            },
        }
    }
}

// ============================================================================
// Transport Implementation
// ============================================================================

impl Transport for StreamingTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn ready_state(&self) -> ReadyState {
        self.state
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn supports_binary(&self) -> bool {
        !self.context.options.force_base64
    }

    fn open(&mut self) {
        if self.state != ReadyState::Unopened && self.state != ReadyState::Closed {
            return;
        }

        let url = match self.context.url(TransportKind::WebSocket, self.supports_binary()) {
            Ok(url) => url,
            Err(e) => {
                self.on_error(&e);
                return;
            }
        };

        debug!(transport = %self.id, url = %url, "Opening duplex channel");
        self.state = ReadyState::Opening;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.commands = Some(command_tx);
        self.tasks.push(tokio::spawn(run_bridge(
            self.id,
            Arc::clone(&self.provider),
            url,
            self.context.options.extra_headers.clone(),
            command_rx,
            self.context.io_tx.clone(),
        )));
    }

    fn close(&mut self) {
        if matches!(self.state, ReadyState::Unopened | ReadyState::Closed) {
            return;
        }
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(StreamCommand::Close);
        }
        self.on_close();
    }

    fn send(&mut self, packets: Vec<Packet>) {
        if !self.writable {
            warn!(transport = %self.id, "Send while not writable ignored");
            return;
        }

        let supports_binary = self.supports_binary();
        let version = self.context.options.version;
        let frames = packets
            .iter()
            .map(|packet| encode_packet(packet, supports_binary, version))
            .collect();

        self.writable = false;
        let sent = self
            .commands
            .as_ref()
            .is_some_and(|commands| commands.send(StreamCommand::Write(frames)).is_ok());
        if !sent {
            self.on_error(&Error::ConnectionClosed);
        }
    }

    fn pause(&mut self) {
        self.state = ReadyState::Pausing;
        if self.writable {
            self.state = ReadyState::Paused;
            self.events.push_back(TransportEvent::Paused);
        }
    }

    fn resume(&mut self) {
        if matches!(self.state, ReadyState::Pausing | ReadyState::Paused) {
            self.state = ReadyState::Open;
        }
    }

    fn set_session_id(&mut self, session_id: SessionId) {
        self.context.session_id = Some(session_id);
    }

    fn handle_io(&mut self, event: IoEvent) {
        if self.state == ReadyState::Closed {
            return;
        }

        match event {
            IoEvent::Connected => {
                if self.state == ReadyState::Opening {
                    self.on_open();
                }
            }
            IoEvent::Received(frame) => {
                let packet = decode_packet(&frame, self.context.options.version);
                if packet.kind == PacketType::Close {
                    self.on_close();
                } else {
                    self.events.push_back(TransportEvent::Packet(packet));
                }
            }
            IoEvent::Written(Ok(())) => self.on_drain(),
            IoEvent::Written(Err(e)) | IoEvent::Failed(e) => self.on_error(&e),
            IoEvent::Disconnected => self.on_close(),
            IoEvent::Polled(_) => trace!(transport = %self.id, "Ignoring poll result"),
        }
    }

    fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }
}

// ============================================================================
// Tests
// ============================================================================
