//! Long-polling transport.
//!
//! One GET is kept in flight at all times while open; each response body
//! is a batch of packets. Writes are POSTed one batch at a time.
//!
//! # Pause
//!
//! A pause waits for the in-flight poll to complete and for the pending
//! write to drain, whichever are outstanding, then reports
//! [`TransportEvent::Paused`]. No new poll is started while pausing.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{SessionId, TransportId};
use crate::protocol::{
    Frame, Handshake, Packet, PacketType, decode_payload, encode_payload,
};

use super::{
    IoEvent, PollingProvider, ReadyState, TaskSet, Transport, TransportContext, TransportEvent,
    TransportKind,
};

// ============================================================================
// Constants
// ============================================================================

/// Error reported when a poll request fails.
const POLL_ERROR: &str = "xhr poll error";

/// Error reported when a write request fails.
const POST_ERROR: &str = "xhr post error";

// ============================================================================
// PauseWait
// ============================================================================

/// Outstanding I/O a pause is waiting for.
#[derive(Debug, Clone, Copy)]
struct PauseWait {
    poll: bool,
    drain: bool,
}

// ============================================================================
// PollingTransport
// ============================================================================

/// HTTP long-polling transport.
pub struct PollingTransport {
    id: TransportId,
    context: TransportContext,
    provider: Arc<dyn PollingProvider>,
    state: ReadyState,
    writable: bool,
    polling: bool,
    pause_wait: Option<PauseWait>,
    events: VecDeque<TransportEvent>,
    tasks: TaskSet,
    /// In-flight poll; yields the body so a deferred close can read the
    /// handshake from it.
    poll_task: Option<JoinHandle<Option<Frame>>>,
}

impl fmt::Debug for PollingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingTransport")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("writable", &self.writable)
            .field("polling", &self.polling)
            .finish_non_exhaustive()
    }
}

impl PollingTransport {
    /// Creates an unopened transport.
    #[must_use]
    pub fn new(context: TransportContext, provider: Arc<dyn PollingProvider>) -> Self {
        Self {
            id: TransportId::next(),
            context,
            provider,
            state: ReadyState::Unopened,
            writable: false,
            polling: false,
            pause_wait: None,
            events: VecDeque::new(),
            tasks: TaskSet::default(),
            poll_task: None,
        }
    }

    /// Returns `true` while a poll request is in flight.
    #[inline]
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.polling
    }

    /// Starts a poll request.
    fn poll(&mut self) {
        let url = match self.context.url(TransportKind::Polling, false) {
            Ok(url) => url,
            Err(e) => {
                self.on_error(POLL_ERROR, &e);
                return;
            }
        };

        trace!(transport = %self.id, "Polling");
        self.polling = true;

        let provider = Arc::clone(&self.provider);
        let headers = self.context.options.extra_headers.clone();
        let io_tx = self.context.io_tx.clone();
        let id = self.id;

        self.poll_task = Some(tokio::spawn(async move {
            let result = provider.get(&url, &headers).await;
            let body = result.as_ref().ok().cloned();
            let _ = io_tx.send((id, IoEvent::Polled(result)));
            body
        }));
    }

    /// Processes a poll response body.
    fn on_data(&mut self, body: Frame) {
        for packet in decode_payload(&body, self.context.options.version) {
            if self.state == ReadyState::Opening && packet.kind == PacketType::Open {
                self.on_open();
            }

            if packet.kind == PacketType::Close {
                debug!(transport = %self.id, "Server closed the polling session");
                self.on_close();
                return;
            }

            self.events.push_back(TransportEvent::Packet(packet));
        }

        if self.state != ReadyState::Closed {
            self.polling = false;
            if let Some(wait) = self.pause_wait.as_mut() {
                wait.poll = false;
            }
            self.check_paused();

            if self.state == ReadyState::Open {
                self.poll();
            }
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
        if let Some(wait) = self.pause_wait.as_mut() {
            wait.drain = false;
        }
        self.check_paused();
    }

    fn on_close(&mut self) {
        self.state = ReadyState::Closed;
        self.writable = false;
        self.events.push_back(TransportEvent::Close);
    }

    fn on_error(&mut self, message: &str, cause: &Error) {
        warn!(transport = %self.id, error = %cause, "{message}");
        self.events.push_back(TransportEvent::Error(Error::transport(
            message,
            Some(cause.to_string()),
        )));
    }

    /// Completes a pause once nothing is outstanding.
    fn check_paused(&mut self) {
        if let Some(wait) = self.pause_wait
            && !wait.poll
            && !wait.drain
        {
            self.pause_wait = None;
            self.state = ReadyState::Paused;
            debug!(transport = %self.id, "Paused");
            self.events.push_back(TransportEvent::Paused);
        }
    }

    /// Posts a close packet without tracking the request.
    fn post_close(&self) {
        let url = match self.context.url(TransportKind::Polling, false) {
            Ok(url) => url,
            Err(e) => {
                warn!(transport = %self.id, error = %e, "Cannot build close URL");
                return;
            }
        };
        let body = Frame::Text(encode_payload(
            &[Packet::new(PacketType::Close)],
            self.context.options.version,
        ));
        let provider = Arc::clone(&self.provider);
        let headers = self.context.options.extra_headers.clone();

        tokio::spawn(async move {
            if let Err(e) = provider.post(&url, &headers, body).await {
                debug!(error = %e, "Close request failed");
            }
        });
    }

    /// Posts a close packet once the pending handshake response arrives.
    fn defer_close(&mut self, poll: JoinHandle<Option<Frame>>) {
        let mut context = self.context.clone();
        let provider = Arc::clone(&self.provider);
        let version = context.options.version;

        tokio::spawn(async move {
            let Ok(Some(body)) = poll.await else {
                return;
            };
            let Some(handshake) = decode_payload(&body, version)
                .into_iter()
                .find(|p| p.kind == PacketType::Open)
                .and_then(|p| p.text().and_then(|data| Handshake::parse(data).ok()))
            else {
                return;
            };

            context.session_id = Some(SessionId::new(handshake.sid));
            let result: Result<()> = async {
                let url = context.url(TransportKind::Polling, false)?;
                let body = Frame::Text(encode_payload(&[Packet::new(PacketType::Close)], version));
                provider.post(&url, &context.options.extra_headers, body).await
            }
            .await;

            if let Err(e) = result {
                debug!(error = %e, "Deferred close request failed");
            }
        });
    }
}

// ============================================================================
// Transport Implementation
// ============================================================================

impl Transport for PollingTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn ready_state(&self) -> ReadyState {
        self.state
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn supports_binary(&self) -> bool {
        false
    }

    fn open(&mut self) {
        if self.state != ReadyState::Unopened && self.state != ReadyState::Closed {
            return;
        }
        self.state = ReadyState::Opening;
        self.poll();
    }

    fn close(&mut self) {
        match self.state {
            ReadyState::Opening => {
                if let Some(poll) = self.poll_task.take() {
                    self.defer_close(poll);
                }
            }
            ReadyState::Open | ReadyState::Pausing | ReadyState::Paused => self.post_close(),
            _ => return,
        }

        self.tasks.abort_all();
        self.pause_wait = None;
        self.polling = false;
        self.on_close();
    }

    fn send(&mut self, packets: Vec<Packet>) {
        if !self.writable {
            warn!(transport = %self.id, "Send while not writable ignored");
            return;
        }

        let url = match self.context.url(TransportKind::Polling, false) {
            Ok(url) => url,
            Err(e) => {
                self.on_error(POST_ERROR, &e);
                return;
            }
        };

        self.writable = false;
        let body = Frame::Text(encode_payload(&packets, self.context.options.version));
        let provider = Arc::clone(&self.provider);
        let headers = self.context.options.extra_headers.clone();
        let io_tx = self.context.io_tx.clone();
        let id = self.id;

        trace!(transport = %id, count = packets.len(), "Writing batch");

        self.tasks.push(tokio::spawn(async move {
            let result = provider.post(&url, &headers, body).await;
            let _ = io_tx.send((id, IoEvent::Written(result)));
        }));
    }

    fn pause(&mut self) {
        self.state = ReadyState::Pausing;
        self.pause_wait = Some(PauseWait {
            poll: self.polling,
            drain: !self.writable,
        });
        self.check_paused();
    }

    fn resume(&mut self) {
        if !matches!(self.state, ReadyState::Pausing | ReadyState::Paused) {
            return;
        }
        self.pause_wait = None;
        self.state = ReadyState::Open;
        if !self.polling {
            self.poll();
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
            IoEvent::Polled(Ok(body)) => {
                self.poll_task = None;
                self.on_data(body);
            }
            IoEvent::Polled(Err(e)) => {
                self.poll_task = None;
                self.polling = false;
                self.on_error(POLL_ERROR, &e);
            }
            IoEvent::Written(Ok(())) => self.on_drain(),
            IoEvent::Written(Err(e)) => self.on_error(POST_ERROR, &e),
            other => trace!(transport = %self.id, event = ?other, "Ignoring I/O event"),
        }
    }

    fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        if let Some(poll) = self.poll_task.take() {
            poll.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
