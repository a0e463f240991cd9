//! Scripted providers for tests.
//!
//! Each provider hands the test a receiver of server-side handles. The test
//! plays the server: it answers requests or pushes frames at its own pace.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::engine::EngineOptions;
use crate::error::{Error, Result};
use crate::protocol::Frame;

use super::provider::{DuplexChannel, DuplexEvent, Headers, PollingProvider, StreamingProvider};
use super::{IoReceiver, TransportContext};

// ============================================================================
// Helpers
// ============================================================================

/// Installs a test subscriber once. Filter with `RUST_LOG`.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Context for a transport talking to `http://localhost/`.
pub(crate) fn context() -> (TransportContext, IoReceiver) {
    let (io_tx, io_rx) = mpsc::unbounded_channel();
    let context = TransportContext {
        base: Url::parse("http://localhost/").unwrap(),
        options: Arc::new(EngineOptions::default()),
        session_id: None,
        io_tx,
    };
    (context, io_rx)
}

// ============================================================================
// MockPolling
// ============================================================================

/// Request method seen by [`MockPolling`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Get,
    Post,
}

/// A request waiting for the test to answer.
#[derive(Debug)]
pub(crate) struct MockRequest {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) body: Option<Frame>,
    reply: oneshot::Sender<Result<Frame>>,
}

impl MockRequest {
    /// Completes the request. Dropping it instead fails the request.
    pub(crate) fn reply(self, result: Result<Frame>) {
        let _ = self.reply.send(result);
    }

    pub(crate) fn reply_text(self, body: &str) {
        self.reply(Ok(Frame::from(body)));
    }

    pub(crate) fn reply_ok(self) {
        self.reply_text("ok");
    }
}

/// Polling provider whose requests are answered by the test.
#[derive(Debug, Clone)]
pub(crate) struct MockPolling {
    requests: mpsc::UnboundedSender<MockRequest>,
}

impl MockPolling {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<MockRequest>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (Self { requests }, rx)
    }

    async fn request(&self, method: Method, url: &Url, body: Option<Frame>) -> Result<Frame> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(MockRequest {
                method,
                url: url.clone(),
                body,
                reply,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        response.await.map_err(|_| Error::ConnectionClosed)?
    }
}

#[async_trait]
impl PollingProvider for MockPolling {
    async fn get(&self, url: &Url, _headers: &Headers) -> Result<Frame> {
        self.request(Method::Get, url, None).await
    }

    async fn post(&self, url: &Url, _headers: &Headers, body: Frame) -> Result<()> {
        self.request(Method::Post, url, Some(body)).await.map(|_| ())
    }
}

// ============================================================================
// MockStreaming
// ============================================================================

/// Server side of one duplex channel.
#[derive(Debug)]
pub(crate) struct MockPeer {
    pub(crate) url: Url,
    pub(crate) headers: Vec<(String, String)>,
    to_client: mpsc::UnboundedSender<DuplexEvent>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl MockPeer {
    pub(crate) fn send(&self, frame: Frame) {
        let _ = self.to_client.send(DuplexEvent::Frame(frame));
    }

    pub(crate) fn send_text(&self, text: &str) {
        self.send(Frame::from(text));
    }

    pub(crate) fn send_binary(&self, bytes: Vec<u8>) {
        self.send(Frame::Binary(bytes));
    }

    /// Closes the channel from the server side.
    pub(crate) fn close(&self) {
        let _ = self.to_client.send(DuplexEvent::Closed);
    }

    /// Next frame written by the client, or `None` once it hung up.
    pub(crate) async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Next text frame, skipping anything else.
    pub(crate) async fn recv_text(&mut self) -> Option<String> {
        while let Some(frame) = self.recv().await {
            if let Frame::Text(text) = frame {
                return Some(text);
            }
        }
        None
    }
}

/// Streaming provider whose channels are driven by the test.
#[derive(Debug, Clone)]
pub(crate) struct MockStreaming {
    peers: mpsc::UnboundedSender<MockPeer>,
    refuse: Arc<AtomicBool>,
}

impl MockStreaming {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let provider = Self {
            peers,
            refuse: Arc::new(AtomicBool::new(false)),
        };
        (provider, rx)
    }

    /// Makes subsequent connects fail. Shared across clones.
    pub(crate) fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamingProvider for MockStreaming {
    async fn connect(&self, url: &Url, headers: &Headers) -> Result<DuplexChannel> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::transport("connection refused", None));
        }

        let (to_client, receiver) = mpsc::unbounded_channel();
        let (sender, from_client) = mpsc::unbounded_channel();
        self.peers
            .send(MockPeer {
                url: url.clone(),
                headers: headers.to_vec(),
                to_client,
                from_client,
            })
            .map_err(|_| Error::transport("connection refused", None))?;

        Ok(DuplexChannel { sender, receiver })
    }
}
