//! Default streaming provider backed by tokio-tungstenite.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::Frame;

use super::provider::{DuplexChannel, DuplexEvent, Headers, StreamingProvider};

// ============================================================================
// WebSocketProvider
// ============================================================================

/// Opens WebSocket connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketProvider;

impl WebSocketProvider {
    /// Creates a provider.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StreamingProvider for WebSocketProvider {
    async fn connect(&self, url: &Url, headers: &Headers) -> Result<DuplexChannel> {
        let mut request = url.as_str().into_client_request()?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::config(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::config(format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (ws_stream, _) = connect_async(request).await?;
        debug!(url = %url, "WebSocket connected");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (mut ws_write, mut ws_read) = ws_stream.split();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => {
                        let Some(frame) = outgoing else {
                            trace!("Sender dropped, closing WebSocket");
                            let _ = ws_write.send(Message::Close(None)).await;
                            break;
                        };
                        let message = match frame {
                            Frame::Text(text) => Message::text(text),
                            Frame::Binary(bytes) => Message::binary(bytes),
                        };
                        if let Err(e) = ws_write.send(message).await {
                            let _ = in_tx.send(DuplexEvent::Error(e.into()));
                            break;
                        }
                    }

                    incoming = ws_read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let _ = in_tx.send(DuplexEvent::Frame(Frame::Text(text.as_str().to_owned())));
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            let _ = in_tx.send(DuplexEvent::Frame(Frame::Binary(bytes.to_vec())));
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("WebSocket closed by remote");
                            let _ = in_tx.send(DuplexEvent::Closed);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket error");
                            let _ = in_tx.send(DuplexEvent::Error(e.into()));
                            break;
                        }
                    },
                }
            }
        });

        Ok(DuplexChannel {
            sender: out_tx,
            receiver: in_rx,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
