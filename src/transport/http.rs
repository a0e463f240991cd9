//! Default polling provider backed by reqwest.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use url::Url;

use crate::error::Result;
use crate::protocol::Frame;

use super::provider::{Headers, PollingProvider};

// ============================================================================
// Constants
// ============================================================================

const TEXT_CONTENT_TYPE: &str = "text/plain;charset=UTF-8";
const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

// ============================================================================
// HttpProvider
// ============================================================================

/// Performs poll and write requests over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpProvider {
    client: Client,
}

impl HttpProvider {
    /// Creates a provider with a default client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider sharing an existing client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PollingProvider for HttpProvider {
    async fn get(&self, url: &Url, headers: &Headers) -> Result<Frame> {
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await?.error_for_status()?;
        let is_binary = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with(BINARY_CONTENT_TYPE));

        let body = response.bytes().await?;
        if is_binary {
            return Ok(Frame::Binary(body.to_vec()));
        }
        Ok(Frame::Text(String::from_utf8_lossy(&body).into_owned()))
    }

    async fn post(&self, url: &Url, headers: &Headers, body: Frame) -> Result<()> {
        let mut request = self.client.post(url.clone());
        for (name, value) in headers {
            request = request.header(name, value);
        }

        request = match body {
            Frame::Text(text) => request.header(CONTENT_TYPE, TEXT_CONTENT_TYPE).body(text),
            Frame::Binary(bytes) => request.header(CONTENT_TYPE, BINARY_CONTENT_TYPE).body(bytes),
        };

        request.send().await?.error_for_status()?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response and returns the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        let url = Url::parse(&format!("http://127.0.0.1:{port}/engine.io/?EIO=4")).unwrap();
        (url, handle)
    }

    #[tokio::test]
    async fn test_get_returns_text_body() {
        let (url, server) = serve_once("200 OK", "40").await;
        let headers = vec![("x-token".to_string(), "abc".to_string())];

        let frame = HttpProvider::new().get(&url, &headers).await.unwrap();
        assert_eq!(frame, Frame::Text("40".into()));

        let raw = server.await.unwrap().to_lowercase();
        assert!(raw.starts_with("get /engine.io/?eio=4"));
        assert!(raw.contains("x-token: abc"));
    }

    #[tokio::test]
    async fn test_post_error_status() {
        let (url, _server) = serve_once("400 Bad Request", "").await;
        let result = HttpProvider::new().post(&url, &[], Frame::Text("1".into())).await;
        assert!(result.is_err());
    }
}
