//! Transport URL construction.
//!
//! Every request carries the engine query: user pairs first, then
//! `EIO`, `transport`, `sid` once known, and optional `t` (cache buster)
//! and `b64` (text-only) markers.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use url::Url;

use crate::engine::EngineOptions;
use crate::error::{Error, Result};
use crate::identifiers::SessionId;

use super::TransportKind;

// ============================================================================
// Constants
// ============================================================================

/// Alphabet used to encode cache-busting ids.
const ALPHABET: &[u8; 64] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-_";

static LAST_STAMP: AtomicU64 = AtomicU64::new(0);
static STAMP_SEED: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// URL Building
// ============================================================================

/// Checks a user-supplied URL and normalises it to `http`/`https`.
///
/// # Errors
///
/// - [`Error::Url`] if the string does not parse
/// - [`Error::InvalidUrl`] if the scheme is not `http`, `https`, `ws` or `wss`
pub fn parse_base(uri: &str) -> Result<Url> {
    let mut url = Url::parse(uri)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "http",
        "https" | "wss" => "https",
        _ => return Err(Error::invalid_url(uri)),
    };
    if url.host_str().is_none() {
        return Err(Error::invalid_url(uri));
    }
    url.set_scheme(scheme).map_err(|()| Error::invalid_url(uri))?;
    Ok(url)
}

/// Builds the request URL for one transport.
///
/// # Errors
///
/// - [`Error::InvalidUrl`] if the scheme cannot be switched
pub fn transport_url(
    base: &Url,
    options: &EngineOptions,
    kind: TransportKind,
    session_id: Option<&SessionId>,
    supports_binary: bool,
) -> Result<Url> {
    let mut url = base.clone();
    let secure = matches!(base.scheme(), "https" | "wss");
    let scheme = match (kind, secure) {
        (TransportKind::Polling, false) => "http",
        (TransportKind::Polling, true) => "https",
        (TransportKind::WebSocket, false) => "ws",
        (TransportKind::WebSocket, true) => "wss",
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::invalid_url(base.as_str()))?;

    url.set_path(&normalise_path(&options.path));
    url.set_fragment(None);
    url.set_query(None);

    {
        let mut query = url.query_pairs_mut();
        for (key, value) in &options.query {
            query.append_pair(key, value);
        }
        query.append_pair("EIO", &options.version.eio().to_string());
        query.append_pair("transport", kind.as_str());
        if let Some(sid) = session_id {
            query.append_pair("sid", sid.as_str());
        }
        if options.timestamp_requests.unwrap_or(kind == TransportKind::Polling) {
            query.append_pair(&options.timestamp_param, &timestamp_id());
        }
        if !supports_binary {
            query.append_pair("b64", "1");
        }
    }

    Ok(url)
}

/// Strips a trailing slash and re-adds exactly one.
fn normalise_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        format!("{trimmed}/")
    } else {
        format!("/{trimmed}/")
    }
}

// ============================================================================
// Cache Busting
// ============================================================================

/// Returns a short id unique per call within this process.
///
/// The current time in milliseconds, base64-encoded; a `.`-separated
/// counter disambiguates calls within the same millisecond.
#[must_use]
pub fn timestamp_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);

    let previous = LAST_STAMP.swap(now, Ordering::Relaxed);
    if previous == now {
        let seed = STAMP_SEED.fetch_add(1, Ordering::Relaxed);
        format!("{}.{}", encode(now), encode(seed))
    } else {
        encode(now)
    }
}

/// Encodes a number in the 64-character alphabet.
fn encode(mut n: u64) -> String {
    let mut out = Vec::new();
    loop {
        out.push(ALPHABET[(n % 64) as usize]);
        n /= 64;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::ProtocolVersion;

    fn query(url: &Url) -> Vec<(String, String)> {
        url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect()
    }

    #[test]
    fn test_parse_base() {
        assert_eq!(parse_base("ws://localhost:3000").unwrap().scheme(), "http");
        assert_eq!(parse_base("wss://example.com/chat").unwrap().scheme(), "https");
        assert!(matches!(parse_base("ftp://example.com"), Err(Error::InvalidUrl { .. })));
        assert!(parse_base("not a url").is_err());
    }

    #[test]
    fn test_polling_url() {
        let base = parse_base("http://localhost:3000/chat?x=1").unwrap();
        let options = EngineOptions::default()
            .with_path("/socket.io")
            .with_query("token", "abc");
        let url = transport_url(&base, &options, TransportKind::Polling, None, false).unwrap();

        assert_eq!(url.scheme(), "http");
        assert_eq!(url.path(), "/socket.io/");
        let pairs = query(&url);
        assert_eq!(pairs[0], ("token".into(), "abc".into()));
        assert_eq!(pairs[1], ("EIO".into(), "4".into()));
        assert_eq!(pairs[2], ("transport".into(), "polling".into()));
        assert_eq!(pairs[3].0, "t");
        assert_eq!(pairs[4], ("b64".into(), "1".into()));
    }

    #[test]
    fn test_websocket_url() {
        let base = parse_base("https://example.com").unwrap();
        let options = EngineOptions::default().with_version(ProtocolVersion::V3);
        let sid = SessionId::new("s1");
        let url = transport_url(&base, &options, TransportKind::WebSocket, Some(&sid), true).unwrap();

        assert_eq!(url.scheme(), "wss");
        assert_eq!(
            query(&url),
            vec![
                ("EIO".into(), "3".into()),
                ("transport".into(), "websocket".into()),
                ("sid".into(), "s1".into()),
            ]
        );
    }

    #[test]
    fn test_normalise_path() {
        assert_eq!(normalise_path("/engine.io"), "/engine.io/");
        assert_eq!(normalise_path("socket.io//"), "/socket.io/");
    }

    #[test]
    fn test_timestamp_ids_differ() {
        let a = timestamp_id();
        let b = timestamp_id();
        assert_ne!(a, b);
        assert_eq!(encode(0), "0");
        assert_eq!(encode(64), "10");
    }
}
