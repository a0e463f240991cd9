//! Manager cache keyed by server origin.
//!
//! [`Registry::lookup`] turns a URL into a namespace [`Socket`]. Sockets on
//! the same origin share one [`Manager`] unless the options opt out or the
//! namespace is already taken on the cached manager.
//!
//! # Example
//!
//! ```ignore
//! use sio_client::{ManagerOptions, Registry};
//!
//! # async fn example() -> sio_client::Result<()> {
//! let registry = Registry::new();
//! let chat = registry.lookup("https://example.com/chat", ManagerOptions::new())?;
//! let news = registry.lookup("https://example.com/news", ManagerOptions::new())?;
//! assert!(chat.manager().same_manager(news.manager()));
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::manager::{Manager, ManagerOptions};
use crate::protocol::DEFAULT_NAMESPACE;
use crate::socket::Socket;
use crate::transport::endpoint::parse_base;

// ============================================================================
// Registry
// ============================================================================

/// Shares managers between sockets on the same origin.
#[derive(Debug, Default)]
pub struct Registry {
    managers: Mutex<FxHashMap<String, Manager>>,
}

impl Registry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a socket for the namespace named by `uri`'s path.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if `uri` is not an http(s) or ws(s) URL
    /// - [`Error::Config`] if the options are invalid or no runtime is running
    pub fn lookup(&self, uri: &str, options: ManagerOptions) -> Result<Socket> {
        let uri = with_scheme(uri);
        let parsed = parse_base(&uri)?;
        let id = cache_key(&parsed, &options.engine.path)?;
        let nsp = namespace_of(&parsed);
        let socket_options = options.socket.clone();

        if options.force_new || !options.multiplex {
            debug!(uri = %uri, "Creating unshared manager");
            let manager = Manager::builder(uri).options(options).build()?;
            return Ok(manager.socket_with(&nsp, socket_options));
        }

        let mut managers = self.managers.lock();
        if let Some(manager) = managers.get(&id) {
            if !manager.has_socket(&nsp) {
                return Ok(manager.socket_with(&nsp, socket_options));
            }
            debug!(uri = %uri, nsp = %nsp, "Namespace in use, creating new manager");
            drop(managers);
            let manager = Manager::builder(uri).options(options).build()?;
            return Ok(manager.socket_with(&nsp, socket_options));
        }

        debug!(id = %id, "Caching manager");
        let manager = Manager::builder(uri).options(options).build()?;
        managers.insert(id, manager.clone());
        drop(managers);
        Ok(manager.socket_with(&nsp, socket_options))
    }

    /// Number of cached managers.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.managers.lock().len()
    }

    /// Returns `true` if no manager is cached.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.managers.lock().is_empty()
    }

    /// Drops every cached manager.
    ///
    /// Managers keep running while sockets created from them are alive.
    pub fn clear(&self) {
        self.managers.lock().clear();
    }
}

// ============================================================================
// Unshared Connections
// ============================================================================

/// Connects to the namespace named by `uri` on a manager of its own.
///
/// Use a [`Registry`] to share one connection between namespaces.
///
/// # Errors
///
/// See [`Registry::lookup`].
pub fn connect(uri: &str) -> Result<Socket> {
    connect_with(uri, ManagerOptions::default())
}

/// Like [`connect`], with explicit options.
///
/// # Errors
///
/// See [`Registry::lookup`].
pub fn connect_with(uri: &str, options: ManagerOptions) -> Result<Socket> {
    let uri = with_scheme(uri);
    let nsp = namespace_of(&parse_base(&uri)?);
    let socket_options = options.socket.clone();
    let manager = Manager::builder(uri).options(options).build()?;
    Ok(manager.socket_with(&nsp, socket_options))
}

// ============================================================================
// Helpers
// ============================================================================

/// Assumes `https` for scheme-less URIs.
fn with_scheme(uri: &str) -> String {
    if uri.contains("://") {
        uri.to_string()
    } else {
        format!("https://{}", uri.trim_start_matches('/'))
    }
}

/// `scheme://host:port/path`, with the default port filled in.
fn cache_key(url: &Url, path: &str) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::invalid_url(url.as_str()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::invalid_url(url.as_str()))?;
    Ok(format!("{}://{host}:{port}{path}", url.scheme()))
}

/// The URL path names the namespace.
fn namespace_of(url: &Url) -> String {
    match url.path() {
        "" | "/" => DEFAULT_NAMESPACE.to_string(),
        path => path.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn offline() -> ManagerOptions {
        ManagerOptions::new().with_auto_connect(false)
    }

    #[test]
    fn test_cache_key_fills_default_port() {
        let a = parse_base("http://example.com/chat").unwrap();
        let b = parse_base("ws://example.com:80/news").unwrap();
        assert_eq!(cache_key(&a, "/socket.io").unwrap(), "http://example.com:80/socket.io");
        assert_eq!(cache_key(&a, "/socket.io").unwrap(), cache_key(&b, "/socket.io").unwrap());

        let secure = parse_base("wss://example.com").unwrap();
        assert_eq!(cache_key(&secure, "/x").unwrap(), "https://example.com:443/x");
    }

    #[test]
    fn test_namespace_from_path() {
        assert_eq!(namespace_of(&parse_base("http://h").unwrap()), "/");
        assert_eq!(namespace_of(&parse_base("http://h/").unwrap()), "/");
        assert_eq!(namespace_of(&parse_base("http://h/admin").unwrap()), "/admin");
    }

    #[test]
    fn test_scheme_less_uri() {
        assert_eq!(with_scheme("example.com/chat"), "https://example.com/chat");
        assert_eq!(with_scheme("ws://example.com"), "ws://example.com");
    }

    #[tokio::test]
    async fn test_same_origin_shares_manager() {
        let registry = Registry::new();
        let chat = registry.lookup("http://localhost:3000/chat", offline()).unwrap();
        let news = registry.lookup("http://localhost:3000/news", offline()).unwrap();

        assert_eq!(chat.namespace(), "/chat");
        assert_eq!(news.namespace(), "/news");
        assert!(chat.manager().same_manager(news.manager()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_namespace_in_use_gets_new_manager() {
        let registry = Registry::new();
        let a = registry.lookup("http://localhost:3000/chat", offline()).unwrap();
        let b = registry.lookup("http://localhost:3000/chat", offline()).unwrap();
        assert!(!a.manager().same_manager(b.manager()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_force_new_and_multiplex_bypass_cache() {
        let registry = Registry::new();
        let a = registry
            .lookup("http://localhost:3000/", offline().with_force_new())
            .unwrap();
        let b = registry
            .lookup("http://localhost:3000/other", offline().with_multiplex(false))
            .unwrap();
        assert!(!a.manager().same_manager(b.manager()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_different_origins() {
        let registry = Registry::new();
        let a = registry.lookup("http://localhost:3000", offline()).unwrap();
        let b = registry.lookup("http://localhost:4000", offline()).unwrap();
        assert!(!a.manager().same_manager(b.manager()));
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_connect_is_never_shared() {
        let a = connect_with("http://localhost:3000/chat", offline()).unwrap();
        let b = connect_with("http://localhost:3000/news", offline()).unwrap();
        assert_eq!(a.namespace(), "/chat");
        assert!(!a.manager().same_manager(b.manager()));
    }

    #[tokio::test]
    async fn test_invalid_uri() {
        let registry = Registry::new();
        assert!(matches!(
            registry.lookup("ftp://localhost", offline()),
            Err(Error::InvalidUrl { .. })
        ));
    }
}
