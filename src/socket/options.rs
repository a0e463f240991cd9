//! Namespace socket options.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use serde_json::json;
//! use sio_client::SocketOptions;
//!
//! let options = SocketOptions::new()
//!     .with_auth(json!({ "token": "abc" }))
//!     .with_retries(3)
//!     .with_ack_timeout(Duration::from_secs(5));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::protocol::Payload;

// ============================================================================
// AuthProvider
// ============================================================================

/// Produces the CONNECT payload each time a namespace connects.
///
/// Runs on its own task; the CONNECT packet is sent once it resolves.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Returns the auth payload, normally an object.
    async fn auth(&self) -> Payload;
}

// ============================================================================
// Auth
// ============================================================================

/// Credentials sent with the namespace CONNECT packet.
#[derive(Clone)]
pub enum Auth {
    /// The same payload on every connect.
    Static(Payload),
    /// Resolved anew on every connect.
    Provider(Arc<dyn AuthProvider>),
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(payload) => f.debug_tuple("Static").field(payload).finish(),
            Self::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

// ============================================================================
// SocketOptions
// ============================================================================

/// Per-namespace configuration.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    /// Credentials for the CONNECT packet.
    pub auth: Option<Auth>,

    /// Resends per emission before giving up. Zero disables the retry queue.
    pub retries: u32,

    /// Default acknowledgement timeout.
    pub ack_timeout: Option<Duration>,
}

impl SocketOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a static auth payload.
    #[inline]
    #[must_use]
    pub fn with_auth(mut self, auth: impl Into<Payload>) -> Self {
        self.auth = Some(Auth::Static(auth.into()));
        self
    }

    /// Sets an auth provider consulted on every connect.
    #[inline]
    #[must_use]
    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(Auth::Provider(provider));
        self
    }

    /// Enables the retry queue.
    #[inline]
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the default acknowledgement timeout.
    #[inline]
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
