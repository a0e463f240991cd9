//! Builder pattern for manager configuration.
//!
//! # Example
//!
//! ```ignore
//! use sio_client::{Manager, ManagerOptions};
//!
//! # fn example() -> sio_client::Result<()> {
//! let manager = Manager::builder("wss://example.com")
//!     .options(ManagerOptions::new().with_reconnection_attempts(10))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::emitter::Listeners;
use crate::error::{Error, Result};
use crate::transport::endpoint::parse_base;
use crate::transport::{
    HttpProvider, IoTransportFactory, PollingProvider, StreamingProvider, TransportFactory,
    WebSocketProvider,
};

use super::event_loop::ManagerCore;
use super::options::ManagerOptions;
use super::{Manager, ManagerShared, ManagerStatus};

// ============================================================================
// ManagerBuilder
// ============================================================================

/// Builder for configuring a [`Manager`].
///
/// Use [`Manager::builder()`] to create one.
pub struct ManagerBuilder {
    /// Server URI.
    uri: String,
    /// Connection options.
    options: ManagerOptions,
    /// Polling I/O override.
    polling: Option<Arc<dyn PollingProvider>>,
    /// Streaming I/O override.
    streaming: Option<Arc<dyn StreamingProvider>>,
    /// Full transport factory override.
    factory: Option<Arc<dyn TransportFactory>>,
}

impl fmt::Debug for ManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerBuilder")
            .field("uri", &self.uri)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ManagerBuilder Implementation
// ============================================================================

impl ManagerBuilder {
    /// Creates a builder for `uri` with default options.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            options: ManagerOptions::default(),
            polling: None,
            streaming: None,
            factory: None,
        }
    }

    /// Replaces the options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses `provider` for HTTP long-polling requests.
    #[inline]
    #[must_use]
    pub fn polling_provider(mut self, provider: Arc<dyn PollingProvider>) -> Self {
        self.polling = Some(provider);
        self
    }

    /// Uses `provider` to open WebSocket channels.
    #[inline]
    #[must_use]
    pub fn streaming_provider(mut self, provider: Arc<dyn StreamingProvider>) -> Self {
        self.streaming = Some(provider);
        self
    }

    /// Replaces transport creation entirely. Provider overrides are ignored.
    #[inline]
    #[must_use]
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Validates the configuration and starts the manager's event loop.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if the URI is not an http(s) or ws(s) URL
    /// - [`Error::NoTransports`] if no transport is enabled
    /// - [`Error::Config`] if the options are inconsistent or no Tokio
    ///   runtime is running
    pub fn build(self) -> Result<Manager> {
        let base = parse_base(&self.uri)?;
        self.options.validate()?;

        let runtime = Handle::try_current().map_err(|_| {
            Error::config(
                "A Tokio runtime is required. Build the manager from within an async context.",
            )
        })?;

        let mut options = self.options;
        if options.engine.query.is_empty() {
            options.engine.query = base
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
        }

        let factory = match self.factory {
            Some(factory) => factory,
            None => Arc::new(IoTransportFactory::new(
                self.polling
                    .unwrap_or_else(|| Arc::new(HttpProvider::new())),
                self.streaming
                    .unwrap_or_else(|| Arc::new(WebSocketProvider::new())),
            )),
        };

        let shared = Arc::new(ManagerShared {
            base,
            uri: self.uri,
            options,
            events: Listeners::new(),
            status: Mutex::new(ManagerStatus::default()),
            sockets: Mutex::new(FxHashMap::default()),
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let core = ManagerCore::new(
            Arc::clone(&shared),
            factory,
            io_tx,
            command_tx.downgrade(),
        );
        runtime.spawn(core.run(command_rx, io_rx));

        Ok(Manager::from_parts(command_tx, shared))
    }
}

// ============================================================================
// Tests
// ============================================================================
