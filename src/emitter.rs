//! Listener tables.
//!
//! A [`Listeners`] value is embedded wherever something needs to notify
//! observers. Handlers run on the caller's task, outside the table lock,
//! so a handler may register or remove listeners while being called.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;

use crate::identifiers::SubscriptionId;

// ============================================================================
// Types
// ============================================================================

/// Shared handler callback.
pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// One registration.
struct Entry<E> {
    id: SubscriptionId,
    handler: Handler<E>,
    once: bool,
}

impl<E> Clone for Entry<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
            once: self.once,
        }
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// An ordered set of handlers for events of type `E`.
pub struct Listeners<E> {
    entries: Mutex<Vec<Entry<E>>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}

impl<E> Listeners<E> {
    /// Creates an empty table.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler called for every event.
    pub fn add(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        self.insert(Arc::new(handler), false)
    }

    /// Registers a handler removed after its first call.
    pub fn add_once(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        self.insert(Arc::new(handler), true)
    }

    fn insert(&self, handler: Handler<E>, once: bool) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.entries.lock().push(Entry { id, handler, once });
        id
    }

    /// Removes a handler. Returns `false` if it was not registered.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Removes every handler.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Calls every handler registered at the time of the call.
    ///
    /// Returns the number of handlers called.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<Entry<E>> = {
            let mut entries = self.entries.lock();
            let snapshot = entries.clone();
            entries.retain(|entry| !entry.once);
            snapshot
        };

        for entry in &snapshot {
            (entry.handler)(event);
        }

        snapshot.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_calls_in_order() {
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen);
        listeners.add(move |v| s1.lock().push(("a", *v)));
        let s2 = Arc::clone(&seen);
        listeners.add(move |v| s2.lock().push(("b", *v)));

        assert_eq!(listeners.emit(&7), 2);
        assert_eq!(*seen.lock(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_once_fires_once() {
        let listeners = Listeners::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        listeners.add_once(move |()| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&());
        listeners.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_remove() {
        let listeners = Listeners::<()>::new();
        let id = listeners.add(|()| {});
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        assert_eq!(listeners.emit(&()), 0);
    }

    #[test]
    fn test_handler_may_register_during_emit() {
        let listeners = Arc::new(Listeners::<()>::new());
        let inner = Arc::clone(&listeners);
        listeners.add(move |()| {
            inner.add(|()| {});
        });

        listeners.emit(&());
        assert_eq!(listeners.len(), 2);
    }
}
