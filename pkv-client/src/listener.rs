//! # Connection Listeners
//!
//! Purpose: Let applications observe connect, disconnect and error events of
//! every connection a client opens.
//!
//! ## Design Principles
//! 1. **Copy-on-Write**: The listener list is an `Arc<Vec<_>>` swapped under a
//!    short write lock; notifying only clones the `Arc`, so listeners can be
//!    added or removed while another thread is dispatching events.
//! 2. **Immediate Removal**: Once `remove` returns, no event fired afterwards
//!    reaches the removed listener.
//! 3. **Default No-Ops**: Implementors override only the callbacks they need.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::StatefulConnection;
use crate::error::ClientError;

/// Observer of connection lifecycle events.
pub trait ConnectionListener: Send + Sync {
    /// A transport became usable (initial connect or reconnect).
    fn on_connected(&self, _connection: &StatefulConnection) {}

    /// The transport went away, or the connection was closed.
    fn on_disconnected(&self, _connection: &StatefulConnection) {}

    /// A transport or reconnect attempt failed.
    fn on_exception(&self, _connection: &StatefulConnection, _error: &ClientError) {}
}

/// Handle returned by `ListenerRegistry::add`, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerList = Vec<(ListenerId, Arc<dyn ConnectionListener>)>;

/// Thread-safe set of connection listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Arc<ListenerList>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        ListenerRegistry::default()
    }

    /// Registers a listener for all future events.
    pub fn add(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.listeners.write();
        let mut next = ListenerList::clone(&guard);
        next.push((id, listener));
        *guard = Arc::new(next);
        id
    }

    /// Unregisters a listener. Returns false when the id is unknown.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write();
        if !guard.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next: ListenerList = guard
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Calls `f` for each listener registered at the time of the call.
    pub fn for_each(&self, mut f: impl FnMut(&dyn ConnectionListener)) {
        let snapshot = Arc::clone(&self.listeners.read());
        for (_, listener) in snapshot.iter() {
            f(listener.as_ref());
        }
    }

    pub(crate) fn fire_connected(&self, connection: &StatefulConnection) {
        self.for_each(|listener| listener.on_connected(connection));
    }

    pub(crate) fn fire_disconnected(&self, connection: &StatefulConnection) {
        self.for_each(|listener| listener.on_disconnected(connection));
    }

    pub(crate) fn fire_exception(&self, connection: &StatefulConnection, error: &ClientError) {
        self.for_each(|listener| listener.on_exception(connection, error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Quiet;

    impl ConnectionListener for Quiet {}

    fn visits(registry: &ListenerRegistry) -> usize {
        let mut count = 0;
        registry.for_each(|_| count += 1);
        count
    }

    #[test]
    fn add_and_remove() {
        let registry = ListenerRegistry::new();
        let first = registry.add(Arc::new(Quiet));
        let second = registry.add(Arc::new(Quiet));
        assert_ne!(first, second);
        assert_eq!(visits(&registry), 2);

        assert!(registry.remove(first));
        assert!(!registry.remove(first));
        assert_eq!(visits(&registry), 1);

        assert!(registry.remove(second));
        assert!(registry.is_empty());
    }

    #[test]
    fn removal_during_iteration_does_not_disturb_snapshot() {
        let registry = ListenerRegistry::new();
        let first = registry.add(Arc::new(Quiet));
        registry.add(Arc::new(Quiet));

        let mut seen = 0;
        registry.for_each(|_| {
            registry.remove(first);
            seen += 1;
        });
        assert_eq!(seen, 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_add_remove() {
        let registry = Arc::new(ListenerRegistry::new());
        let removed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let removed = Arc::clone(&removed);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let id = registry.add(Arc::new(Quiet));
                        if registry.remove(id) {
                            removed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(removed.load(Ordering::Relaxed), 800);
        assert!(registry.is_empty());
    }
}
