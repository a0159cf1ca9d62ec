use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{StoreEvent, StoreScope};
use crate::error::StoreError;

struct Registered {
    scope: StoreScope,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

/// Live listeners of one store instance.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, Registered>>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener and queue `initial` as its first event.
    pub(crate) fn register(
        self: &Arc<Self>,
        scope: StoreScope,
        initial: StoreEvent,
    ) -> StoreListener {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(initial);
        self.listeners.lock().insert(id, Registered { scope, tx });
        tracing::debug!(listener = id, "store listener registered");
        StoreListener {
            id,
            events: rx,
            registry: Arc::clone(self),
            released: false,
        }
    }

    pub(crate) fn release(&self, id: u64) {
        if self.listeners.lock().remove(&id).is_some() {
            tracing::debug!(listener = id, "store listener released");
        }
    }

    /// Scopes of listeners watching `path`.
    pub(crate) fn watching(&self, path: &str) -> Vec<(u64, StoreScope)> {
        self.listeners
            .lock()
            .iter()
            .filter(|(_, entry)| entry.scope.path == path)
            .map(|(id, entry)| (*id, entry.scope.clone()))
            .collect()
    }

    pub(crate) fn all(&self) -> Vec<(u64, StoreScope)> {
        self.listeners
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.scope.clone()))
            .collect()
    }

    pub(crate) fn send(&self, id: u64, event: StoreEvent) {
        let mut listeners = self.listeners.lock();
        let closed = match listeners.get(&id) {
            Some(entry) => entry.tx.send(event).is_err(),
            None => false,
        };
        if closed {
            listeners.remove(&id);
        }
    }

    pub(crate) fn broadcast_error(&self, err: StoreError) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|_, entry| entry.tx.send(StoreEvent::Error(err.clone())).is_ok());
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Receiving end of a live subscription.
///
/// Releasing is idempotent and also happens on drop, so a listener can never
/// outlive its owner inside the store.
pub struct StoreListener {
    id: u64,
    events: mpsc::UnboundedReceiver<StoreEvent>,
    registry: Arc<ListenerRegistry>,
    released: bool,
}

impl StoreListener {
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        if self.released {
            return None;
        }
        self.events.recv().await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<StoreEvent>> {
        if self.released {
            return Poll::Ready(None);
        }
        self.events.poll_recv(cx)
    }

    pub fn unsubscribe(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.registry.release(self.id);
        self.events.close();
    }

    pub fn is_active(&self) -> bool {
        !self.released
    }
}

impl Drop for StoreListener {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for StoreListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreListener")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_releases() {
        let registry = ListenerRegistry::new();
        let mut listener = registry.register(StoreScope::path("tasks/u1"), StoreEvent::Snapshot(vec![]));
        assert_eq!(registry.len(), 1);
        assert_eq!(listener.recv().await, Some(StoreEvent::Snapshot(vec![])));

        listener.unsubscribe();
        listener.unsubscribe();
        assert_eq!(registry.len(), 0);
        assert!(!listener.is_active());
        assert_eq!(listener.recv().await, None);
    }

    #[test]
    fn dropping_a_listener_releases_it() {
        let registry = ListenerRegistry::new();
        {
            let _listener = registry.register(StoreScope::path("tasks/u1"), StoreEvent::Snapshot(vec![]));
            assert_eq!(registry.len(), 1);
        }
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn watching_selects_by_path() {
        let registry = ListenerRegistry::new();
        let _a = registry.register(StoreScope::path("tasks/u1"), StoreEvent::Snapshot(vec![]));
        let _b = registry.register(StoreScope::path("tasks/u2"), StoreEvent::Snapshot(vec![]));
        assert_eq!(registry.watching("tasks/u1").len(), 1);
        assert_eq!(registry.all().len(), 2);
    }
}
