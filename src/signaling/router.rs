//! Listener registries for named signaling events and in-process observers.
//!
//! Every registration hands back a `ListenerId`; only the holder of that id can
//! detach the listener, so two call contexts subscribed to the same event never
//! clobber each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Token returned by a registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Callback invoked for each published value.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered list of listeners for one kind of value.
pub struct Listeners<T> {
    inner: Mutex<Vec<(ListenerId, Listener<T>)>>,
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener. Listeners are called in registration order.
    pub fn subscribe(&self, listener: Listener<T>) -> ListenerId {
        let id = ListenerId::next();
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.push((id, listener));
        id
    }

    /// Remove a listener. Returns false if the id was not registered here.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = guard.len();
        guard.retain(|(lid, _)| *lid != id);
        guard.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every listener with `value`.
    ///
    /// The list is snapshotted first so a listener may (un)subscribe without
    /// deadlocking.
    pub fn publish(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = {
            let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in snapshot {
            listener(value);
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler for a named signaling event.
pub type EventHandler = Listener<serde_json::Value>;

/// Routes inbound named events to their registered handlers.
#[derive(Default)]
pub struct EventRouter {
    events: Mutex<HashMap<String, Arc<Listeners<serde_json::Value>>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`.
    ///
    /// The map lock is held until the handler is in its list; `off` may
    /// otherwise drop the list of a concurrent registration.
    pub fn on(&self, event: &str, handler: EventHandler) -> ListenerId {
        let mut guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(event.to_string())
            .or_insert_with(|| Arc::new(Listeners::new()))
            .subscribe(handler)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let Some(listeners) = guard.get(event).cloned() else {
            return false;
        };
        let removed = listeners.unsubscribe(id);
        if listeners.is_empty() {
            guard.remove(event);
        }
        removed
    }

    /// Number of handlers registered for `event`.
    #[cfg(test)]
    pub fn handler_count(&self, event: &str) -> usize {
        let guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(event).map_or(0, |l| l.len())
    }

    /// Deliver an event. Returns the number of handlers that saw it.
    pub fn dispatch(&self, event: &str, payload: &serde_json::Value) -> usize {
        let listeners = {
            let guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
            guard.get(event).cloned()
        };
        match listeners {
            Some(l) => {
                let n = l.len();
                l.publish(payload);
                n
            }
            None => {
                tracing::debug!("No handler for signaling event {}", event);
                0
            }
        }
    }
}
