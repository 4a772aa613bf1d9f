//! Per-node event bus.
//!
//! Handlers run synchronously on the emitting thread, in subscription order.
//! Forwarding to the parent is a plain subscription holding a weak reference
//! to the parent bus, installed when the node is constructed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::{HmrError, Result};

/// Event handler. Payloads are JSON values.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one subscription within a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Publish/subscribe channel owned by one dependency node.
pub struct EventBus {
    listeners: Mutex<FxHashMap<String, Vec<(ListenerId, Handler)>>>,
    next_id: AtomicU64,
    max_listeners: usize,
}

impl EventBus {
    pub fn new(max_listeners: usize) -> Self {
        Self {
            listeners: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(0),
            max_listeners,
        }
    }

    /// Register `handler` for `event`.
    ///
    /// Fails with [`HmrError::ListenerLimit`] once `max_listeners` handlers
    /// are registered for the same event name. A limit of 0 means unlimited.
    pub fn on(&self, event: &str, handler: Handler) -> Result<ListenerId> {
        let mut listeners = self.listeners.lock();
        let slot = listeners.entry(event.to_string()).or_default();
        if self.max_listeners > 0 && slot.len() >= self.max_listeners {
            return Err(HmrError::ListenerLimit {
                event: event.to_string(),
                max: self.max_listeners,
            });
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        slot.push((id, handler));
        Ok(id)
    }

    /// Like [`on`](Self::on), but returns a handle that can unsubscribe later.
    pub fn subscribe(self: &Arc<Self>, event: &str, handler: Handler) -> Result<Subscription> {
        let id = self.on(event, handler)?;
        Ok(Subscription {
            bus: Arc::downgrade(self),
            event: event.to_string(),
            id,
        })
    }

    /// Remove one handler. Returns false if it was already gone.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(slot) = listeners.get_mut(event) else {
            return false;
        };
        let before = slot.len();
        slot.retain(|(lid, _)| *lid != id);
        let removed = slot.len() != before;
        if slot.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Invoke every handler for `event`. Returns how many ran.
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        // Snapshot so handlers may subscribe, unsubscribe or emit re-entrantly.
        let handlers: Vec<Handler> = match self.listeners.lock().get(event) {
            Some(slot) => slot.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.lock().get(event).map_or(0, Vec::len)
    }

    /// Drop every handler.
    pub(crate) fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Re-emit `events` on `parent`. The parent is held weakly.
    pub(crate) fn forward_to(&self, parent: &Arc<EventBus>, events: &[String]) -> Result<()> {
        for event in events {
            let target: Weak<EventBus> = Arc::downgrade(parent);
            let name = event.clone();
            self.on(
                event,
                Arc::new(move |payload: &Value| {
                    if let Some(parent) = target.upgrade() {
                        parent.emit(&name, payload);
                    }
                }),
            )?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.lock();
        f.debug_struct("EventBus")
            .field("events", &listeners.keys().collect::<Vec<_>>())
            .field("max_listeners", &self.max_listeners)
            .finish()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it keeps the handler registered; call [`unsubscribe`](Self::unsubscribe).
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<EventBus>,
    event: String,
    id: ListenerId,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the handler. No-op if the bus (or its node) is gone.
    pub fn unsubscribe(self) -> bool {
        self.bus
            .upgrade()
            .is_some_and(|bus| bus.off(&self.event, self.id))
    }
}
