//! Event subscriptions keyed by event identifier.
//!
//! Every handler for one event name shares a single engine-side bridge.
//! The first handler for a name installs it and the last one removes it;
//! both callbacks run while the registry entry is locked, so install and
//! uninstall statements are queued in the same order the registry changed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sio_core::{BridgeError, EventIdentifier, Value};

/// Native handler for a subscribed event.
pub type EventHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Token returned by `subscribe`; pass it back to unsubscribe one handler.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    event: String,
    identifier: EventIdentifier,
    handler_id: u64,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn identifier(&self) -> &EventIdentifier {
        &self.identifier
    }
}

struct Binding {
    event: String,
    handlers: Vec<(u64, EventHandler)>,
}

#[derive(Default)]
pub struct EventRegistry {
    bindings: DashMap<EventIdentifier, Binding>,
    next_handler: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `event`. `install` runs when this is the first
    /// handler for the name; if it fails nothing is registered.
    pub fn register<I>(
        &self,
        event: &str,
        handler: EventHandler,
        install: I,
    ) -> Result<Subscription, BridgeError>
    where
        I: FnOnce(&EventIdentifier) -> Result<(), BridgeError>,
    {
        self.register_as(EventIdentifier::for_event(event), event, handler, install)
    }

    pub(crate) fn register_as<I>(
        &self,
        identifier: EventIdentifier,
        event: &str,
        handler: EventHandler,
        install: I,
    ) -> Result<Subscription, BridgeError>
    where
        I: FnOnce(&EventIdentifier) -> Result<(), BridgeError>,
    {
        let handler_id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        let subscription = Subscription {
            event: event.to_string(),
            identifier: identifier.clone(),
            handler_id,
        };

        match self.bindings.entry(identifier) {
            Entry::Occupied(mut entry) => {
                if entry.get().event != event {
                    return Err(BridgeError::IdentifierCollision {
                        event: event.to_string(),
                        existing: entry.get().event.clone(),
                        identifier: entry.key().clone(),
                    });
                }
                entry.get_mut().handlers.push((handler_id, handler));
            }
            Entry::Vacant(entry) => {
                install(entry.key())?;
                entry.insert(Binding {
                    event: event.to_string(),
                    handlers: vec![(handler_id, handler)],
                });
            }
        }
        Ok(subscription)
    }

    /// Remove one handler. `uninstall` runs when it was the last handler
    /// for its name. Returns false if the subscription was not registered.
    pub fn unregister<U>(&self, subscription: &Subscription, uninstall: U) -> bool
    where
        U: FnOnce(&str, &EventIdentifier),
    {
        match self.bindings.entry(subscription.identifier.clone()) {
            Entry::Occupied(mut entry) => {
                let handlers = &mut entry.get_mut().handlers;
                let before = handlers.len();
                handlers.retain(|(id, _)| *id != subscription.handler_id);
                let removed = handlers.len() != before;
                if entry.get().handlers.is_empty() {
                    uninstall(&entry.get().event, entry.key());
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Remove every handler for `event`. Returns how many were removed.
    pub fn remove_event<U>(&self, event: &str, uninstall: U) -> usize
    where
        U: FnOnce(&str, &EventIdentifier),
    {
        match self.bindings.entry(EventIdentifier::for_event(event)) {
            Entry::Occupied(entry) if entry.get().event == event => {
                uninstall(event, entry.key());
                entry.remove().handlers.len()
            }
            _ => 0,
        }
    }

    /// Current handlers for an identifier, cloned out of the lock.
    pub fn handlers(&self, identifier: &EventIdentifier) -> Vec<EventHandler> {
        self.bindings
            .get(identifier)
            .map(|b| b.handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    pub fn event_name(&self, identifier: &EventIdentifier) -> Option<String> {
        self.bindings.get(identifier).map(|b| b.event.clone())
    }

    /// Subscribed event names, sorted.
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.bindings.iter().map(|b| b.event.clone()).collect();
        events.sort();
        events
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&self) {
        self.bindings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn noop() -> EventHandler {
        Arc::new(|_: Vec<Value>| {})
    }

    #[test]
    fn first_handler_installs_bridge_once() {
        let registry = EventRegistry::new();
        let installs = Mutex::new(Vec::new());

        for _ in 0..3 {
            registry
                .register("publish", noop(), |id| {
                    installs.lock().push(id.clone());
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(*installs.lock(), vec![EventIdentifier::for_event("publish")]);
        assert_eq!(registry.handlers(&EventIdentifier::for_event("publish")).len(), 3);
        assert_eq!(registry.events(), vec!["publish".to_string()]);
    }

    #[test]
    fn failed_install_registers_nothing() {
        let registry = EventRegistry::new();
        let result = registry.register("publish", noop(), |_| Err(BridgeError::SessionClosed));
        assert!(matches!(result, Err(BridgeError::SessionClosed)));
        assert!(registry.is_empty());
    }

    #[test]
    fn colliding_identifier_is_refused() {
        let registry = EventRegistry::new();
        let shared = EventIdentifier::from_raw("sio_evt_shared");
        registry
            .register_as(shared.clone(), "first", noop(), |_| Ok(()))
            .unwrap();

        let err = registry
            .register_as(shared.clone(), "second", noop(), |_| Ok(()))
            .unwrap_err();
        match err {
            BridgeError::IdentifierCollision {
                event,
                existing,
                identifier,
            } => {
                assert_eq!(event, "second");
                assert_eq!(existing, "first");
                assert_eq!(identifier, shared);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(registry.event_name(&shared).as_deref(), Some("first"));
        assert_eq!(registry.handlers(&shared).len(), 1);
    }

    #[test]
    fn last_unregister_uninstalls() {
        let registry = EventRegistry::new();
        let a = registry.register("chat", noop(), |_| Ok(())).unwrap();
        let b = registry.register("chat", noop(), |_| Ok(())).unwrap();
        let uninstalled = Mutex::new(Vec::new());

        assert!(registry.unregister(&a, |event, _| uninstalled.lock().push(event.to_string())));
        assert!(uninstalled.lock().is_empty());
        assert!(!registry.unregister(&a, |_, _| panic!("already removed")));

        assert!(registry.unregister(&b, |event, _| uninstalled.lock().push(event.to_string())));
        assert_eq!(*uninstalled.lock(), vec!["chat".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_event_drops_all_handlers() {
        let registry = EventRegistry::new();
        for _ in 0..4 {
            registry.register("typing", noop(), |_| Ok(())).unwrap();
        }
        registry.register("other", noop(), |_| Ok(())).unwrap();
        assert_eq!(registry.remove_event("typing", |_, _| {}), 4);
        assert_eq!(registry.remove_event("typing", |_, _| panic!("nothing left")), 0);
        assert_eq!(registry.len(), 1);
    }
}
