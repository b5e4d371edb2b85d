use std::sync::Arc;

use parking_lot::RwLock;
use sio_core::{ErrorPayload, LifecycleEvent};

pub type NotifyFn = Arc<dyn Fn() + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(ErrorPayload) + Send + Sync>;
pub type CountFn = Arc<dyn Fn(u32) + Send + Sync>;

/// One optional observer per lifecycle kind. Setting a slot replaces the
/// previous observer; deliveries read the slot when they run.
#[derive(Default)]
pub struct LifecycleObservers {
    connect: RwLock<Option<NotifyFn>>,
    disconnect: RwLock<Option<NotifyFn>>,
    error: RwLock<Option<ErrorFn>>,
    reconnect: RwLock<Option<CountFn>>,
    reconnect_attempt: RwLock<Option<CountFn>>,
    reconnect_error: RwLock<Option<ErrorFn>>,
}

impl LifecycleObservers {
    pub fn set_connect(&self, f: NotifyFn) {
        *self.connect.write() = Some(f);
    }

    pub fn set_disconnect(&self, f: NotifyFn) {
        *self.disconnect.write() = Some(f);
    }

    pub fn set_error(&self, f: ErrorFn) {
        *self.error.write() = Some(f);
    }

    pub fn set_reconnect(&self, f: CountFn) {
        *self.reconnect.write() = Some(f);
    }

    pub fn set_reconnect_attempt(&self, f: CountFn) {
        *self.reconnect_attempt.write() = Some(f);
    }

    pub fn set_reconnect_error(&self, f: ErrorFn) {
        *self.reconnect_error.write() = Some(f);
    }

    /// Invoke the observer for `event`, if one is set. Returns whether one ran.
    pub fn notify(&self, event: LifecycleEvent) -> bool {
        match event {
            LifecycleEvent::Connect => call(&self.connect, |f| f()),
            LifecycleEvent::Disconnect => call(&self.disconnect, |f| f()),
            LifecycleEvent::Error(payload) => call(&self.error, |f| f(payload)),
            LifecycleEvent::Reconnect { attempts } => call(&self.reconnect, |f| f(attempts)),
            LifecycleEvent::ReconnectAttempt { attempt } => {
                call(&self.reconnect_attempt, |f| f(attempt))
            }
            LifecycleEvent::ReconnectError(payload) => call(&self.reconnect_error, |f| f(payload)),
            LifecycleEvent::ReconnectFailed => false,
        }
    }

    pub fn clear(&self) {
        *self.connect.write() = None;
        *self.disconnect.write() = None;
        *self.error.write() = None;
        *self.reconnect.write() = None;
        *self.reconnect_attempt.write() = None;
        *self.reconnect_error.write() = None;
    }
}

/// Clone the observer out of its slot so it runs without the lock held.
fn call<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>, invoke: impl FnOnce(&T)) -> bool {
    let observer = slot.read().clone();
    match observer {
        Some(f) => {
            invoke(f.as_ref());
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sio_core::Value;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn unset_slot_is_a_no_op() {
        let observers = LifecycleObservers::default();
        assert!(!observers.notify(LifecycleEvent::Connect));
        assert!(!observers.notify(LifecycleEvent::ReconnectFailed));
    }

    #[test]
    fn latest_observer_wins() {
        let observers = LifecycleObservers::default();
        let seen = Arc::new(AtomicU32::new(0));

        let first = Arc::clone(&seen);
        observers.set_reconnect_attempt(Arc::new(move |n: u32| first.store(n, Ordering::SeqCst)));
        let second = Arc::clone(&seen);
        observers.set_reconnect_attempt(Arc::new(move |n: u32| second.store(n * 10, Ordering::SeqCst)));

        assert!(observers.notify(LifecycleEvent::ReconnectAttempt { attempt: 2 }));
        assert_eq!(seen.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn error_payload_reaches_observer() {
        let observers = LifecycleObservers::default();
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        observers.set_error(Arc::new(move |payload: ErrorPayload| {
            let _ = tx.lock().send(payload);
        }));

        let payload = BTreeMap::from([("message".to_string(), Value::from("refused"))]);
        assert!(observers.notify(LifecycleEvent::Error(payload.clone())));
        assert_eq!(rx.try_recv().unwrap(), payload);
    }

    #[test]
    fn observer_may_replace_its_own_slot() {
        let observers = Arc::new(LifecycleObservers::default());
        let inner = Arc::clone(&observers);
        observers.set_connect(Arc::new(move || inner.set_connect(Arc::new(|| {}))));
        assert!(observers.notify(LifecycleEvent::Connect));
        assert!(observers.notify(LifecycleEvent::Connect));
    }

    #[test]
    fn clear_empties_every_slot() {
        let observers = LifecycleObservers::default();
        observers.set_connect(Arc::new(|| {}));
        observers.set_reconnect_error(Arc::new(|_: ErrorPayload| {}));
        observers.clear();
        assert!(!observers.notify(LifecycleEvent::Connect));
        assert!(!observers.notify(LifecycleEvent::ReconnectError(BTreeMap::new())));
    }
}
