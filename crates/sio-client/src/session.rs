//! Connection manager.
//!
//! A [`Session`] boots a script engine on its own thread, constructs the
//! protocol client there, and translates the client's lifecycle
//! notifications into [`SessionState`] transitions and observer calls.
//! Handles are cheap to clone; the session closes when the last one drops.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use parking_lot::{Mutex, RwLock};
use sio_core::{
    BridgeError, ErrorPayload, EventIdentifier, LifecycleEvent, LifecycleKind, SessionConfig,
    SessionId, SessionState, Value,
};
use sio_engine::{
    BridgeFn, EngineError, EngineFactory, EngineHost, EngineValue, ObserverExecutor, ObserverQueue,
    ObserverThread, ScriptEngine,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::marshal::{decode_args, encode_args};
use crate::observers::LifecycleObservers;
use crate::registry::{EventRegistry, Subscription};
use crate::script;
use crate::stats::{SessionStats, StatsSnapshot};

/// Name of the default observer thread.
pub const OBSERVER_THREAD_NAME: &str = "sio-observer";

type Responder = Box<dyn FnOnce(Option<Session>) + Send>;

/// Optional knobs for [`Session::open_with`].
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Where observers and the open response run. Defaults to a dedicated
    /// `sio-observer` thread owned by the session.
    pub executor: Option<Arc<dyn ObserverExecutor>>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    endpoint: String,
    config: SessionConfig,
    state: RwLock<SessionState>,
    observers: Arc<LifecycleObservers>,
    registry: EventRegistry,
    host: EngineHost,
    delivery: ObserverQueue,
    observer_thread: Option<Arc<ObserverThread>>,
    closed: AtomicBool,
    client_ready: AtomicBool,
    stats: Arc<SessionStats>,
}

impl Session {
    /// Open a session against `endpoint`.
    ///
    /// `response` runs exactly once on the observer executor: with the
    /// session once the protocol client exists, or with `None` if the
    /// config is invalid, the engine cannot boot, or the client factory
    /// yields nothing.
    pub fn open<F>(endpoint: &str, config: SessionConfig, factory: Box<dyn EngineFactory>, response: F)
    where
        F: FnOnce(Option<Session>) + Send + 'static,
    {
        Self::open_with(endpoint, config, factory, SessionOptions::default(), response);
    }

    pub fn open_with<F>(
        endpoint: &str,
        config: SessionConfig,
        factory: Box<dyn EngineFactory>,
        options: SessionOptions,
        response: F,
    ) where
        F: FnOnce(Option<Session>) + Send + 'static,
    {
        let id = SessionId::new();
        let (executor, observer_thread) = match options.executor {
            Some(executor) => (executor, None),
            None => match ObserverThread::spawn(OBSERVER_THREAD_NAME) {
                Ok(thread) => {
                    let thread = Arc::new(thread);
                    let executor: Arc<dyn ObserverExecutor> = thread.clone();
                    (executor, Some(thread))
                }
                Err(e) => {
                    error!(session = %id, error = %e, "observer thread unavailable");
                    response(None);
                    return;
                }
            },
        };
        let delivery = ObserverQueue::new(executor);

        if let Err(e) = config.validate() {
            warn!(session = %id, error = %e, "rejecting session config");
            respond(&delivery, Box::new(response), None);
            return;
        }

        let factory_name = factory.library().factory;
        let inner = Arc::new(SessionInner {
            host: EngineHost::new().with_label(id.to_string()),
            id,
            endpoint: endpoint.to_string(),
            config,
            state: RwLock::new(SessionState::Idle),
            observers: Arc::new(LifecycleObservers::default()),
            registry: EventRegistry::new(),
            delivery,
            observer_thread,
            closed: AtomicBool::new(false),
            client_ready: AtomicBool::new(false),
            stats: Arc::new(SessionStats::default()),
        });
        inner.transition(SessionState::on_boot_started, "open");
        info!(session = %inner.id, endpoint = %inner.endpoint, "opening session");

        let responder: Arc<Mutex<Option<Responder>>> = Arc::new(Mutex::new(Some(Box::new(response))));
        let boot_session = Session {
            inner: Arc::clone(&inner),
        };
        let boot_responder = Arc::clone(&responder);

        // On success the boot handle itself becomes the caller's session, so
        // nothing on the engine thread keeps it alive afterwards.
        let started = inner.host.start(factory, move |ready| {
            let ok = boot_session.inner.finish_boot(ready, &factory_name);
            let delivery = boot_session.inner.delivery.clone();
            let response = boot_responder.lock().take();
            if let Some(response) = response {
                if ok {
                    respond(&delivery, response, Some(boot_session));
                } else {
                    // Queue the answer before the handle drops and stops the observer.
                    respond(&delivery, response, None);
                }
            }
        });

        if let Err(err) = started {
            inner.boot_failed(&err);
            if let Some(response) = responder.lock().take() {
                respond(&inner.delivery, response, None);
            }
        }
    }

    /// Async form of [`Session::open`].
    pub async fn connect(
        endpoint: &str,
        config: SessionConfig,
        factory: Box<dyn EngineFactory>,
    ) -> Option<Session> {
        let (tx, rx) = oneshot::channel();
        Self::open(endpoint, config, factory, move |session| {
            let _ = tx.send(session);
        });
        rx.await.ok().flatten()
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.inner.delivery.suppressed())
    }

    /// Subscribed event names.
    pub fn events(&self) -> Vec<String> {
        self.inner.registry.events()
    }

    /// True once a closed session's engine and observer threads have exited.
    pub fn is_released(&self) -> bool {
        let inner = &self.inner;
        inner.is_closed()
            && inner.host.is_finished()
            && inner
                .observer_thread
                .as_ref()
                .map_or(true, |thread| thread.is_finished())
    }

    /// The engine owner thread, once it has started.
    pub fn engine_thread(&self) -> Option<ThreadId> {
        self.inner.host.owner_thread()
    }

    pub fn on_connect<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        self.inner.observers.set_connect(Arc::new(f));
    }

    pub fn on_disconnect<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        self.inner.observers.set_disconnect(Arc::new(f));
    }

    pub fn on_error<F: Fn(ErrorPayload) + Send + Sync + 'static>(&self, f: F) {
        self.inner.observers.set_error(Arc::new(f));
    }

    /// `f` receives the number of attempts it took to reconnect.
    pub fn on_reconnect<F: Fn(u32) + Send + Sync + 'static>(&self, f: F) {
        self.inner.observers.set_reconnect(Arc::new(f));
    }

    /// `f` receives the 1-based attempt number.
    pub fn on_reconnect_attempt<F: Fn(u32) + Send + Sync + 'static>(&self, f: F) {
        self.inner.observers.set_reconnect_attempt(Arc::new(f));
    }

    pub fn on_reconnect_error<F: Fn(ErrorPayload) + Send + Sync + 'static>(&self, f: F) {
        self.inner.observers.set_reconnect_error(Arc::new(f));
    }

    /// Deliver every future `event` to `handler` on the observer executor.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Result<Subscription, BridgeError>
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(BridgeError::SessionClosed);
        }

        let weak = Arc::downgrade(inner);
        let subscription = inner
            .registry
            .register(event, Arc::new(handler), |identifier| {
                inner.install_event_bridge(weak, event, identifier)
            })
            .inspect_err(|e| {
                warn!(session = %inner.id, event, kind = e.error_kind(), error = %e, "subscribe refused");
            })?;

        // close() may have cleared the registry between the check above and
        // the insert.
        if inner.is_closed() {
            inner.registry.unregister(&subscription, |event, identifier| {
                inner.uninstall_event_bridge(event, identifier)
            });
            debug!(session = %inner.id, event, "subscribe raced with close");
            return Err(BridgeError::SessionClosed);
        }

        debug!(session = %inner.id, event, identifier = %subscription.identifier(), "subscribed");
        Ok(subscription)
    }

    /// Remove one handler. Returns whether it was still registered.
    pub fn unsubscribe(&self, subscription: &Subscription) -> Result<bool, BridgeError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(BridgeError::SessionClosed);
        }
        Ok(inner
            .registry
            .unregister(subscription, |event, identifier| {
                inner.uninstall_event_bridge(event, identifier)
            }))
    }

    /// Remove every handler for `event`. Returns how many were removed.
    pub fn unsubscribe_event(&self, event: &str) -> Result<usize, BridgeError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(BridgeError::SessionClosed);
        }
        Ok(inner.registry.remove_event(event, |event, identifier| {
            inner.uninstall_event_bridge(event, identifier)
        }))
    }

    /// Emit `event` with `args`. Arguments the engine cannot represent are
    /// dropped with a warning; the rest are still sent.
    pub fn send(&self, event: &str, args: Vec<Value>) -> Result<(), BridgeError> {
        let inner = &self.inner;
        if inner.is_closed() {
            debug!(session = %inner.id, event, "send after close ignored");
            return Err(BridgeError::SessionClosed);
        }

        let (encoded, dropped) = encode_args(event, &args);
        let statement = script::emit(event, &encoded);
        inner
            .host
            .queue()
            .evaluate(statement)
            .map_err(|_| BridgeError::SessionClosed)?;
        inner.stats.record_sent(dropped);
        trace!(session = %inner.id, event, args = encoded.len(), dropped, "event queued");
        Ok(())
    }

    /// Disconnect and release the engine. Idempotent. Returns without
    /// waiting for a running observer callback or engine job.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

/// Run the open response on the observer executor, bypassing the delivery
/// gate so a failed session still answers.
fn respond(delivery: &ObserverQueue, response: Responder, session: Option<Session>) {
    if let Err(e) = delivery.deliver_ungated(move || response(session)) {
        error!(error = %e, "could not deliver session response");
    }
}

impl SessionInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Apply a state transition and log it.
    fn transition(
        &self,
        step: impl FnOnce(SessionState) -> Option<SessionState>,
        cause: &str,
    ) -> Option<SessionState> {
        let mut state = self.state.write();
        let next = step(*state)?;
        let from = std::mem::replace(&mut *state, next);
        drop(state);
        info!(session = %self.id, from = %from, to = %next, cause, "session state changed");
        Some(next)
    }

    fn boot_failed(&self, err: &EngineError) {
        error!(session = %self.id, kind = err.kind(), error = %err, "session boot failed");
        self.transition(SessionState::on_boot_failed, "boot_failed");
    }

    /// Runs on the engine thread once the engine is up (or failed to come up).
    fn finish_boot(self: &Arc<Self>, ready: Result<&mut dyn ScriptEngine, EngineError>, factory: &str) -> bool {
        let result = ready.and_then(|engine| self.construct_client(engine, factory));
        match result {
            Ok(()) => true,
            Err(err) => {
                self.boot_failed(&err);
                false
            }
        }
    }

    fn construct_client(self: &Arc<Self>, engine: &mut dyn ScriptEngine, factory: &str) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Exception("session closed during boot".into()));
        }

        engine.evaluate(&script::construct_client(factory, &self.endpoint, &self.config))?;
        if engine.evaluate(script::CLIENT_GLOBAL)?.is_nullish() {
            return Err(EngineError::Exception("client factory returned no client".into()));
        }

        for kind in LifecycleKind::ALL {
            let weak = Arc::downgrade(self);
            engine.define_bridge(
                kind.bridge_name(),
                Arc::new(move |args: Vec<EngineValue>| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_lifecycle(kind, args);
                    }
                }),
            );
            engine.evaluate(&script::listen(kind.engine_event(), kind.bridge_name()))?;
        }

        self.client_ready.store(true, Ordering::Release);
        info!(session = %self.id, endpoint = %self.endpoint, "protocol client constructed");
        Ok(())
    }

    /// Bridge target for lifecycle notifications. Runs on the engine thread.
    fn on_lifecycle(&self, kind: LifecycleKind, args: Vec<EngineValue>) {
        let event = LifecycleEvent::from_args(kind, decode_args(args));
        debug!(session = %self.id, kind = kind.as_str(), "lifecycle notification");

        match &event {
            LifecycleEvent::Error(payload) | LifecycleEvent::ReconnectError(payload) => {
                warn!(session = %self.id, kind = kind.as_str(), payload = ?payload, "protocol error");
            }
            _ => {}
        }

        let auto_reconnect = self.config.auto_reconnect;
        self.transition(|state| state.on_lifecycle(kind, auto_reconnect), kind.as_str());

        if !kind.has_observer() {
            return;
        }
        let observers = Arc::clone(&self.observers);
        let stats = Arc::clone(&self.stats);
        self.delivery.deliver(move || {
            if observers.notify(event) {
                stats.record_lifecycle_delivery();
            }
        });
    }

    /// Bridge target for subscribed events. Runs on the engine thread.
    fn on_event(&self, identifier: &EventIdentifier, args: Vec<EngineValue>) {
        let values = decode_args(args);
        let handlers = self.registry.handlers(identifier);
        trace!(session = %self.id, identifier = %identifier, handlers = handlers.len(), "event received");

        for handler in handlers {
            let values = values.clone();
            let stats = Arc::clone(&self.stats);
            self.delivery.deliver(move || {
                handler(values);
                stats.record_event_delivery();
            });
        }
    }

    /// Queue definition of the bridge for `event` and attach it as a listener.
    fn install_event_bridge(
        &self,
        weak: Weak<SessionInner>,
        event: &str,
        identifier: &EventIdentifier,
    ) -> Result<(), BridgeError> {
        let id = self.id.clone();
        let event = event.to_string();
        let identifier = identifier.clone();

        self.host
            .queue()
            .post(move |engine| {
                let target = identifier.clone();
                let bridge: BridgeFn = Arc::new(move |args: Vec<EngineValue>| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_event(&target, args);
                    }
                });
                engine.define_bridge(identifier.as_str(), bridge);
                if let Err(e) = engine.evaluate(&script::listen(&event, identifier.as_str())) {
                    warn!(session = %id, event = %event, error = %e, "failed to attach listener");
                }
            })
            .map_err(|_| BridgeError::SessionClosed)
    }

    fn uninstall_event_bridge(&self, event: &str, identifier: &EventIdentifier) {
        let id = self.id.clone();
        let statement = script::unlisten(event, identifier.as_str());
        let name = identifier.to_string();
        let posted = self.host.queue().post(move |engine| {
            if let Err(e) = engine.evaluate(&statement) {
                warn!(session = %id, error = %e, "failed to detach listener");
            }
            engine.remove_global(&name);
        });
        if posted.is_err() {
            debug!(session = %self.id, event, "engine stopped before listener removal");
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.delivery.close();
        self.transition(SessionState::on_close, "close");

        if self.client_ready.load(Ordering::Acquire) {
            let _ = self.host.queue().evaluate(script::disconnect());
        }
        self.host.shutdown();
        self.registry.clear();
        self.observers.clear();
        if let Some(thread) = &self.observer_thread {
            thread.stop();
        }
        info!(session = %self.id, stats = %self.stats.snapshot(self.delivery.suppressed()).to_json(), "session closed");
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sio_engine::loopback::{loopback, LoopbackOptions, LoopbackRemote};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    fn open(options: LoopbackOptions, config: SessionConfig) -> (Option<Session>, LoopbackRemote) {
        let (factory, remote) = loopback(options);
        let (tx, rx) = mpsc::channel();
        Session::open("http://localhost:8080", config, Box::new(factory), move |session| {
            tx.send(session).unwrap();
        });
        (rx.recv_timeout(WAIT).unwrap(), remote)
    }

    #[test]
    fn open_installs_lifecycle_listeners() {
        let (session, remote) = open(LoopbackOptions::default(), SessionConfig::default());
        let session = session.unwrap();
        assert_eq!(session.state(), SessionState::Booting);
        assert_eq!(remote.endpoint().as_deref(), Some("http://localhost:8080"));
        for kind in LifecycleKind::ALL {
            assert_eq!(
                remote.listeners(kind.engine_event()),
                vec![kind.bridge_name().to_string()]
            );
        }
        assert!(session.engine_thread().is_some());
        session.close();
    }

    #[test]
    fn invalid_config_yields_no_session() {
        let config = SessionConfig::default().with_transports(Vec::new());
        let (session, remote) = open(LoopbackOptions::default(), config);
        assert!(session.is_none());
        assert_eq!(remote.evaluations(), 0);
    }

    #[test]
    fn unsubscribe_last_handler_detaches_listener() {
        let (session, remote) = open(LoopbackOptions::default(), SessionConfig::default());
        let session = session.unwrap();
        let first = session.subscribe("chat", |_| {}).unwrap();
        let second = session.subscribe("chat", |_| {}).unwrap();
        assert!(remote.barrier(WAIT));
        assert_eq!(remote.listeners("chat").len(), 1);

        assert_eq!(session.unsubscribe(&first), Ok(true));
        assert!(remote.barrier(WAIT));
        assert_eq!(remote.listeners("chat").len(), 1);

        assert_eq!(session.unsubscribe(&second), Ok(true));
        assert!(remote.barrier(WAIT));
        assert!(remote.listeners("chat").is_empty());
        assert!(!remote.has_global(second.identifier().as_str()));
        assert!(session.events().is_empty());
        session.close();
    }

    #[test]
    fn unsubscribe_event_removes_all_handlers() {
        let (session, remote) = open(LoopbackOptions::default(), SessionConfig::default());
        let session = session.unwrap();
        session.subscribe("typing", |_| {}).unwrap();
        session.subscribe("typing", |_| {}).unwrap();
        assert_eq!(session.unsubscribe_event("typing"), Ok(2));
        assert!(remote.barrier(WAIT));
        assert!(remote.listeners("typing").is_empty());
        session.close();
    }

    #[test]
    fn calls_after_close_fail_cleanly() {
        let (session, _remote) = open(LoopbackOptions::default(), SessionConfig::default());
        let session = session.unwrap();
        let sub = session.subscribe("x", |_| {}).unwrap();
        session.close();
        assert!(session.is_closed());
        assert!(matches!(session.subscribe("x", |_| {}), Err(BridgeError::SessionClosed)));
        assert!(matches!(session.unsubscribe(&sub), Err(BridgeError::SessionClosed)));
        assert!(matches!(session.unsubscribe_event("x"), Err(BridgeError::SessionClosed)));
    }

    #[test]
    fn dropping_last_handle_closes_session() {
        let (session, remote) = open(LoopbackOptions::default(), SessionConfig::default());
        drop(session);
        assert!(eventually(|| remote.is_torn_down()));
        assert!(remote.is_client_closed());
    }

    #[test]
    fn subscribe_racing_close_leaves_nothing_registered() {
        for _ in 0..20 {
            let (session, _remote) = open(LoopbackOptions::default(), SessionConfig::default());
            let session = session.unwrap();
            let subscriber = session.clone();
            let worker = std::thread::spawn(move || {
                let mut accepted = 0;
                while subscriber.subscribe("race", |_| {}).is_ok() {
                    accepted += 1;
                }
                accepted
            });

            std::thread::sleep(Duration::from_millis(1));
            session.close();
            worker.join().unwrap();
            assert!(session.events().is_empty());
        }
    }

    #[test]
    fn close_from_inside_an_observer_returns() {
        let (session, remote) = open(LoopbackOptions::default(), SessionConfig::default());
        let session = session.unwrap();
        let (tx, rx) = mpsc::channel();
        let closer = session.clone();
        let tx = Mutex::new(tx);
        session.on_connect(move || {
            closer.close();
            tx.lock().send(closer.is_closed()).unwrap();
        });
        remote.connect();
        assert_eq!(rx.recv_timeout(WAIT), Ok(true));
        assert!(eventually(|| session.is_released()));
    }
}
