use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span};

use crate::dispatch::{EngineCommand, EngineQueue};
use crate::engine::{EngineError, EngineFactory, ScriptEngine, BLOB_HELPER};

/// Name of the engine owner thread.
pub const ENGINE_THREAD_NAME: &str = "sio-engine";

/// Log an engine exception. Exceptions never propagate past the host.
pub fn report_exception(err: &EngineError) {
    error!(kind = err.kind(), error = %err, "engine exception");
}

/// Owns the engine thread for one session.
///
/// The thread that creates the engine is its permanent owner; every
/// evaluation and every bridge invocation happens there.
pub struct EngineHost {
    label: String,
    queue: EngineQueue,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<EngineCommand>>>,
    owner: Arc<OnceLock<ThreadId>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EngineHost {
    pub fn new() -> Self {
        let (queue, receiver) = EngineQueue::channel();
        Self {
            label: String::new(),
            queue,
            receiver: Mutex::new(Some(receiver)),
            owner: Arc::new(OnceLock::new()),
            handle: Mutex::new(None),
        }
    }

    /// Label attached to every log line emitted on the engine thread.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Spawn the owner thread and boot the engine on it.
    ///
    /// `on_ready` runs on the owner thread once the library and the blob
    /// helper are loaded, or with the boot error. Queued jobs run after it
    /// returns.
    pub fn start<F>(&self, factory: Box<dyn EngineFactory>, on_ready: F) -> Result<(), EngineError>
    where
        F: FnOnce(Result<&mut dyn ScriptEngine, EngineError>) + Send + 'static,
    {
        let mut receiver = self.receiver.lock().take().ok_or(EngineError::AlreadyStarted)?;
        let queue = self.queue.clone();
        let owner = Arc::clone(&self.owner);
        let label = self.label.clone();

        let handle = std::thread::Builder::new()
            .name(ENGINE_THREAD_NAME.to_string())
            .spawn(move || {
                let span = info_span!("engine", session = %label);
                let _enter = span.enter();
                let _ = owner.set(std::thread::current().id());

                let mut engine = match boot(factory, queue) {
                    Ok(engine) => engine,
                    Err(err) => {
                        error!(kind = err.kind(), error = %err, "engine boot failed");
                        on_ready(Err(err));
                        return;
                    }
                };
                info!("engine ready");
                let ready: &mut dyn ScriptEngine = engine.as_mut();
                on_ready(Ok(ready));

                run_jobs(&mut receiver, engine.as_mut());
                engine.teardown();
                debug!("engine thread exiting");
            })
            .map_err(|e| EngineError::ThreadSpawn(e.to_string()))?;

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    pub fn queue(&self) -> &EngineQueue {
        &self.queue
    }

    pub fn owner_thread(&self) -> Option<ThreadId> {
        self.owner.get().copied()
    }

    pub fn is_owner_thread(&self) -> bool {
        self.owner_thread() == Some(std::thread::current().id())
    }

    /// Stop the owner thread after the jobs already queued. Returns
    /// without waiting; a job still running finishes on its own.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// True once the owner thread has torn the engine down and exited, or
    /// was never started.
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }
}

impl Default for EngineHost {
    fn default() -> Self {
        Self::new()
    }
}

fn boot(
    factory: Box<dyn EngineFactory>,
    queue: EngineQueue,
) -> Result<Box<dyn ScriptEngine>, EngineError> {
    let library = factory.library();
    let mut engine = factory.create(queue)?;
    engine.set_exception_sink(Arc::new(report_exception));
    engine.evaluate(&library.source)?;
    engine.evaluate(BLOB_HELPER)?;
    Ok(engine)
}

fn run_jobs(receiver: &mut mpsc::UnboundedReceiver<EngineCommand>, engine: &mut dyn ScriptEngine) {
    while let Some(command) = receiver.blocking_recv() {
        match command {
            EngineCommand::Run(job) => {
                if catch_unwind(AssertUnwindSafe(|| job(&mut *engine))).is_err() {
                    error!("engine job panicked");
                }
            }
            EngineCommand::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchError;
    use crate::loopback::{loopback, LoopbackOptions};
    use std::sync::mpsc as std_mpsc;
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

    #[test]
    fn boots_on_dedicated_thread_and_runs_jobs_there() {
        let (factory, remote) = loopback(LoopbackOptions::default());
        let host = EngineHost::new().with_label("test");
        let (tx, rx) = std_mpsc::channel();

        let ready_tx = tx.clone();
        host.start(Box::new(factory), move |result| {
            let name = std::thread::current().name().map(str::to_string);
            ready_tx.send((result.is_ok(), name)).unwrap();
        })
        .unwrap();

        let (ok, name) = rx.recv_timeout(WAIT).unwrap();
        assert!(ok);
        assert_eq!(name.as_deref(), Some(ENGINE_THREAD_NAME));
        assert!(remote.has_global("io"));
        assert!(remote.has_global("blob"));

        host.queue()
            .post(move |engine| {
                let value = engine.evaluate("[1, 'two']").unwrap();
                let same_thread = std::thread::current().name() == Some(ENGINE_THREAD_NAME);
                tx.send((same_thread, Some(format!("{value:?}")))).unwrap();
            })
            .unwrap();
        let (same_thread, value) = rx.recv_timeout(WAIT).unwrap();
        assert!(same_thread);
        assert_eq!(value.as_deref(), Some(r#"Array([Number(1.0), String("two")])"#));
        assert!(!host.is_owner_thread());
        assert!(host.owner_thread().is_some());

        host.shutdown();
        assert!(eventually(|| host.is_finished()));
        assert!(remote.is_torn_down());
        assert_eq!(host.queue().evaluate("1"), Err(DispatchError::EngineStopped));
    }

    #[test]
    fn shutdown_does_not_wait_for_a_running_job() {
        let (factory, remote) = loopback(LoopbackOptions::default());
        let host = EngineHost::new();
        host.start(Box::new(factory), |_| {}).unwrap();

        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let (entered_tx, entered_rx) = std_mpsc::channel();
        host.queue()
            .post(move |_| {
                entered_tx.send(()).unwrap();
                let _ = release_rx.recv_timeout(WAIT);
            })
            .unwrap();
        entered_rx.recv_timeout(WAIT).unwrap();

        let started = Instant::now();
        host.shutdown();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!host.is_finished());

        release_tx.send(()).unwrap();
        assert!(eventually(|| host.is_finished()));
        assert!(remote.is_torn_down());
    }

    #[test]
    fn unavailable_engine_reports_boot_error() {
        let (factory, _remote) = loopback(LoopbackOptions {
            engine_unavailable: true,
            ..Default::default()
        });
        let host = EngineHost::new();
        let (tx, rx) = std_mpsc::channel();
        host.start(Box::new(factory), move |result| {
            tx.send(result.err()).unwrap();
        })
        .unwrap();
        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            Some(EngineError::Unavailable(_))
        ));
        host.shutdown();
    }

    #[test]
    fn library_failure_reports_boot_error() {
        let (factory, remote) = loopback(LoopbackOptions {
            library_fails: true,
            ..Default::default()
        });
        let host = EngineHost::new();
        let (tx, rx) = std_mpsc::channel();
        host.start(Box::new(factory), move |result| {
            tx.send(result.err()).unwrap();
        })
        .unwrap();
        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            Some(EngineError::Exception(_))
        ));
        assert!(!remote.has_global("blob"));
        host.shutdown();
    }

    #[test]
    fn second_start_is_refused() {
        let (factory, _) = loopback(LoopbackOptions::default());
        let (second, _) = loopback(LoopbackOptions::default());
        let host = EngineHost::new();
        host.start(Box::new(factory), |_| {}).unwrap();
        assert_eq!(
            host.start(Box::new(second), |_| {}).err(),
            Some(EngineError::AlreadyStarted)
        );
        host.shutdown();
    }

    #[test]
    fn panicking_job_does_not_stop_the_thread() {
        let (factory, _remote) = loopback(LoopbackOptions::default());
        let host = EngineHost::new();
        host.start(Box::new(factory), |_| {}).unwrap();
        host.queue().post(|_| panic!("job bug")).unwrap();

        let (tx, rx) = std_mpsc::channel();
        host.queue().post(move |_| tx.send(()).unwrap()).unwrap();
        assert!(rx.recv_timeout(WAIT).is_ok());
        host.shutdown();
    }

    #[test]
    fn failed_evaluation_is_logged_not_fatal() {
        let (factory, _remote) = loopback(LoopbackOptions::default());
        let host = EngineHost::new();
        host.start(Box::new(factory), |_| {}).unwrap();
        host.queue().evaluate("missing_global.emit('x');").unwrap();
        host.queue().evaluate("'unterminated").unwrap();

        let (tx, rx) = std_mpsc::channel();
        host.queue()
            .post(move |engine| tx.send(engine.evaluate("true")).unwrap())
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(crate::engine::EngineValue::Bool(true)));
        host.shutdown();
    }
}
