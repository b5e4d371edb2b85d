//! Thread-affinity plumbing.
//!
//! Callers on any thread reach the engine through [`EngineQueue`], a FIFO
//! that never blocks the sender. Observer callbacks run on an
//! [`ObserverExecutor`], by default the dedicated [`ObserverThread`], behind
//! an [`ObserverQueue`] gate that stops deliveries once a session closes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::engine::ScriptEngine;
use crate::host::report_exception;

/// Work that runs on the engine owner thread with the engine in hand.
pub type EngineJob = Box<dyn FnOnce(&mut dyn ScriptEngine) + Send>;

/// Work that runs on the observer executor.
pub type ObserverJob = Box<dyn FnOnce() + Send>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("engine thread has stopped")]
    EngineStopped,

    #[error("observer executor has stopped")]
    ObserverStopped,
}

pub(crate) enum EngineCommand {
    Run(EngineJob),
    Shutdown,
}

/// Sending half of the engine owner thread's job queue.
#[derive(Clone)]
pub struct EngineQueue {
    tx: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineQueue {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<EngineCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a job for the owner thread.
    pub fn post<F>(&self, job: F) -> Result<(), DispatchError>
    where
        F: FnOnce(&mut dyn ScriptEngine) + Send + 'static,
    {
        self.tx
            .send(EngineCommand::Run(Box::new(job)))
            .map_err(|_| DispatchError::EngineStopped)
    }

    /// Queue a statement for evaluation. Exceptions it raises are logged.
    pub fn evaluate(&self, statement: impl Into<String>) -> Result<(), DispatchError> {
        let statement = statement.into();
        self.post(move |engine| {
            if let Err(err) = engine.evaluate(&statement) {
                report_exception(&err);
            }
        })
    }

    /// Ask the owner thread to stop after the jobs already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(EngineCommand::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Runs observer callbacks off the engine thread.
pub trait ObserverExecutor: Send + Sync {
    fn execute(&self, job: ObserverJob) -> Result<(), DispatchError>;
}

enum ObserverCommand {
    Run(ObserverJob),
    Stop,
}

/// Default executor: one dedicated thread running jobs in order.
pub struct ObserverThread {
    tx: mpsc::UnboundedSender<ObserverCommand>,
    thread_id: ThreadId,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ObserverThread {
    pub fn spawn(name: &str) -> Result<Self, DispatchError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ObserverCommand>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(command) = rx.blocking_recv() {
                    match command {
                        ObserverCommand::Run(job) => {
                            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                error!("observer callback panicked");
                            }
                        }
                        ObserverCommand::Stop => break,
                    }
                }
                debug!("observer thread exiting");
            })
            .map_err(|e| {
                error!(error = %e, "failed to spawn observer thread");
                DispatchError::ObserverStopped
            })?;

        Ok(Self {
            tx,
            thread_id: handle.thread().id(),
            stopped: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Stop after the jobs already queued. Never waits for a running
    /// callback; the thread finishes on its own.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(ObserverCommand::Stop);
    }

    /// True once the thread has run its last job and exited.
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }
}

impl ObserverExecutor for ObserverThread {
    fn execute(&self, job: ObserverJob) -> Result<(), DispatchError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(DispatchError::ObserverStopped);
        }
        self.tx
            .send(ObserverCommand::Run(job))
            .map_err(|_| DispatchError::ObserverStopped)
    }
}

impl Drop for ObserverThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Delivery gate in front of an executor.
///
/// The open flag is checked when a delivery is queued and again when it
/// runs, so nothing queued before `close()` reaches an observer afterwards.
#[derive(Clone)]
pub struct ObserverQueue {
    executor: Arc<dyn ObserverExecutor>,
    open: Arc<AtomicBool>,
    suppressed: Arc<AtomicU64>,
}

impl ObserverQueue {
    pub fn new(executor: Arc<dyn ObserverExecutor>) -> Self {
        Self {
            executor,
            open: Arc::new(AtomicBool::new(true)),
            suppressed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue `f` on the executor. Returns false when the gate is closed or
    /// the executor is gone.
    pub fn deliver<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_open() {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let open = Arc::clone(&self.open);
        let suppressed = Arc::clone(&self.suppressed);
        let job: ObserverJob = Box::new(move || {
            if open.load(Ordering::Acquire) {
                f();
            } else {
                suppressed.fetch_add(1, Ordering::Relaxed);
            }
        });

        match self.executor.execute(job) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "dropping observer delivery");
                false
            }
        }
    }

    /// Run `f` on the executor without consulting the gate.
    pub fn deliver_ungated<F>(&self, f: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.executor.execute(Box::new(f))
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Deliveries refused or discarded because the gate was closed.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}
