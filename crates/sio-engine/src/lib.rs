//! Script engine hosting: the engine abstraction, the dedicated owner
//! thread, the caller/observer dispatch queues, the QuickJS engine, and an
//! in-process loopback engine used as a test double.

pub mod dispatch;
pub mod engine;
pub mod host;
pub mod loopback;
pub mod quickjs;

pub use dispatch::{
    DispatchError, EngineJob, EngineQueue, ObserverExecutor, ObserverJob, ObserverQueue,
    ObserverThread,
};
pub use engine::{
    BridgeFn, ClientLibrary, EngineError, EngineFactory, EngineValue, ExceptionSink, ScriptEngine,
    BLOB_HELPER,
};
pub use host::EngineHost;
pub use quickjs::{QuickJsFactory, QuickJsHandle};
