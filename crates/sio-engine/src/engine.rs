use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::dispatch::EngineQueue;

/// Serialization helper evaluated after the client library. Binary
/// arguments are passed to the library as `blob('<text>')`.
pub const BLOB_HELPER: &str = "function blob(text) { return new Blob([text]); }";

/// A value as the script engine sees it.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<EngineValue>),
    Object(BTreeMap<String, EngineValue>),
    Blob(Vec<u8>),
    /// A live engine reference (function, client object). Never crosses
    /// into native values.
    Handle(String),
}

impl EngineValue {
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Blob(_) => "blob",
            Self::Handle(_) => "handle",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// Native function installed as an engine global. Always invoked on the
/// engine owner thread.
pub type BridgeFn = Arc<dyn Fn(Vec<EngineValue>) + Send + Sync>;

/// Receives exceptions the engine raises outside a direct evaluation.
pub type ExceptionSink = Arc<dyn Fn(&EngineError) + Send + Sync>;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("script engine unavailable: {0}")]
    Unavailable(String),

    #[error("SyntaxError: {0}")]
    Syntax(String),

    #[error("ReferenceError: {0}")]
    Reference(String),

    #[error("{0}")]
    Exception(String),

    #[error("failed to spawn engine thread: {0}")]
    ThreadSpawn(String),

    #[error("engine host already started")]
    AlreadyStarted,
}

impl EngineError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Syntax(_) => "syntax",
            Self::Reference(_) => "reference",
            Self::Exception(_) => "exception",
            Self::ThreadSpawn(_) => "thread_spawn",
            Self::AlreadyStarted => "already_started",
        }
    }
}

/// A single-threaded script execution context.
///
/// Implementations are created on, and never leave, the engine owner
/// thread. Other threads reach the engine only through [`EngineQueue`].
pub trait ScriptEngine {
    /// Evaluate source text and return the value of the last statement.
    fn evaluate(&mut self, source: &str) -> Result<EngineValue, EngineError>;

    /// Install a native function under a global name, replacing any
    /// previous binding.
    fn define_bridge(&mut self, name: &str, bridge: BridgeFn);

    fn remove_global(&mut self, name: &str);

    fn set_exception_sink(&mut self, sink: ExceptionSink);

    /// Release engine resources. Called once, on the owner thread, after
    /// the last job ran.
    fn teardown(&mut self) {}
}

/// Bundled protocol client library source.
#[derive(Clone, Debug)]
pub struct ClientLibrary {
    pub source: String,
    /// Global name of the client factory function the library defines.
    pub factory: String,
}

impl ClientLibrary {
    pub fn new(source: impl Into<String>, factory: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            factory: factory.into(),
        }
    }
}

/// Produces an engine on the owner thread.
pub trait EngineFactory: Send + 'static {
    fn library(&self) -> ClientLibrary;

    /// Create the engine. `queue` posts jobs back onto the owner thread and
    /// may be kept by the engine for work it schedules itself.
    fn create(self: Box<Self>, queue: EngineQueue) -> Result<Box<dyn ScriptEngine>, EngineError>;
}
