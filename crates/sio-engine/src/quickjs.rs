//! Script engine backed by QuickJS (`rquickjs`).
//!
//! The runtime and context live on the engine owner thread. Bridges are
//! real native functions installed as globals; promise jobs queued by an
//! evaluation are drained before the evaluation returns.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rquickjs::function::Rest;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Object, Runtime, Value};
use tracing::{debug, error, warn};

use crate::dispatch::EngineQueue;
use crate::engine::{
    BridgeFn, ClientLibrary, EngineError, EngineFactory, EngineValue, ExceptionSink, ScriptEngine,
};

/// Host globals QuickJS does not provide. Evaluated before the client library.
const PRELUDE: &str = r#"
if (typeof globalThis.Blob === 'undefined') {
  globalThis.Blob = class Blob {
    constructor(parts) {
      Object.defineProperty(this, '__sioBlobText', {
        value: (parts || []).map(String).join(''),
      });
    }
    get size() { return this.__sioBlobText.length; }
    text() { return Promise.resolve(this.__sioBlobText); }
  };
}
"#;

/// Property holding a prelude `Blob`'s contents.
const BLOB_TEXT: &str = "__sioBlobText";

/// Nesting depth past which values come back as handles.
const MAX_DEPTH: usize = 32;

/// Values converted per call before the rest come back as handles.
const MAX_NODES: usize = 10_000;

/// Builds a QuickJS engine around a client library.
pub struct QuickJsFactory {
    library: ClientLibrary,
    memory_limit: Option<usize>,
    queue: Arc<OnceLock<EngineQueue>>,
}

impl QuickJsFactory {
    pub fn new(library: ClientLibrary) -> Self {
        Self {
            library,
            memory_limit: None,
            queue: Arc::new(OnceLock::new()),
        }
    }

    /// Read the library source from `path`. `factory` is the global the
    /// library defines to construct a client.
    pub fn from_file(path: &Path, factory: impl Into<String>) -> std::io::Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Ok(Self::new(ClientLibrary::new(source, factory)))
    }

    /// Cap the engine heap.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Handle for reaching the engine from other threads once it runs.
    pub fn handle(&self) -> QuickJsHandle {
        QuickJsHandle {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl EngineFactory for QuickJsFactory {
    fn library(&self) -> ClientLibrary {
        self.library.clone()
    }

    fn create(self: Box<Self>, queue: EngineQueue) -> Result<Box<dyn ScriptEngine>, EngineError> {
        let runtime = Runtime::new().map_err(|e| EngineError::Unavailable(e.to_string()))?;
        if let Some(limit) = self.memory_limit {
            runtime.set_memory_limit(limit);
        }
        let context = Context::full(&runtime).map_err(|e| EngineError::Unavailable(e.to_string()))?;

        let mut engine = QuickJsEngine {
            context,
            runtime,
            sink: None,
        };
        engine.evaluate(PRELUDE)?;
        let _ = self.queue.set(queue);
        debug!(memory_limit = ?self.memory_limit, "quickjs engine created");
        Ok(Box::new(engine))
    }
}

/// Cross-thread access to a running QuickJS engine. Cheap to clone.
#[derive(Clone)]
pub struct QuickJsHandle {
    queue: Arc<OnceLock<EngineQueue>>,
}

impl QuickJsHandle {
    pub fn is_running(&self) -> bool {
        self.queue.get().is_some_and(|queue| !queue.is_closed())
    }

    /// Queue `source` for evaluation. Exceptions are logged. Returns false
    /// when the engine is not running.
    pub fn evaluate(&self, source: impl Into<String>) -> bool {
        self.queue
            .get()
            .is_some_and(|queue| queue.evaluate(source).is_ok())
    }

    /// Evaluate `source` after every job queued before it and wait up to
    /// `timeout` for the result.
    pub fn query(&self, source: &str, timeout: Duration) -> Option<Result<EngineValue, EngineError>> {
        let queue = self.queue.get()?;
        let (tx, rx) = std_mpsc::channel();
        let source = source.to_string();
        queue
            .post(move |engine| {
                let _ = tx.send(engine.evaluate(&source));
            })
            .ok()?;
        rx.recv_timeout(timeout).ok()
    }
}

pub struct QuickJsEngine {
    context: Context,
    runtime: Runtime,
    sink: Option<ExceptionSink>,
}

impl QuickJsEngine {
    /// Run promise jobs until none are left.
    fn drain_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => self.report(&EngineError::Exception(
                    "uncaught exception in pending job".into(),
                )),
            }
        }
    }

    fn report(&self, err: &EngineError) {
        match &self.sink {
            Some(sink) => sink(err),
            None => error!(kind = err.kind(), error = %err, "unreported engine exception"),
        }
    }
}

impl ScriptEngine for QuickJsEngine {
    fn evaluate(&mut self, source: &str) -> Result<EngineValue, EngineError> {
        let result = self.context.with(|ctx| {
            ctx.eval::<Value, _>(source)
                .catch(&ctx)
                .map(|value| to_engine_value(&value))
                .map_err(engine_error)
        });
        self.drain_jobs();
        result
    }

    fn define_bridge(&mut self, name: &str, bridge: BridgeFn) {
        let installed = self.context.with(|ctx| install_bridge(&ctx, name, bridge));
        if let Err(e) = installed {
            warn!(global = name, error = %e, "failed to install bridge");
        }
    }

    fn remove_global(&mut self, name: &str) {
        let removed = self.context.with(|ctx| ctx.globals().remove(name));
        if let Err(e) = removed {
            warn!(global = name, error = %e, "failed to remove global");
        }
    }

    fn set_exception_sink(&mut self, sink: ExceptionSink) {
        self.sink = Some(sink);
    }

    fn teardown(&mut self) {
        self.sink = None;
        self.runtime.run_gc();
        debug!("quickjs engine torn down");
    }
}

fn install_bridge<'js>(ctx: &Ctx<'js>, name: &str, bridge: BridgeFn) -> rquickjs::Result<()> {
    let global = name.to_string();
    let function = Function::new(ctx.clone(), move |args: Rest<Value<'js>>| {
        let mut budget = Budget::default();
        let values: Vec<EngineValue> = args.0.iter().map(|arg| budget.convert(arg, 0)).collect();
        // A panic must not unwind into the engine.
        if catch_unwind(AssertUnwindSafe(|| bridge(values))).is_err() {
            error!(global = %global, "bridge panicked");
        }
    })?;
    ctx.globals().set(name, function)
}

fn engine_error(err: CaughtError<'_>) -> EngineError {
    match err {
        CaughtError::Exception(exception) => {
            let message = exception.message().unwrap_or_default();
            let name = exception.as_object().get::<_, String>("name").ok();
            match name.as_deref() {
                Some("SyntaxError") => EngineError::Syntax(message),
                Some("ReferenceError") => EngineError::Reference(message),
                Some(name) => EngineError::Exception(format!("{name}: {message}")),
                None => EngineError::Exception(message),
            }
        }
        other => EngineError::Exception(other.to_string()),
    }
}

fn to_engine_value(value: &Value<'_>) -> EngineValue {
    Budget::default().convert(value, 0)
}

/// Bounds one conversion so cyclic or huge object graphs terminate.
#[derive(Default)]
struct Budget {
    nodes: usize,
}

impl Budget {
    fn convert(&mut self, value: &Value<'_>, depth: usize) -> EngineValue {
        self.nodes += 1;
        if value.is_undefined() {
            return EngineValue::Undefined;
        }
        if value.is_null() {
            return EngineValue::Null;
        }
        if let Some(b) = value.as_bool() {
            return EngineValue::Bool(b);
        }
        if let Some(n) = value.as_int() {
            return EngineValue::Number(f64::from(n));
        }
        if let Some(n) = value.as_float() {
            return EngineValue::Number(n);
        }
        if let Some(s) = value.as_string() {
            return match s.to_string() {
                Ok(s) => EngineValue::String(s),
                Err(_) => EngineValue::Handle("string".into()),
            };
        }
        if value.is_function() {
            return EngineValue::Handle("function".into());
        }
        if depth >= MAX_DEPTH || self.nodes > MAX_NODES {
            return EngineValue::Handle("object".into());
        }
        if let Some(array) = value.as_array() {
            let items = array
                .iter::<Value>()
                .map(|item| match item {
                    Ok(item) => self.convert(&item, depth + 1),
                    Err(_) => EngineValue::Undefined,
                })
                .collect();
            return EngineValue::Array(items);
        }
        if let Some(object) = value.as_object() {
            return self.convert_object(object, depth);
        }
        EngineValue::Handle("value".into())
    }

    fn convert_object(&mut self, object: &Object<'_>, depth: usize) -> EngineValue {
        if let Ok(Some(text)) = object.get::<_, Option<String>>(BLOB_TEXT) {
            return EngineValue::Blob(text.into_bytes());
        }

        let mut map = BTreeMap::new();
        for entry in object.props::<String, Value>() {
            let Ok((key, value)) = entry else {
                continue;
            };
            let converted = self.convert(&value, depth + 1);
            map.insert(key, converted);
        }
        // Error objects keep `message` non-enumerable.
        if !map.contains_key("message") {
            if let Ok(Some(message)) = object.get::<_, Option<String>>("message") {
                map.insert("message".to_string(), EngineValue::String(message));
            }
        }
        EngineValue::Object(map)
    }
}
