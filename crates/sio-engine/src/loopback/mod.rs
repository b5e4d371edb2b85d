//! In-process engine for tests and demos.
//!
//! [`LoopbackEngine`] interprets the statements the client emits against a
//! simulated protocol client. [`LoopbackRemote`] plays the server side: it
//! fires notifications into registered listeners (always on the engine
//! owner thread) and exposes what the session asked the client to do.

mod reader;

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::dispatch::EngineQueue;
use crate::engine::{
    BridgeFn, ClientLibrary, EngineError, EngineFactory, EngineValue, ExceptionSink, ScriptEngine,
    BLOB_HELPER,
};
use reader::{constant, parse_program, Expr, Statement};

/// Library source the loopback factory hands to the host.
pub const LOOPBACK_LIBRARY: &str = "/* loopback protocol client */";

const CLIENT_HANDLE: &str = "socket";

#[derive(Clone, Debug, Default)]
pub struct LoopbackOptions {
    /// Answer client emits the way the chat relay does: `connected` is
    /// announced as a join, `publish` is re-broadcast with its first
    /// argument only, and a named client leaving is announced to the
    /// other participants (see [`LoopbackRemote::broadcasts`]).
    pub relay: bool,
    /// `create` fails as if no engine could be obtained.
    pub engine_unavailable: bool,
    /// Evaluating the library source raises.
    pub library_fails: bool,
    /// The client factory returns `null`.
    pub refuse_client: bool,
}

/// One `emit` the client performed.
#[derive(Clone, Debug, PartialEq)]
pub struct Emission {
    pub event: String,
    pub args: Vec<EngineValue>,
}

enum Global {
    Value(EngineValue),
    Bridge(BridgeFn),
    Client,
    Native(&'static str),
}

struct Listener {
    event: String,
    bridge: String,
    callback: BridgeFn,
}

struct ClientState {
    endpoint: String,
    options: BTreeMap<String, EngineValue>,
    listeners: Vec<Listener>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    options: LoopbackOptions,
    queue: Option<EngineQueue>,
    globals: HashMap<String, Global>,
    client: Option<ClientState>,
    emitted: Vec<Emission>,
    /// Name announced by the last `connected` emit.
    joined: Option<String>,
    /// Everything the relay sent to all participants.
    broadcasts: Vec<Emission>,
    evaluations: usize,
    torn_down: bool,
    sink: Option<ExceptionSink>,
}

/// Build a factory and the remote that drives the engine it creates.
pub fn loopback(options: LoopbackOptions) -> (LoopbackFactory, LoopbackRemote) {
    let shared = Arc::new(Mutex::new(Shared {
        options,
        ..Default::default()
    }));
    (
        LoopbackFactory {
            shared: Arc::clone(&shared),
        },
        LoopbackRemote { shared },
    )
}

pub struct LoopbackFactory {
    shared: Arc<Mutex<Shared>>,
}

impl EngineFactory for LoopbackFactory {
    fn library(&self) -> ClientLibrary {
        ClientLibrary::new(LOOPBACK_LIBRARY, "io")
    }

    fn create(self: Box<Self>, queue: EngineQueue) -> Result<Box<dyn ScriptEngine>, EngineError> {
        let mut shared = self.shared.lock();
        if shared.options.engine_unavailable {
            return Err(EngineError::Unavailable("loopback engine disabled".into()));
        }
        shared.queue = Some(queue);
        drop(shared);
        Ok(Box::new(LoopbackEngine {
            shared: self.shared,
        }))
    }
}

pub struct LoopbackEngine {
    shared: Arc<Mutex<Shared>>,
}

/// Result of evaluating an expression before it is flattened to a value.
enum Operand {
    Value(EngineValue),
    Bridge(String, BridgeFn),
    Client,
}

impl Operand {
    fn into_value(self) -> EngineValue {
        match self {
            Self::Value(value) => value,
            Self::Bridge(name, _) => EngineValue::Handle(name),
            Self::Client => EngineValue::Handle(CLIENT_HANDLE.into()),
        }
    }
}

impl ScriptEngine for LoopbackEngine {
    fn evaluate(&mut self, source: &str) -> Result<EngineValue, EngineError> {
        let (result, relayed, queue) = {
            let mut shared = self.shared.lock();
            shared.evaluations += 1;
            trace!(source, "loopback evaluate");

            let mut interpreter = Interpreter {
                shared: &mut *shared,
                relayed: Vec::new(),
            };
            let result = interpreter.run(source);
            let relayed = std::mem::take(&mut interpreter.relayed);
            (result, relayed, shared.queue.clone())
        };

        if let Some(queue) = queue {
            for emission in relayed {
                post_delivery(&queue, &self.shared, emission.event, emission.args);
            }
        }
        result
    }

    fn define_bridge(&mut self, name: &str, bridge: BridgeFn) {
        self.shared
            .lock()
            .globals
            .insert(name.to_string(), Global::Bridge(bridge));
    }

    fn remove_global(&mut self, name: &str) {
        self.shared.lock().globals.remove(name);
    }

    fn set_exception_sink(&mut self, sink: ExceptionSink) {
        self.shared.lock().sink = Some(sink);
    }

    fn teardown(&mut self) {
        let mut shared = self.shared.lock();
        shared.torn_down = true;
        shared.globals.clear();
        if let Some(client) = shared.client.as_mut() {
            client.listeners.clear();
        }
        shared.sink = None;
        shared.queue = None;
        debug!("loopback engine torn down");
    }
}

struct Interpreter<'a> {
    shared: &'a mut Shared,
    relayed: Vec<Emission>,
}

impl Interpreter<'_> {
    fn run(&mut self, source: &str) -> Result<EngineValue, EngineError> {
        if source == LOOPBACK_LIBRARY {
            if self.shared.options.library_fails {
                return Err(EngineError::Exception("Error: protocol library failed to load".into()));
            }
            self.shared.globals.insert("io".into(), Global::Native("io"));
            return Ok(EngineValue::Undefined);
        }
        if source == BLOB_HELPER {
            self.shared.globals.insert("blob".into(), Global::Native("blob"));
            return Ok(EngineValue::Undefined);
        }

        let mut last = EngineValue::Undefined;
        for statement in parse_program(source)? {
            last = match statement {
                Statement::Var { name, value } => {
                    let global = match self.eval(&value)? {
                        Operand::Value(value) => Global::Value(value),
                        Operand::Bridge(_, bridge) => Global::Bridge(bridge),
                        Operand::Client => Global::Client,
                    };
                    self.shared.globals.insert(name, global);
                    EngineValue::Undefined
                }
                Statement::Expr(expr) => self.eval(&expr)?.into_value(),
            };
        }
        Ok(last)
    }

    fn eval(&mut self, expr: &Expr) -> Result<Operand, EngineError> {
        if let Some(value) = constant(expr) {
            return Ok(Operand::Value(value));
        }
        match expr {
            Expr::Ident(name) => self.read_global(name),
            Expr::Call { callee, args } => {
                let args = self.eval_args(args)?;
                self.call(callee, args)
            }
            Expr::Method {
                target,
                method,
                args,
            } => {
                let args = self.eval_args(args)?;
                self.call_method(target, method, args)
            }
            Expr::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item).map(Operand::into_value))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Operand::Value(EngineValue::Array(values)))
            }
            Expr::Object(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval(value)?.into_value());
                }
                Ok(Operand::Value(EngineValue::Object(map)))
            }
            Expr::Literal(value) => Ok(Operand::Value(value.clone())),
        }
    }

    fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Operand>, EngineError> {
        args.iter().map(|arg| self.eval(arg)).collect()
    }

    fn read_global(&self, name: &str) -> Result<Operand, EngineError> {
        match self.shared.globals.get(name) {
            Some(Global::Value(value)) => Ok(Operand::Value(value.clone())),
            Some(Global::Bridge(bridge)) => Ok(Operand::Bridge(name.to_string(), Arc::clone(bridge))),
            Some(Global::Client) => Ok(Operand::Client),
            Some(Global::Native(native)) => Ok(Operand::Value(EngineValue::Handle(format!(
                "function {native}"
            )))),
            None => Err(EngineError::Reference(format!("{name} is not defined"))),
        }
    }

    fn call(&mut self, callee: &str, args: Vec<Operand>) -> Result<Operand, EngineError> {
        let native = match self.shared.globals.get(callee) {
            Some(Global::Native(native)) => *native,
            Some(_) => {
                return Err(EngineError::Exception(format!("TypeError: {callee} is not a function")))
            }
            None => return Err(EngineError::Reference(format!("{callee} is not defined"))),
        };
        let mut args = args.into_iter().map(Operand::into_value);

        match native {
            "blob" => match args.next() {
                Some(EngineValue::String(text)) => Ok(Operand::Value(EngineValue::Blob(text.into_bytes()))),
                _ => Err(EngineError::Exception("TypeError: blob expects a string".into())),
            },
            _ => {
                let endpoint = match args.next() {
                    Some(EngineValue::String(endpoint)) => endpoint,
                    _ => return Err(EngineError::Exception("TypeError: io expects a url".into())),
                };
                let options = match args.next() {
                    Some(EngineValue::Object(options)) => options,
                    _ => BTreeMap::new(),
                };
                if self.shared.options.refuse_client {
                    return Ok(Operand::Value(EngineValue::Null));
                }
                debug!(endpoint = %endpoint, "loopback client created");
                self.shared.client = Some(ClientState {
                    endpoint,
                    options,
                    listeners: Vec::new(),
                    closed: false,
                });
                Ok(Operand::Client)
            }
        }
    }

    fn call_method(
        &mut self,
        target: &str,
        method: &str,
        args: Vec<Operand>,
    ) -> Result<Operand, EngineError> {
        let is_client = matches!(self.read_global(target)?, Operand::Client);
        let client = match (is_client, self.shared.client.as_mut()) {
            (true, Some(client)) => client,
            _ => {
                return Err(EngineError::Exception(format!(
                    "TypeError: {target}.{method} is not a function"
                )))
            }
        };
        let mut args = args.into_iter();

        match method {
            "on" | "off" => {
                let event = match args.next().map(Operand::into_value) {
                    Some(EngineValue::String(event)) => event,
                    _ => return Err(EngineError::Exception("TypeError: event name must be a string".into())),
                };
                let (bridge, callback) = match args.next() {
                    Some(Operand::Bridge(name, callback)) => (name, callback),
                    _ => return Err(EngineError::Exception("TypeError: listener must be a function".into())),
                };
                if method == "on" {
                    client.listeners.push(Listener {
                        event,
                        bridge,
                        callback,
                    });
                } else {
                    client
                        .listeners
                        .retain(|l| !(l.event == event && l.bridge == bridge));
                }
                Ok(Operand::Client)
            }
            "emit" => {
                let event = match args.next().map(Operand::into_value) {
                    Some(EngineValue::String(event)) => event,
                    _ => return Err(EngineError::Exception("TypeError: event name must be a string".into())),
                };
                let args: Vec<EngineValue> = args.map(Operand::into_value).collect();
                let closed = client.closed;
                let emission = Emission { event, args };
                if self.shared.options.relay && !closed {
                    if let Some(broadcast) = relay(&mut self.shared.joined, &emission) {
                        self.shared.broadcasts.push(broadcast.clone());
                        self.relayed.push(broadcast);
                    }
                }
                self.shared.emitted.push(emission);
                Ok(Operand::Client)
            }
            "close" | "disconnect" => {
                let was_open = !std::mem::replace(&mut client.closed, true);
                if was_open && self.shared.options.relay {
                    announce_leave(&mut *self.shared);
                }
                Ok(Operand::Client)
            }
            other => Err(EngineError::Exception(format!(
                "TypeError: {target}.{other} is not a function"
            ))),
        }
    }
}

/// What the chat relay broadcasts back for a client emit.
fn relay(joined: &mut Option<String>, emission: &Emission) -> Option<Emission> {
    match emission.event.as_str() {
        "connected" => {
            let name = match emission.args.first() {
                Some(EngineValue::String(name)) => name.clone(),
                Some(EngineValue::Number(n)) => n.to_string(),
                _ => "undefined".to_string(),
            };
            let notice = format!("{name} has joined");
            *joined = Some(name);
            Some(Emission {
                event: "publish".into(),
                args: vec![EngineValue::Array(vec![EngineValue::String(notice)])],
            })
        }
        "publish" => Some(Emission {
            event: "publish".into(),
            args: vec![emission.args.first().cloned().unwrap_or(EngineValue::Undefined)],
        }),
        _ => None,
    }
}

/// Record the leave notice other participants receive. The departing
/// client never sees it.
fn announce_leave(shared: &mut Shared) {
    if let Some(name) = shared.joined.take() {
        debug!(name = %name, "loopback relay announces leave");
        shared.broadcasts.push(Emission {
            event: "publish".into(),
            args: vec![EngineValue::String(format!("{name} has left"))],
        });
    }
}

/// Queue a notification for every listener of `event`.
fn post_delivery(queue: &EngineQueue, shared: &Arc<Mutex<Shared>>, event: String, args: Vec<EngineValue>) -> bool {
    let shared = Arc::clone(shared);
    queue
        .post(move |_| {
            let callbacks: Vec<BridgeFn> = {
                let shared = shared.lock();
                match shared.client.as_ref() {
                    Some(client) if !client.closed => client
                        .listeners
                        .iter()
                        .filter(|l| l.event == event)
                        .map(|l| Arc::clone(&l.callback))
                        .collect(),
                    _ => Vec::new(),
                }
            };
            trace!(event = %event, listeners = callbacks.len(), "loopback delivery");
            for callback in callbacks {
                callback(args.clone());
            }
        })
        .is_ok()
}

/// Server-side handle for a loopback engine. Cheap to clone; usable from
/// any thread.
#[derive(Clone)]
pub struct LoopbackRemote {
    shared: Arc<Mutex<Shared>>,
}

impl LoopbackRemote {
    /// Fire `event` at the client's listeners. Returns false when the
    /// engine is not running.
    pub fn fire(&self, event: &str, args: Vec<EngineValue>) -> bool {
        let queue = self.shared.lock().queue.clone();
        match queue {
            Some(queue) => post_delivery(&queue, &self.shared, event.to_string(), args),
            None => false,
        }
    }

    pub fn connect(&self) -> bool {
        self.fire("connect", Vec::new())
    }

    /// Drop the transport. With the relay on, the server announces that the
    /// client left.
    pub fn disconnect(&self) -> bool {
        {
            let mut shared = self.shared.lock();
            if shared.options.relay {
                announce_leave(&mut shared);
            }
        }
        self.fire("disconnect", vec![EngineValue::String("transport close".into())])
    }

    pub fn reconnect_attempt(&self, attempt: u32) -> bool {
        self.fire("reconnecting", vec![EngineValue::Number(f64::from(attempt))])
    }

    pub fn reconnect(&self, attempts: u32) -> bool {
        self.fire("reconnect", vec![EngineValue::Number(f64::from(attempts))])
    }

    pub fn reconnect_error(&self, message: &str) -> bool {
        self.fire("reconnect_error", vec![error_object(message)])
    }

    pub fn reconnect_failed(&self) -> bool {
        self.fire("reconnect_failed", Vec::new())
    }

    pub fn error(&self, message: &str) -> bool {
        self.fire("error", vec![error_object(message)])
    }

    /// Raise an exception outside any evaluation, as a library timer would.
    pub fn raise(&self, message: &str) -> bool {
        let queue = self.shared.lock().queue.clone();
        let Some(queue) = queue else {
            return false;
        };
        let shared = Arc::clone(&self.shared);
        let error = EngineError::Exception(message.to_string());
        queue
            .post(move |_| {
                let sink = shared.lock().sink.clone();
                if let Some(sink) = sink {
                    sink(&error);
                }
            })
            .is_ok()
    }

    /// Wait until every job queued before this call has run.
    pub fn barrier(&self, timeout: Duration) -> bool {
        let queue = self.shared.lock().queue.clone();
        let Some(queue) = queue else {
            return false;
        };
        let (tx, rx) = std_mpsc::channel();
        if queue.post(move |_| {
            let _ = tx.send(());
        })
        .is_err()
        {
            return false;
        }
        rx.recv_timeout(timeout).is_ok()
    }

    pub fn emitted(&self) -> Vec<Emission> {
        self.shared.lock().emitted.clone()
    }

    /// Relay broadcasts in order, including leave notices the departing
    /// client did not receive.
    pub fn broadcasts(&self) -> Vec<Emission> {
        self.shared.lock().broadcasts.clone()
    }

    pub fn endpoint(&self) -> Option<String> {
        self.shared.lock().client.as_ref().map(|c| c.endpoint.clone())
    }

    pub fn client_options(&self) -> Option<BTreeMap<String, EngineValue>> {
        self.shared.lock().client.as_ref().map(|c| c.options.clone())
    }

    /// Bridge names listening for `event`, in registration order.
    pub fn listeners(&self, event: &str) -> Vec<String> {
        self.shared
            .lock()
            .client
            .as_ref()
            .map(|c| {
                c.listeners
                    .iter()
                    .filter(|l| l.event == event)
                    .map(|l| l.bridge.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_client_closed(&self) -> bool {
        self.shared.lock().client.as_ref().is_some_and(|c| c.closed)
    }

    pub fn evaluations(&self) -> usize {
        self.shared.lock().evaluations
    }

    pub fn has_global(&self, name: &str) -> bool {
        self.shared.lock().globals.contains_key(name)
    }

    pub fn is_torn_down(&self) -> bool {
        self.shared.lock().torn_down
    }
}

fn error_object(message: &str) -> EngineValue {
    EngineValue::Object(BTreeMap::from([(
        "message".to_string(),
        EngineValue::String(message.to_string()),
    )]))
}
