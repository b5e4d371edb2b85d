use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Structured payload carried by error notifications.
pub type ErrorPayload = BTreeMap<String, Value>;

/// Lifecycle notifications the protocol client emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Connect,
    Disconnect,
    Error,
    Reconnect,
    ReconnectAttempt,
    ReconnectError,
    /// Attempt limit exhausted. Drives the state machine only; there is no
    /// observer slot for it.
    ReconnectFailed,
}

impl LifecycleKind {
    pub const ALL: [LifecycleKind; 7] = [
        Self::Connect,
        Self::Disconnect,
        Self::Error,
        Self::Reconnect,
        Self::ReconnectAttempt,
        Self::ReconnectError,
        Self::ReconnectFailed,
    ];

    /// Event name the protocol library fires.
    pub fn engine_event(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
            Self::Reconnect => "reconnect",
            Self::ReconnectAttempt => "reconnecting",
            Self::ReconnectError => "reconnect_error",
            Self::ReconnectFailed => "reconnect_failed",
        }
    }

    /// Engine-global name of the bridge function for this notification.
    pub fn bridge_name(self) -> &'static str {
        match self {
            Self::Connect => "sio_on_connect",
            Self::Disconnect => "sio_on_disconnect",
            Self::Error => "sio_on_error",
            Self::Reconnect => "sio_on_reconnect",
            Self::ReconnectAttempt => "sio_on_reconnect_attempt",
            Self::ReconnectError => "sio_on_reconnect_error",
            Self::ReconnectFailed => "sio_on_reconnect_failed",
        }
    }

    pub fn has_observer(self) -> bool {
        !matches!(self, Self::ReconnectFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
            Self::Reconnect => "reconnect",
            Self::ReconnectAttempt => "reconnect_attempt",
            Self::ReconnectError => "reconnect_error",
            Self::ReconnectFailed => "reconnect_failed",
        }
    }
}

/// A lifecycle notification with its decoded payload.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    Connect,
    Disconnect,
    Error(ErrorPayload),
    Reconnect { attempts: u32 },
    ReconnectAttempt { attempt: u32 },
    ReconnectError(ErrorPayload),
    ReconnectFailed,
}

impl LifecycleEvent {
    /// Build the event from already-decoded callback arguments.
    pub fn from_args(kind: LifecycleKind, args: Vec<Value>) -> Self {
        match kind {
            LifecycleKind::Connect => Self::Connect,
            LifecycleKind::Disconnect => Self::Disconnect,
            LifecycleKind::Error => Self::Error(error_payload(args)),
            LifecycleKind::Reconnect => Self::Reconnect {
                attempts: attempt_count(&args),
            },
            LifecycleKind::ReconnectAttempt => Self::ReconnectAttempt {
                attempt: attempt_count(&args),
            },
            LifecycleKind::ReconnectError => Self::ReconnectError(error_payload(args)),
            LifecycleKind::ReconnectFailed => Self::ReconnectFailed,
        }
    }

    pub fn kind(&self) -> LifecycleKind {
        match self {
            Self::Connect => LifecycleKind::Connect,
            Self::Disconnect => LifecycleKind::Disconnect,
            Self::Error(_) => LifecycleKind::Error,
            Self::Reconnect { .. } => LifecycleKind::Reconnect,
            Self::ReconnectAttempt { .. } => LifecycleKind::ReconnectAttempt,
            Self::ReconnectError(_) => LifecycleKind::ReconnectError,
            Self::ReconnectFailed => LifecycleKind::ReconnectFailed,
        }
    }
}

fn attempt_count(args: &[Value]) -> u32 {
    args.first()
        .and_then(Value::as_i64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

/// Maps become the payload as-is; any other first argument is kept under
/// `message`.
fn error_payload(args: Vec<Value>) -> ErrorPayload {
    match args.into_iter().next() {
        Some(Value::Map(map)) => map,
        Some(other) => BTreeMap::from([("message".to_string(), other)]),
        None => BTreeMap::new(),
    }
}
