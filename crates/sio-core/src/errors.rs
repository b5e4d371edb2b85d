use std::time::Duration;

use thiserror::Error;

use crate::ids::EventIdentifier;

/// Errors returned by the public session API. Failures inside the engine are
/// logged, not returned; these only describe requests the bridge refused.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("session is closed")]
    SessionClosed,

    #[error("identifier {identifier} for event '{event}' is already bound to '{existing}'")]
    IdentifierCollision {
        event: String,
        existing: String,
        identifier: EventIdentifier,
    },

    #[error("invalid session config: {0}")]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::SessionClosed => "session_closed",
            Self::IdentifierCollision { .. } => "identifier_collision",
            Self::Config(_) => "config",
        }
    }
}

/// Session configuration the protocol library cannot act on.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("transport list is empty")]
    NoTransports,

    #[error("max reconnect delay {max_delay:?} is shorter than reconnect delay {delay:?}")]
    DelayOrder { delay: Duration, max_delay: Duration },

    #[error("connect timeout must be greater than zero")]
    ZeroTimeout,
}

/// Errors that can occur when loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}
