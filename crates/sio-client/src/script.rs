//! Statements the session evaluates against the protocol client.

use sio_core::config::engine_millis;
use sio_core::SessionConfig;

use crate::marshal::encode_text;

/// Engine global holding the protocol client object.
pub const CLIENT_GLOBAL: &str = "sio_client";

/// `var sio_client = io('<endpoint>', {...});`
pub fn construct_client(factory: &str, endpoint: &str, config: &SessionConfig) -> String {
    let transports = config
        .transports
        .iter()
        .map(|t| encode_text(t.engine_name()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "var {CLIENT_GLOBAL} = {factory}({endpoint}, {{reconnection: {reconnection}, \
         reconnectionAttempts: {attempts}, reconnectionDelay: {delay}, \
         reconnectionDelayMax: {max_delay}, timeout: {timeout}, transports: [{transports}]}});",
        endpoint = encode_text(endpoint),
        reconnection = config.auto_reconnect,
        attempts = config.max_attempts.engine_literal(),
        delay = engine_millis(config.reconnect_delay),
        max_delay = engine_millis(config.max_reconnect_delay),
        timeout = engine_millis(config.connect_timeout),
    )
}

pub fn listen(event: &str, bridge: &str) -> String {
    format!("{CLIENT_GLOBAL}.on({}, {bridge});", encode_text(event))
}

pub fn unlisten(event: &str, bridge: &str) -> String {
    format!("{CLIENT_GLOBAL}.off({}, {bridge});", encode_text(event))
}

/// `sio_client.emit('<event>', <args...>);` with already-encoded arguments.
pub fn emit(event: &str, args: &[String]) -> String {
    let mut statement = format!("{CLIENT_GLOBAL}.emit({}", encode_text(event));
    for arg in args {
        statement.push_str(", ");
        statement.push_str(arg);
    }
    statement.push_str(");");
    statement
}

pub fn disconnect() -> String {
    format!("{CLIENT_GLOBAL}.close();")
}
