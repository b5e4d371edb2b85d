use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ConfigError;

/// Transport preference, in the order the protocol library should try them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Polling,
    #[serde(alias = "websocket")]
    Streaming,
}

impl Transport {
    /// Name the protocol library uses for this transport.
    pub fn engine_name(self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::Streaming => "websocket",
        }
    }
}

/// Reconnection attempt limit. `Unlimited` is a sentinel distinct from every
/// finite count and is forwarded to the engine as `Infinity`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AttemptLimit {
    #[default]
    Unlimited,
    Limited(u32),
}

impl AttemptLimit {
    pub fn is_unlimited(self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// Engine literal for the limit.
    pub fn engine_literal(self) -> String {
        match self {
            Self::Unlimited => "Infinity".to_string(),
            Self::Limited(n) => n.to_string(),
        }
    }
}

impl fmt::Display for AttemptLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => f.write_str("unlimited"),
            Self::Limited(n) => write!(f, "{n}"),
        }
    }
}

impl Serialize for AttemptLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unlimited => serializer.serialize_str("unlimited"),
            Self::Limited(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for AttemptLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Count(i64),
            Keyword(String),
        }

        match Repr::deserialize(deserializer)? {
            // Negative counts are the legacy "unlimited" encoding.
            Repr::Count(n) if n < 0 => Ok(Self::Unlimited),
            Repr::Count(n) => u32::try_from(n)
                .map(Self::Limited)
                .map_err(|_| serde::de::Error::custom(format!("attempt limit {n} out of range"))),
            Repr::Keyword(k) => parse_attempt_limit(&k)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid attempt limit: {k}"))),
        }
    }
}

/// Parse `unlimited`/`infinity`/`-1` or a non-negative count.
pub fn parse_attempt_limit(raw: &str) -> Option<AttemptLimit> {
    let raw = raw.trim();
    match raw.to_lowercase().as_str() {
        "unlimited" | "infinity" | "inf" | "-1" => Some(AttemptLimit::Unlimited),
        other => other.parse::<u32>().ok().map(AttemptLimit::Limited),
    }
}

/// Connection configuration for one session.
///
/// Durations are seconds on the wire (matching the public contract) and are
/// converted to the engine's millisecond convention when the client is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub auto_reconnect: bool,
    pub max_attempts: AttemptLimit,
    #[serde(with = "seconds")]
    pub reconnect_delay: Duration,
    #[serde(with = "seconds")]
    pub max_reconnect_delay: Duration,
    #[serde(with = "seconds")]
    pub connect_timeout: Duration,
    pub transports: Vec<Transport>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: AttemptLimit::Unlimited,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(20),
            transports: vec![Transport::Polling, Transport::Streaming],
        }
    }
}

impl SessionConfig {
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_max_attempts(mut self, limit: AttemptLimit) -> Self {
        self.max_attempts = limit;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration, max_delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_delay = max_delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_transports(mut self, transports: Vec<Transport>) -> Self {
        self.transports = transports;
        self
    }

    /// Reject configurations the protocol library cannot act on.
    /// The transport list is checked but never reordered or deduplicated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transports.is_empty() {
            return Err(ConfigError::NoTransports);
        }
        if self.max_reconnect_delay < self.reconnect_delay {
            return Err(ConfigError::DelayOrder {
                delay: self.reconnect_delay,
                max_delay: self.max_reconnect_delay,
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Millisecond value handed to the engine.
pub fn engine_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| serde::de::Error::custom(format!("invalid duration: {secs} seconds")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_public_contract() {
        let config = SessionConfig::default();
        assert!(config.auto_reconnect);
        assert!(config.max_attempts.is_unlimited());
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.transports, vec![Transport::Polling, Transport::Streaming]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_camel_case_seconds() {
        let config: SessionConfig = serde_json::from_value(json!({
            "autoReconnect": false,
            "maxAttempts": 3,
            "reconnectDelay": 0.5,
            "maxReconnectDelay": 5,
            "connectTimeout": 20,
            "transports": ["streaming", "polling"]
        }))
        .unwrap();
        assert!(!config.auto_reconnect);
        assert_eq!(config.max_attempts, AttemptLimit::Limited(3));
        assert_eq!(config.reconnect_delay, Duration::from_millis(500));
        assert_eq!(config.transports, vec![Transport::Streaming, Transport::Polling]);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: SessionConfig = serde_json::from_value(json!({"maxAttempts": 7})).unwrap();
        assert_eq!(config.max_attempts, AttemptLimit::Limited(7));
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
    }

    #[test]
    fn attempt_limit_sentinels() {
        let unlimited: AttemptLimit = serde_json::from_value(json!("unlimited")).unwrap();
        assert_eq!(unlimited, AttemptLimit::Unlimited);
        let legacy: AttemptLimit = serde_json::from_value(json!(-1)).unwrap();
        assert_eq!(legacy, AttemptLimit::Unlimited);
        assert!(serde_json::from_value::<AttemptLimit>(json!("lots")).is_err());
        assert_eq!(serde_json::to_value(AttemptLimit::Unlimited).unwrap(), json!("unlimited"));
        assert_eq!(serde_json::to_value(AttemptLimit::Limited(2)).unwrap(), json!(2));
    }

    #[test]
    fn attempt_limit_engine_literal() {
        assert_eq!(AttemptLimit::Unlimited.engine_literal(), "Infinity");
        assert_eq!(AttemptLimit::Limited(0).engine_literal(), "0");
    }

    #[test]
    fn websocket_alias_accepted() {
        let t: Transport = serde_json::from_value(json!("websocket")).unwrap();
        assert_eq!(t, Transport::Streaming);
        assert_eq!(t.engine_name(), "websocket");
    }

    #[test]
    fn validation_rejects_bad_configs() {
        let empty = SessionConfig::default().with_transports(vec![]);
        assert!(matches!(empty.validate(), Err(ConfigError::NoTransports)));

        let inverted = SessionConfig::default()
            .with_reconnect_delay(Duration::from_secs(10), Duration::from_secs(1));
        assert!(matches!(inverted.validate(), Err(ConfigError::DelayOrder { .. })));

        let zero = SessionConfig::default().with_connect_timeout(Duration::ZERO);
        assert!(matches!(zero.validate(), Err(ConfigError::ZeroTimeout)));
    }

    #[test]
    fn duplicate_transports_are_kept() {
        let config = SessionConfig::default()
            .with_transports(vec![Transport::Polling, Transport::Polling]);
        assert!(config.validate().is_ok());
        assert_eq!(config.transports.len(), 2);
    }

    #[test]
    fn millis_conversion() {
        assert_eq!(engine_millis(Duration::from_secs(20)), 20_000);
        assert_eq!(engine_millis(Duration::from_millis(1500)), 1500);
    }
}
