//! Layered settings: compiled defaults, then `~/.sio/settings.json`
//! (deep-merged, nulls skipped), then `SIO_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use crate::config::{parse_attempt_limit, SessionConfig};
use crate::errors::SettingsError;

/// Application-level settings around one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub endpoint: String,
    /// Name announced to the relay in the `connected` event.
    pub display_name: String,
    pub log_level: String,
    pub session: SessionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            display_name: "anonymous".to_string(),
            log_level: "info".to_string(),
            session: SessionConfig::default(),
        }
    }
}

/// Resolve the path to the settings file (`~/.sio/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".sio").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or an invalid session
/// config is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings, SettingsError> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Json = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings
        .session
        .validate()
        .map_err(|e| SettingsError::InvalidValue(e.to_string()))?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, nulls in
/// `source` are skipped.
pub fn deep_merge(target: Json, source: Json) -> Json {
    match (target, source) {
        (Json::Object(mut target_map), Json::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Json::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `SIO_*` environment overrides. Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Some(v) = read_env_string("SIO_ENDPOINT") {
        settings.endpoint = v;
    }
    if let Some(v) = read_env_string("SIO_DISPLAY_NAME") {
        settings.display_name = v;
    }
    if let Some(v) = read_env_string("SIO_LOG_LEVEL") {
        settings.log_level = v;
    }
    if let Some(v) = read_env_parsed("SIO_AUTO_RECONNECT", parse_bool) {
        settings.session.auto_reconnect = v;
    }
    if let Some(v) = read_env_parsed("SIO_MAX_ATTEMPTS", parse_attempt_limit) {
        settings.session.max_attempts = v;
    }
    if let Some(v) = read_env_parsed("SIO_CONNECT_TIMEOUT", parse_seconds) {
        settings.session.connect_timeout = v;
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Positive, finite seconds.
pub fn parse_seconds(val: &str) -> Option<Duration> {
    let secs: f64 = val.trim().parse().ok()?;
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_parsed<T>(name: &str, parse: fn(&str) -> Option<T>) -> Option<T> {
    let val = std::env::var(name).ok()?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttemptLimit;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.session, SessionConfig::default());
        assert!(settings.endpoint.starts_with("http://"));
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"endpoint": "http://relay:8080", "session": {{"maxAttempts": 3, "connectTimeout": null}}}}"#
        )
        .unwrap();

        let settings = load_settings_from_path(file.path()).unwrap();
        assert_eq!(settings.endpoint, "http://relay:8080");
        assert_eq!(settings.session.max_attempts, AttemptLimit::Limited(3));
        assert_eq!(settings.session.connect_timeout, Duration::from_secs(20));
        assert!(settings.session.auto_reconnect);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(
            load_settings_from_path(file.path()),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn invalid_session_config_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"session": {{"transports": []}}}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(file.path()),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn deep_merge_rules() {
        let merged = deep_merge(
            json!({"a": {"x": 1, "y": 2}, "list": [1, 2], "keep": true}),
            json!({"a": {"y": 3}, "list": [9], "keep": null}),
        );
        assert_eq!(merged, json!({"a": {"x": 1, "y": 3}, "list": [9], "keep": true}));
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_seconds("2.5"), Some(Duration::from_millis(2500)));
        assert_eq!(parse_seconds("0"), None);
        assert_eq!(parse_seconds("-3"), None);
        assert_eq!(parse_attempt_limit("unlimited"), Some(AttemptLimit::Unlimited));
        assert_eq!(parse_attempt_limit("5"), Some(AttemptLimit::Limited(5)));
    }
}
