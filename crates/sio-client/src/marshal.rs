//! Argument marshaling between native [`Value`]s and the engine.
//!
//! Outbound values become engine literal text spliced into generated
//! statements; inbound engine values become native values.

use std::collections::BTreeMap;

use sio_core::Value;
use sio_engine::EngineValue;
use thiserror::Error;
use tracing::warn;

/// Largest integer magnitude an engine number represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MarshalError {
    #[error("binary argument is not valid UTF-8")]
    BinaryNotUtf8,

    #[error("{kind} argument has no JSON representation")]
    InvalidComposite { kind: &'static str },
}

/// Single-quoted engine string literal.
pub fn encode_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn encode_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let literal = if n > 0.0 { "Infinity" } else { "-Infinity" };
        literal.to_string()
    } else {
        n.to_string()
    }
}

/// Encode one argument as engine literal text.
pub fn encode_arg(value: &Value) -> Result<String, MarshalError> {
    match value {
        Value::Null => Ok("null".to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Int(n) => Ok(n.to_string()),
        Value::Float(f) => Ok(encode_number(*f)),
        Value::Text(text) => Ok(encode_text(text)),
        Value::Binary(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|_| MarshalError::BinaryNotUtf8)?;
            Ok(format!("blob({})", encode_text(text)))
        }
        Value::List(_) | Value::Map(_) => value
            .to_json()
            .map(|json| json.to_string())
            .ok_or(MarshalError::InvalidComposite { kind: value.kind() }),
    }
}

/// Encode every argument, dropping the ones that cannot be represented.
/// Returns the encoded literals and the number dropped.
pub fn encode_args(event: &str, args: &[Value]) -> (Vec<String>, usize) {
    let mut encoded = Vec::with_capacity(args.len());
    let mut dropped = 0;
    for (index, arg) in args.iter().enumerate() {
        match encode_arg(arg) {
            Ok(literal) => encoded.push(literal),
            Err(e) => {
                warn!(event, index, kind = arg.kind(), error = %e, "dropping argument");
                dropped += 1;
            }
        }
    }
    (encoded, dropped)
}

/// Convert an engine value to a native value. `undefined` and live engine
/// handles have no native form.
pub fn decode_arg(value: EngineValue) -> Option<Value> {
    Some(match value {
        EngineValue::Undefined | EngineValue::Handle(_) => return None,
        EngineValue::Null => Value::Null,
        EngineValue::Bool(b) => Value::Bool(b),
        EngineValue::Number(n) => decode_number(n),
        EngineValue::String(s) => Value::Text(s),
        EngineValue::Blob(bytes) => Value::Binary(bytes),
        EngineValue::Array(items) => Value::List(items.into_iter().filter_map(decode_arg).collect()),
        EngineValue::Object(map) => Value::Map(
            map.into_iter()
                .filter_map(|(k, v)| decode_arg(v).map(|v| (k, v)))
                .collect::<BTreeMap<_, _>>(),
        ),
    })
}

fn decode_number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Value::Int(n as i64)
    } else {
        Value::Float(n)
    }
}

pub fn decode_args(args: Vec<EngineValue>) -> Vec<Value> {
    args.into_iter().filter_map(decode_arg).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_escaping() {
        assert_eq!(encode_text("plain"), "'plain'");
        assert_eq!(encode_text("it's"), r"'it\'s'");
        assert_eq!(encode_text("a\\b"), r"'a\\b'");
        assert_eq!(encode_text("l1\nl2\r"), r"'l1\nl2\r'");
        assert_eq!(encode_text("\u{2028}\u{2029}"), r"'\u2028\u2029'");
        assert_eq!(encode_text("\u{1}\t"), r"'\u0001\u0009'");
        assert_eq!(encode_text("ünï 😀"), "'ünï 😀'");
    }

    #[test]
    fn scalar_encoding() {
        assert_eq!(encode_arg(&Value::Null).unwrap(), "null");
        assert_eq!(encode_arg(&Value::Bool(true)).unwrap(), "true");
        assert_eq!(encode_arg(&Value::Int(-42)).unwrap(), "-42");
        assert_eq!(encode_arg(&Value::Float(1.5)).unwrap(), "1.5");
        assert_eq!(encode_arg(&Value::Float(f64::NAN)).unwrap(), "NaN");
        assert_eq!(encode_arg(&Value::Float(f64::NEG_INFINITY)).unwrap(), "-Infinity");
    }

    #[test]
    fn binary_is_wrapped_in_blob_helper() {
        assert_eq!(encode_arg(&Value::Binary(b"a'b".to_vec())).unwrap(), r"blob('a\'b')");
        assert_eq!(
            encode_arg(&Value::Binary(vec![0xff, 0xfe])),
            Err(MarshalError::BinaryNotUtf8)
        );
    }

    #[test]
    fn composites_inline_as_json() {
        let map = Value::Map(BTreeMap::from([
            ("n".to_string(), Value::Int(1)),
            ("s".to_string(), Value::from("x\"y")),
        ]));
        assert_eq!(encode_arg(&map).unwrap(), r#"{"n":1,"s":"x\"y"}"#);
        assert_eq!(
            encode_arg(&Value::List(vec![Value::Binary(vec![1])])),
            Err(MarshalError::InvalidComposite { kind: "list" })
        );
        assert_eq!(
            encode_arg(&Value::Map(BTreeMap::from([("f".to_string(), Value::Float(f64::NAN))]))),
            Err(MarshalError::InvalidComposite { kind: "map" })
        );
    }

    #[test]
    fn invalid_args_are_dropped_and_counted() {
        let args = vec![
            Value::from("a"),
            Value::List(vec![Value::Binary(vec![0])]),
            Value::Int(2),
        ];
        let (encoded, dropped) = encode_args("publish", &args);
        assert_eq!(encoded, vec!["'a'".to_string(), "2".to_string()]);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn decoding_drops_undefined_and_handles() {
        let args = vec![
            EngineValue::Undefined,
            EngineValue::Number(3.0),
            EngineValue::Handle("function f".into()),
            EngineValue::Array(vec![EngineValue::Undefined, EngineValue::Null]),
            EngineValue::Object(BTreeMap::from([
                ("cb".to_string(), EngineValue::Handle("function g".into())),
                ("ok".to_string(), EngineValue::Bool(true)),
            ])),
        ];
        assert_eq!(
            decode_args(args),
            vec![
                Value::Int(3),
                Value::List(vec![Value::Null]),
                Value::Map(BTreeMap::from([("ok".to_string(), Value::Bool(true))])),
            ]
        );
    }

    #[test]
    fn decoding_numbers() {
        assert_eq!(decode_arg(EngineValue::Number(2.5)), Some(Value::Float(2.5)));
        assert_eq!(decode_arg(EngineValue::Number(-7.0)), Some(Value::Int(-7)));
        assert_eq!(
            decode_arg(EngineValue::Number(1e300)),
            Some(Value::Float(1e300))
        );
        assert!(matches!(
            decode_arg(EngineValue::Number(f64::INFINITY)),
            Some(Value::Float(f)) if f.is_infinite()
        ));
        assert_eq!(
            decode_arg(EngineValue::Blob(b"raw".to_vec())),
            Some(Value::Binary(b"raw".to_vec()))
        );
    }
}
