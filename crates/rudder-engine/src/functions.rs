//! Global template functions
//!
//! Only deterministic helpers are registered: no clock, no random source
//! and no environment access.

use minijinja::value::Rest;
use minijinja::{Error, ErrorKind, Value};

use crate::error::Directive;

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, message.into())
}

/// Abort rendering with a message
///
/// Usage: {{ fail("ingress.host must be set when ingress is enabled") }}
pub fn fail(message: String) -> Result<Value, Error> {
    Err(Directive::Fail.raise(message))
}

/// Build a mapping from alternating keys and values
///
/// Usage: {{ dict("app", release.name, "tier", "web") | toyaml }}
pub fn dict(args: Rest<Value>) -> Result<Value, Error> {
    if args.len() % 2 != 0 {
        return Err(invalid("dict requires an even number of arguments"));
    }

    let mut map = serde_json::Map::new();
    for pair in args.chunks(2) {
        let key = pair[0]
            .as_str()
            .ok_or_else(|| invalid("dict keys must be strings"))?;
        let value = serde_json::to_value(&pair[1]).map_err(|e| invalid(e.to_string()))?;
        map.insert(key.to_string(), value);
    }

    Ok(Value::from_serialize(serde_json::Value::Object(map)))
}

/// Usage: {{ list("a", "b", "c") }}
pub fn list(args: Rest<Value>) -> Value {
    Value::from(args.0)
}

/// Attribute lookup with a fallback
///
/// Usage: {{ get(values.labels, "team", "platform") }}
pub fn get(object: Value, key: String, default: Option<Value>) -> Value {
    match object.get_attr(&key) {
        Ok(v) if !v.is_undefined() && !v.is_none() => v,
        _ => default.unwrap_or(Value::UNDEFINED),
    }
}

/// Walk nested keys, the last argument being the default
///
/// Usage: {{ dig(values, "ingress", "tls", "secretName", "none") }}
pub fn dig(object: Value, rest: Rest<Value>) -> Result<Value, Error> {
    let Some((default, keys)) = rest.split_last() else {
        return Err(invalid("dig requires at least one key and a default"));
    };
    if keys.is_empty() {
        return Err(invalid("dig requires at least one key and a default"));
    }

    let mut current = object;
    for key in keys {
        let key = key.as_str().ok_or_else(|| invalid("dig keys must be strings"))?;
        match current.get_attr(key) {
            Ok(next) if !next.is_undefined() && !next.is_none() => current = next,
            _ => return Ok(default.clone()),
        }
    }
    Ok(current)
}

/// First argument that is neither undefined, none nor empty
///
/// Usage: {{ coalesce(values.nameOverride, package.name) }}
pub fn coalesce(args: Rest<Value>) -> Value {
    args.iter()
        .find(|v| !v.is_undefined() && !v.is_none() && v.is_true())
        .cloned()
        .unwrap_or(Value::from(()))
}

/// Usage: {{ ternary("yes", "no", values.enabled) }}
pub fn ternary(if_true: Value, if_false: Value, condition: Value) -> Value {
    if condition.is_true() { if_true } else { if_false }
}

/// Usage: {{ tostring(values.port) }}
pub fn tostring(value: Value) -> String {
    if value.is_undefined() || value.is_none() {
        return String::new();
    }
    value
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// Usage: {{ toint(values.replicas) }}
pub fn toint(value: Value) -> Result<i64, Error> {
    if let Some(s) = value.as_str() {
        let trimmed = s.trim();
        return trimmed
            .parse::<i64>()
            .or_else(|_| trimmed.parse::<f64>().map(|f| f as i64))
            .map_err(|_| invalid(format!("cannot convert '{}' to int", s)));
    }

    i64::try_from(value.clone())
        .or_else(|_| f64::try_from(value.clone()).map(|f| f as i64))
        .map_err(|_| invalid(format!("cannot convert {} to int", value.kind())))
}
