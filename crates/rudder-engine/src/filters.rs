//! Kubernetes-oriented template filters
//!
//! Every filter is a pure function of its arguments.

use base64::Engine as _;
use minijinja::{Error, ErrorKind, Value};
use semver::{Version, VersionReq};
use sha2::{Digest, Sha256};

use crate::error::Directive;

fn to_json(value: &Value) -> Result<serde_json::Value, Error> {
    serde_json::to_value(value).map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

fn as_text(value: &Value) -> String {
    value
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// Serialize to YAML without the document marker or trailing newline
///
/// Usage: {{ values.resources | toyaml | nindent(10) }}
pub fn toyaml(value: Value) -> Result<String, Error> {
    let yaml = serde_yaml::to_string(&to_json(&value)?)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;

    Ok(yaml.trim_start_matches("---\n").trim_end().to_string())
}

/// Serialize to compact JSON
///
/// Usage: {{ values.config | tojson }}
pub fn tojson(value: Value) -> Result<String, Error> {
    serde_json::to_string(&to_json(&value)?)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

/// Usage: {{ values.password | b64encode }}
pub fn b64encode(value: Value) -> String {
    base64::engine::general_purpose::STANDARD.encode(as_text(&value).as_bytes())
}

/// Usage: {{ encoded | b64decode }}
pub fn b64decode(value: String) -> Result<String, Error> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value.trim().as_bytes())
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("base64 decode error: {}", e)))?;

    String::from_utf8(bytes)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("UTF-8 decode error: {}", e)))
}

/// Usage: {{ values.name | quote }}
pub fn quote(value: Value) -> String {
    let text = if value.is_undefined() || value.is_none() {
        String::new()
    } else {
        as_text(&value)
    };
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Usage: {{ values.name | squote }}
pub fn squote(value: Value) -> String {
    format!("'{}'", as_text(&value).replace('\'', "''"))
}

/// Indent every non-empty line
///
/// Usage: {{ block | indent(4) }}
pub fn indent(value: String, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    value
        .lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{}{}", pad, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Like `indent`, with a leading newline
///
/// Usage: {{ values.labels | toyaml | nindent(4) }}
pub fn nindent(value: String, spaces: usize) -> String {
    format!("\n{}", indent(value, spaces))
}

/// Fail rendering when the value is missing or empty
///
/// Usage: {{ values.database.host | required("database.host is required") }}
pub fn required(value: Value, message: Option<String>) -> Result<Value, Error> {
    let missing = value.is_undefined()
        || value.is_none()
        || value.as_str().map(str::is_empty).unwrap_or(false);

    if missing {
        Err(Directive::Required.raise(message.unwrap_or_else(|| "required value is missing".to_string())))
    } else {
        Ok(value)
    }
}

/// Usage: {% if values.extraEnv | empty %}
pub fn empty(value: Value) -> bool {
    if value.is_undefined() || value.is_none() {
        return true;
    }
    match value.len() {
        Some(len) => len == 0,
        None => value.as_str().map(str::is_empty).unwrap_or(false),
    }
}

/// Usage: {% if values.ingress | haskey("tls") %}
pub fn haskey(value: Value, key: String) -> bool {
    value
        .get_attr(&key)
        .map(|v| !v.is_undefined())
        .unwrap_or(false)
}

/// Hex SHA-256, handy for checksum annotations
///
/// Usage: {{ values.config | tojson | sha256 }}
pub fn sha256(value: String) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Truncate to at most `length` characters
///
/// Usage: {{ release.name | trunc(63) }}
pub fn trunc(value: String, length: usize) -> String {
    value.chars().take(length).collect()
}

/// Usage: {{ values.image.tag | trimprefix("v") }}
pub fn trimprefix(value: String, prefix: String) -> String {
    value
        .strip_prefix(prefix.as_str())
        .map(str::to_string)
        .unwrap_or(value)
}

/// Usage: {{ name | trimsuffix("-") }}
pub fn trimsuffix(value: String, suffix: String) -> String {
    value
        .strip_suffix(suffix.as_str())
        .map(str::to_string)
        .unwrap_or(value)
}

/// Match a version against a SemVer requirement
///
/// Kubernetes style versions (`v1.29.3-gke.100`) are accepted.
///
/// Usage: {% if capabilities.kubeVersion.version | semver_match(">=1.25.0") %}
pub fn semver_match(version: String, constraint: String) -> Result<bool, Error> {
    let cleaned = version.trim().trim_start_matches('v');
    let core = cleaned.split(['-', '+']).next().unwrap_or(cleaned);
    let mut parts = core.split('.').map(|p| p.parse::<u64>().unwrap_or(0));
    let parsed = Version::new(
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );

    let req = VersionReq::parse(constraint.trim()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("invalid constraint '{}': {}", constraint, e),
        )
    })?;

    Ok(req.matches(&parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TemplateErrorKind;

    #[test]
    fn test_toyaml() {
        let value = Value::from_serialize(serde_json::json!({"name": "web", "port": 8080}));
        assert_eq!(toyaml(value).unwrap(), "name: web\nport: 8080");
    }

    #[test]
    fn test_b64_roundtrip() {
        let encoded = b64encode(Value::from("hello world"));
        assert_eq!(encoded, "aGVsbG8gd29ybGQ=");
        assert_eq!(b64decode(encoded).unwrap(), "hello world");
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote(Value::from("say \"hi\"")), r#""say \"hi\"""#);
        assert_eq!(quote(Value::from(3)), "\"3\"");
        assert_eq!(squote(Value::from("it's")), "'it''s'");
    }

    #[test]
    fn test_indent_skips_blank_lines() {
        assert_eq!(indent("a\n\nb".to_string(), 2), "  a\n\n  b");
        assert_eq!(nindent("a\nb".to_string(), 4), "\n    a\n    b");
    }

    #[test]
    fn test_required() {
        assert!(required(Value::from("x"), None).is_ok());
        assert!(required(Value::from(0), None).is_ok());
        assert!(required(Value::from(""), None).is_err());

        let err = required(Value::UNDEFINED, Some("host is required".into())).unwrap_err();
        assert_eq!(err.detail(), Some("host is required"));
        assert_eq!(
            crate::error::TemplateError::from_minijinja(err, "t", |_| None, None).kind,
            TemplateErrorKind::RequiredValue
        );
    }

    #[test]
    fn test_sha256() {
        assert_eq!(
            sha256("abc".to_string()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_string_helpers() {
        assert_eq!(trunc("kubernetes".to_string(), 4), "kube");
        assert_eq!(trimprefix("v1.2".to_string(), "v".to_string()), "1.2");
        assert_eq!(trimsuffix("web-".to_string(), "-".to_string()), "web");
    }

    #[test]
    fn test_semver_match() {
        assert!(semver_match("v1.29.3-gke.100".to_string(), ">=1.25.0".to_string()).unwrap());
        assert!(!semver_match("1.24".to_string(), ">=1.25.0".to_string()).unwrap());
        assert!(semver_match("1.30".to_string(), "nonsense".to_string()).is_err());
    }

    #[test]
    fn test_empty_and_haskey() {
        let map = Value::from_serialize(serde_json::json!({"tls": true}));
        assert!(haskey(map.clone(), "tls".to_string()));
        assert!(!haskey(map, "hosts".to_string()));
        assert!(empty(Value::UNDEFINED));
        assert!(empty(Value::from_serialize(Vec::<i32>::new())));
        assert!(!empty(Value::from("x")));
    }
}
