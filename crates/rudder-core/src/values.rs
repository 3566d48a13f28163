//! Configuration tree with layered deep merge

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;

use crate::error::{CoreError, Result};

/// Key holding values shared by a package and every dependency below it
pub const GLOBAL_KEY: &str = "global";

/// Configuration tree with deep merge capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Default for Values {
    fn default() -> Self {
        Self::new()
    }
}

impl Values {
    /// Create empty values
    pub fn new() -> Self {
        Self(JsonValue::Object(serde_json::Map::new()))
    }

    /// Load values from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse values from YAML string. An empty document yields empty values.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: JsonValue = serde_yaml::from_str(yaml)?;
        Self::from_json_value(value)
    }

    /// Parse values from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(json)?;
        Self::from_json_value(value)
    }

    fn from_json_value(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Null => Ok(Self::new()),
            JsonValue::Object(_) => Ok(Self(value)),
            other => Err(CoreError::ValuesMerge {
                message: format!("values document must be a mapping, got {}", type_name(&other)),
            }),
        }
    }

    /// Deep merge another Values into this one
    ///
    /// Rules:
    /// - Mappings: merged key by key, recursively
    /// - Scalars and lists: overlay replaces base wholesale
    /// - `null` in the overlay removes the key from the base
    pub fn merge(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0);
    }

    /// Merge layers in order, later layers win
    pub fn merge_all<'a>(layers: impl IntoIterator<Item = &'a Values>) -> Self {
        let mut result = Values::new();
        for layer in layers {
            result.merge(layer);
        }
        result
    }

    /// Set a value by dotted path (e.g., "image.tag")
    pub fn set(&mut self, path: &str, value: JsonValue) -> Result<()> {
        let parts: Vec<&str> = path.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(CoreError::ValuesMerge {
                message: format!("invalid key path '{}'", path),
            });
        }
        set_nested(&mut self.0, &parts, value);
        Ok(())
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        if path.is_empty() {
            return Some(&self.0);
        }
        let parts: Vec<&str> = path.split('.').collect();
        get_nested(&self.0, &parts)
    }

    /// Truthiness of the value at `path`, `None` when the path is absent
    pub fn truthy(&self, path: &str) -> Option<bool> {
        self.get(path).map(is_truthy)
    }

    /// Get the inner JSON value
    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    /// Convert to JSON value
    pub fn into_inner(self) -> JsonValue {
        self.0
    }

    /// Check if values are empty
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }

    /// The `global` sub-tree, empty when unset
    pub fn global(&self) -> Values {
        match self.0.get(GLOBAL_KEY) {
            Some(JsonValue::Object(map)) => Values(JsonValue::Object(map.clone())),
            _ => Values::new(),
        }
    }

    /// Scope values for a dependency
    ///
    /// A dependency sees the parent's `<name>.*` sub-tree as its root and the
    /// parent's `global.*` tree unchanged.
    ///
    /// # Example
    ///
    /// Parent values:
    /// ```yaml
    /// global:
    ///   imageRegistry: docker.io
    /// redis:
    ///   replicas: 3
    /// postgresql:
    ///   enabled: false
    /// ```
    ///
    /// Calling `scope_for_dependency("redis")` produces:
    /// ```yaml
    /// global:
    ///   imageRegistry: docker.io
    /// replicas: 3
    /// ```
    pub fn scope_for_dependency(&self, name: &str) -> Values {
        let mut scoped = serde_json::Map::new();

        if let JsonValue::Object(parent) = &self.0 {
            if let Some(JsonValue::Object(child)) = parent.get(name) {
                for (k, v) in child {
                    scoped.insert(k.clone(), v.clone());
                }
            }
            if let Some(global) = parent.get(GLOBAL_KEY) {
                scoped.insert(GLOBAL_KEY.to_string(), global.clone());
            }
        }

        Values(JsonValue::Object(scoped))
    }

    /// Replace the `global` tree with `global` merged over the current one
    pub fn inject_global(&mut self, global: &Values) {
        if global.is_empty() {
            return;
        }
        let mut merged = self.global();
        merged.merge(global);
        if !self.0.is_object() {
            self.0 = JsonValue::Object(serde_json::Map::new());
        }
        if let JsonValue::Object(map) = &mut self.0 {
            map.insert(GLOBAL_KEY.to_string(), merged.into_inner());
        }
    }
}

/// Deep merge two JSON values
fn deep_merge(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                if overlay_value.is_null() {
                    base_map.remove(key);
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Set a nested value by path, creating intermediate mappings
fn set_nested(value: &mut JsonValue, path: &[&str], new_value: JsonValue) {
    let Some((key, remaining)) = path.split_first() else {
        *value = new_value;
        return;
    };

    if !value.is_object() {
        *value = JsonValue::Object(serde_json::Map::new());
    }

    if let JsonValue::Object(map) = value {
        if remaining.is_empty() {
            map.insert(key.to_string(), new_value);
        } else {
            let entry = map
                .entry(key.to_string())
                .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
            set_nested(entry, remaining, new_value);
        }
    }
}

/// Get a nested value by path
fn get_nested<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let Some((key, remaining)) = path.split_first() else {
        return Some(value);
    };

    match value {
        JsonValue::Object(map) => map.get(*key).and_then(|v| get_nested(v, remaining)),
        _ => None,
    }
}

/// Template-style truthiness of a JSON value
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Null => false,
        JsonValue::String(s) => !s.is_empty() && s != "false" && s != "0",
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

pub(crate) fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "mapping",
    }
}

/// Parse `key=value` overrides into a values layer
///
/// Scalars are inferred: booleans, `null`, integers, floats, inline JSON
/// lists/objects, everything else is a string.
pub fn parse_set_values(set_args: &[String]) -> Result<Values> {
    let mut values = Values::new();

    for arg in set_args {
        let (key, val) = arg.split_once('=').ok_or_else(|| CoreError::ValuesMerge {
            message: format!("Invalid --set format: '{}'. Expected key=value", arg),
        })?;

        values.set(key.trim(), parse_scalar(val))?;
    }

    Ok(values)
}

fn parse_scalar(val: &str) -> JsonValue {
    match val {
        "true" => return JsonValue::Bool(true),
        "false" => return JsonValue::Bool(false),
        "null" => return JsonValue::Null,
        _ => {}
    }

    if let Ok(num) = val.parse::<i64>() {
        return JsonValue::Number(num.into());
    }
    if let Some(num) = val.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
        return JsonValue::Number(num);
    }
    if val.starts_with('[') || val.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str(val) {
            return parsed;
        }
    }
    JsonValue::String(val.to_string())
}
