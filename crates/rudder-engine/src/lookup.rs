//! Live object lookups for templates
//!
//! `lookup` is the one template function whose output depends on the world
//! outside its inputs. Without a configured [`Lookup`] it returns an empty
//! mapping, so `template` and dry-run output stay reproducible.

use std::collections::BTreeMap;
use std::sync::Arc;

use minijinja::Value;
use serde_json::{Value as JsonValue, json};

/// Read-only access to existing objects
pub trait Lookup: Send + Sync + std::fmt::Debug {
    /// A single object, `None` when it does not exist
    fn get(&self, api_version: &str, kind: &str, namespace: &str, name: &str) -> Option<JsonValue>;

    /// All objects of a kind, optionally restricted to one namespace
    fn list(&self, api_version: &str, kind: &str, namespace: &str) -> Vec<JsonValue>;
}

/// Fixed set of objects, keyed by `(apiVersion, kind, namespace, name)`
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    objects: BTreeMap<(String, String, String, String), JsonValue>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object, reading its identity from the document itself
    pub fn with_object(mut self, object: JsonValue) -> Self {
        let field = |path: &str| {
            object
                .pointer(path)
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let key = (
            field("/apiVersion"),
            field("/kind"),
            field("/metadata/namespace"),
            field("/metadata/name"),
        );
        self.objects.insert(key, object);
        self
    }
}

impl Lookup for StaticLookup {
    fn get(&self, api_version: &str, kind: &str, namespace: &str, name: &str) -> Option<JsonValue> {
        self.objects
            .get(&(
                api_version.to_string(),
                kind.to_string(),
                namespace.to_string(),
                name.to_string(),
            ))
            .cloned()
    }

    fn list(&self, api_version: &str, kind: &str, namespace: &str) -> Vec<JsonValue> {
        self.objects
            .iter()
            .filter(|((a, k, ns, _), _)| {
                a == api_version && k == kind && (namespace.is_empty() || ns == namespace)
            })
            .map(|(_, obj)| obj.clone())
            .collect()
    }
}

/// Evaluate `lookup(apiVersion, kind, namespace, name)`
///
/// An empty `name` lists the kind and returns `{"items": [...]}`.
pub(crate) fn evaluate(
    lookup: Option<&Arc<dyn Lookup>>,
    api_version: &str,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Value {
    let result = match lookup {
        None => json!({}),
        Some(source) if name.is_empty() => json!({ "items": source.list(api_version, kind, namespace) }),
        Some(source) => source
            .get(api_version, kind, namespace, name)
            .unwrap_or_else(|| json!({})),
    };
    Value::from_serialize(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(ns: &str, name: &str) -> JsonValue {
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"namespace": ns, "name": name},
            "data": {"password": "c2VjcmV0"}
        })
    }

    #[test]
    fn test_without_lookup_returns_empty_map() {
        let value = evaluate(None, "v1", "Secret", "default", "db");
        assert_eq!(value.len(), Some(0));
    }

    #[test]
    fn test_static_get_and_list() {
        let source: Arc<dyn Lookup> = Arc::new(
            StaticLookup::new()
                .with_object(secret("default", "db"))
                .with_object(secret("other", "cache")),
        );

        let found = evaluate(Some(&source), "v1", "Secret", "default", "db");
        let password = found.get_attr("data").unwrap().get_attr("password").unwrap();
        assert_eq!(password.as_str(), Some("c2VjcmV0"));

        let missing = evaluate(Some(&source), "v1", "Secret", "default", "nope");
        assert_eq!(missing.len(), Some(0));

        assert_eq!(source.list("v1", "Secret", "").len(), 2);
        assert_eq!(source.list("v1", "Secret", "other").len(), 1);
    }
}
