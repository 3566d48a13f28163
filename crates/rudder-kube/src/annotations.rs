//! Annotation parsing with Helm compatibility
//!
//! Rudder reads `rudder.io/*` annotations and falls back to `helm.sh/*`
//! so existing charts keep their hooks and resource policies.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value as JsonValue;

/// Rudder-native annotations
pub mod rudder {
    /// Hook phase annotation
    pub const HOOK: &str = "rudder.io/hook";
    /// Hook weight for ordering
    pub const HOOK_WEIGHT: &str = "rudder.io/hook-weight";
    /// Hook timeout
    pub const HOOK_TIMEOUT: &str = "rudder.io/hook-timeout";
    /// Hook delete policy
    pub const HOOK_DELETE_POLICY: &str = "rudder.io/hook-delete-policy";
    /// Resource policy (keep on removal)
    pub const RESOURCE_POLICY: &str = "rudder.io/resource-policy";
}

/// Helm-compatible annotations (for migration)
pub mod helm {
    /// Hook phase annotation
    pub const HOOK: &str = "helm.sh/hook";
    /// Hook weight for ordering
    pub const HOOK_WEIGHT: &str = "helm.sh/hook-weight";
    /// Hook delete policy
    pub const HOOK_DELETE_POLICY: &str = "helm.sh/hook-delete-policy";
    /// Resource policy (keep on uninstall)
    pub const RESOURCE_POLICY: &str = "helm.sh/resource-policy";
}

/// String annotations of a document; non-string values are skipped
pub fn annotations_of(document: &JsonValue) -> BTreeMap<String, String> {
    document
        .pointer("/metadata/annotations")
        .and_then(JsonValue::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Get annotation value, preferring Rudder over Helm
pub fn get_annotation<'a>(
    annotations: &'a BTreeMap<String, String>,
    rudder_key: &str,
    helm_key: &str,
) -> Option<&'a str> {
    annotations
        .get(rudder_key)
        .or_else(|| annotations.get(helm_key))
        .map(|s| s.as_str())
}

/// Split a comma-separated annotation value
pub fn split_list(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// `resource-policy: keep` retains the resource when it leaves the desired set
pub fn is_kept(annotations: &BTreeMap<String, String>) -> bool {
    get_annotation(annotations, rudder::RESOURCE_POLICY, helm::RESOURCE_POLICY)
        .is_some_and(|policy| policy.trim().eq_ignore_ascii_case("keep"))
}

/// Parse a duration such as "5m", "300s", "1h" or "100ms"
///
/// A bare number is read as seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (num_str, unit_ms) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped, 1)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped, 1_000)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped, 60_000)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped, 3_600_000)
    } else {
        (value, 1_000)
    };

    let num: u64 = num_str.trim().parse().ok()?;
    num.checked_mul(unit_ms).map(Duration::from_millis)
}
