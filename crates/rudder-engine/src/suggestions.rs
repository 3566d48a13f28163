//! Fuzzy suggestions for template errors
//!
//! When a template references `values.replcias`, the most useful help is the
//! sibling key the author probably meant. Distances come from `strsim`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;

/// Maximum Levenshtein distance to consider for suggestions
const MAX_SUGGESTION_DISTANCE: usize = 3;

/// Filters registered by the engine on top of MiniJinja's builtins
pub const AVAILABLE_FILTERS: &[&str] = &[
    "toyaml",
    "tojson",
    "b64encode",
    "b64decode",
    "quote",
    "squote",
    "nindent",
    "indent",
    "required",
    "empty",
    "haskey",
    "sha256",
    "trunc",
    "trimprefix",
    "trimsuffix",
    "semver_match",
    "default",
    "upper",
    "lower",
    "replace",
    "trim",
    "join",
    "length",
    "int",
    "string",
];

/// Functions registered by the engine
pub const AVAILABLE_FUNCTIONS: &[&str] = &[
    "fail", "dict", "list", "get", "dig", "coalesce", "ternary", "tostring", "toint", "lookup",
];

static VALUES_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bvalues((?:\.[A-Za-z_][A-Za-z0-9_]*)+)").expect("static regex"));

/// Closest candidate within the suggestion distance
pub fn closest<'a>(needle: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    candidates
        .into_iter()
        .map(|c| (strsim::levenshtein(needle, c), c))
        .filter(|(d, _)| *d <= MAX_SUGGESTION_DISTANCE && *d > 0)
        .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
        .map(|(_, c)| c)
}

/// Suggest a fix for the first `values.*` path on `line` that does not resolve
pub fn suggest_values_path(line: &str, values: &JsonValue) -> Option<String> {
    for caps in VALUES_PATH.captures_iter(line) {
        let path = &caps[1][1..];
        let mut current = values;
        let mut walked = Vec::new();

        for segment in path.split('.') {
            match current.get(segment) {
                Some(next) => {
                    walked.push(segment);
                    current = next;
                }
                None => {
                    let keys: Vec<&str> = current
                        .as_object()
                        .map(|m| m.keys().map(String::as_str).collect())
                        .unwrap_or_default();
                    let parent = if walked.is_empty() {
                        "values".to_string()
                    } else {
                        format!("values.{}", walked.join("."))
                    };
                    return Some(match closest(segment, keys.iter().copied()) {
                        Some(hit) => format!("did you mean `{}.{}`?", parent, hit),
                        None if keys.is_empty() => {
                            format!("`{}` has no keys; set `{}` in a values file or with --set", parent, path)
                        }
                        None => format!("available keys in `{}`: {}", parent, keys.join(", ")),
                    });
                }
            }
        }
    }
    None
}

/// Suggest a registered filter close to `name`
pub fn suggest_filter(name: &str) -> Option<String> {
    closest(name, AVAILABLE_FILTERS.iter().copied()).map(|hit| format!("did you mean `{}`?", hit))
}

/// Suggest a registered function close to `name`
pub fn suggest_function(name: &str) -> Option<String> {
    closest(name, AVAILABLE_FUNCTIONS.iter().copied()).map(|hit| format!("did you mean `{}()`?", hit))
}
