//! JSON Schema validation for values
//!
//! A package may ship `values.schema.json` (or its YAML spelling
//! `values.schema.yaml`). The schema contributes defaults, the lowest
//! precedence layer of the configuration tree, and rejects resolved values
//! whose shape does not match.

use serde_json::Value as JsonValue;
use std::path::Path;

use crate::error::{CoreError, Result, ValidationErrorInfo};
use crate::values::Values;

/// A values schema in JSON Schema form
#[derive(Debug, Clone, PartialEq)]
pub struct Schema(JsonValue);

impl Schema {
    /// Load schema from a file, JSON or YAML by extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        if path.extension().map(|e| e == "json").unwrap_or(false) {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    /// Load from a JSON Schema string
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Load from a JSON Schema written as YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_value(serde_yaml::from_str(yaml)?)
    }

    /// Wrap an already parsed schema document
    pub fn from_value(value: JsonValue) -> Result<Self> {
        if !value.is_object() {
            return Err(CoreError::InvalidSchema {
                message: "schema root must be an object".to_string(),
            });
        }
        Ok(Self(value))
    }

    /// The raw schema document
    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }

    /// Defaults declared by the schema, as a values layer
    pub fn defaults(&self) -> Values {
        match extract_defaults(&self.0) {
            JsonValue::Object(map) => Values(JsonValue::Object(map)),
            _ => Values::new(),
        }
    }

    /// Compile the schema for repeated validation
    pub fn compile(&self) -> Result<SchemaValidator> {
        SchemaValidator::new(self)
    }
}

/// Walk `properties` collecting `default` entries
fn extract_defaults(schema: &JsonValue) -> JsonValue {
    let Some(obj) = schema.as_object() else {
        return JsonValue::Null;
    };

    if let Some(default) = obj.get("default") {
        return default.clone();
    }

    let Some(props) = obj.get("properties").and_then(|p| p.as_object()) else {
        return JsonValue::Null;
    };

    let defaults: serde_json::Map<String, JsonValue> = props
        .iter()
        .filter_map(|(key, prop)| {
            let value = extract_defaults(prop);
            (!value.is_null()).then(|| (key.clone(), value))
        })
        .collect();

    if defaults.is_empty() {
        JsonValue::Null
    } else {
        JsonValue::Object(defaults)
    }
}

/// Schema validator with cached compiled schema
pub struct SchemaValidator {
    compiled: jsonschema::Validator,
}

impl SchemaValidator {
    pub fn new(schema: &Schema) -> Result<Self> {
        let compiled =
            jsonschema::validator_for(schema.as_json()).map_err(|e| CoreError::InvalidSchema {
                message: e.to_string(),
            })?;

        Ok(Self { compiled })
    }

    /// Collect every violation, empty when `values` is valid
    pub fn violations(&self, values: &JsonValue) -> Vec<ValidationErrorInfo> {
        if self.compiled.is_valid(values) {
            return Vec::new();
        }

        self.compiled
            .iter_errors(values)
            .map(|e| {
                let path = e.instance_path.to_string();
                ValidationErrorInfo {
                    path: if path.is_empty() {
                        "(root)".to_string()
                    } else {
                        path
                    },
                    message: e.to_string().replace('"', "'"),
                }
            })
            .collect()
    }

    /// Validate values of the named package
    pub fn validate(&self, package: &str, values: &Values) -> Result<()> {
        let errors = self.violations(values.inner());
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::SchemaViolation {
                package: package.to_string(),
                errors,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn replicas_schema() -> Schema {
        Schema::from_yaml(
            r#"
type: object
properties:
  replicas:
    type: integer
    default: 1
    minimum: 0
  image:
    type: object
    properties:
      tag:
        type: string
        default: latest
      pullPolicy:
        type: string
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_extract_defaults() {
        let defaults = replicas_schema().defaults();

        assert_eq!(defaults.get("replicas").unwrap(), 1);
        assert_eq!(defaults.get("image.tag").unwrap(), "latest");
        assert!(defaults.get("image.pullPolicy").is_none());
    }

    #[test]
    fn test_validation_success() {
        let validator = replicas_schema().compile().unwrap();
        let values = Values(json!({"replicas": 5}));

        assert!(validator.validate("web", &values).is_ok());
    }

    #[test]
    fn test_validation_reports_path() {
        let validator = replicas_schema().compile().unwrap();
        let values = Values(json!({"replicas": "three", "image": "nginx"}));

        let err = validator.validate("web", &values).unwrap_err();
        match err {
            CoreError::SchemaViolation { package, errors } => {
                assert_eq!(package, "web");
                let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
                assert!(paths.contains(&"/replicas"));
                assert!(paths.contains(&"/image"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_non_object_schema_rejected() {
        assert!(Schema::from_json("[1, 2]").is_err());
    }
}
