//! Core error types

use thiserror::Error;

/// One schema violation, addressed by a JSON pointer into the values tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrorInfo {
    /// JSON pointer to the offending value (`(root)` for the document itself)
    pub path: String,

    /// Human readable violation message
    pub message: String,
}

impl std::fmt::Display for ValidationErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Package not found: {path}")]
    PackageNotFound { path: String },

    #[error("Invalid Package.yaml: {message}")]
    InvalidPackage { message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("Values merge error: {message}")]
    ValuesMerge { message: String },

    #[error("Invalid schema: {message}")]
    InvalidSchema { message: String },

    #[error("Values of '{package}' do not match its schema: {}", format_violations(.errors))]
    SchemaViolation {
        package: String,
        errors: Vec<ValidationErrorInfo>,
    },

    #[error("Package '{package}' requires Kubernetes {constraint}, cluster runs {actual}")]
    ConstraintNotSatisfied {
        package: String,
        constraint: String,
        actual: String,
    },

    #[error("Dependency '{name}' is declared by '{parent}' but not bundled under packages/")]
    MissingDependency { parent: String, name: String },

    #[error("Dependency nesting exceeds {max} levels at '{scope}'")]
    DependencyDepth { scope: String, max: usize },

    #[error("File access error for '{path}': {message}")]
    FileAccess { path: String, message: String },
}

impl CoreError {
    /// Errors caused by user supplied configuration rather than by the package itself
    pub fn is_user_input(&self) -> bool {
        matches!(
            self,
            Self::ValuesMerge { .. }
                | Self::SchemaViolation { .. }
                | Self::ConstraintNotSatisfied { .. }
        )
    }
}

fn format_violations(errors: &[ValidationErrorInfo]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, CoreError>;
