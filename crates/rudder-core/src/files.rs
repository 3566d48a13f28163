//! Read-only access to a package's non-template files
//!
//! Templates may read any file shipped with the package except the
//! templates themselves and bundled dependencies. Lookups are by path
//! relative to the package root, so nothing outside the package can be
//! reached.
//!
//! ```jinja2
//! data:
//!   nginx.conf: {{ files.get("config/nginx.conf") | b64encode }}
//! {% for file in files.glob("scripts/*.sh") %}
//!   {{ file.name }}: {{ file.content | b64encode }}
//! {% endfor %}
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// A file entry returned by glob operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path from package root
    pub path: String,
    /// File name (without directory)
    pub name: String,
    /// File content
    pub content: String,
    /// File size in bytes
    pub size: usize,
}

/// Shared, immutable view over a package's files
#[derive(Debug, Clone, Default)]
pub struct PackageFiles {
    files: Arc<BTreeMap<String, String>>,
}

impl PackageFiles {
    pub fn new(files: BTreeMap<String, String>) -> Self {
        Self {
            files: Arc::new(files),
        }
    }

    fn normalize(path: &str) -> Result<&str> {
        if path.starts_with('/') || path.split('/').any(|c| c == "..") {
            return Err(CoreError::FileAccess {
                path: path.to_string(),
                message: "path escapes package directory".to_string(),
            });
        }
        Ok(path.trim_start_matches("./"))
    }

    /// Read a file as a string
    pub fn get(&self, path: &str) -> Result<&str> {
        let key = Self::normalize(path)?;
        self.files
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| CoreError::FileAccess {
                path: path.to_string(),
                message: "file not found".to_string(),
            })
    }

    /// Check if a file exists
    pub fn exists(&self, path: &str) -> bool {
        Self::normalize(path)
            .map(|key| self.files.contains_key(key))
            .unwrap_or(false)
    }

    /// Read a file as lines
    pub fn lines(&self, path: &str) -> Result<Vec<String>> {
        Ok(self.get(path)?.lines().map(str::to_string).collect())
    }

    /// Files matching a glob pattern, in path order
    pub fn glob(&self, pattern: &str) -> Result<Vec<FileEntry>> {
        let compiled = glob::Pattern::new(pattern).map_err(|e| CoreError::FileAccess {
            path: pattern.to_string(),
            message: format!("invalid glob pattern: {}", e),
        })?;

        Ok(self
            .files
            .iter()
            .filter(|(path, _)| compiled.matches(path))
            .map(|(path, content)| FileEntry {
                path: path.clone(),
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                content: content.clone(),
                size: content.len(),
            })
            .collect())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
