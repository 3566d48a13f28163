//! Package definition and loading
//!
//! On disk a package is a directory:
//!
//! ```text
//! web/
//!   Package.yaml          metadata and dependency declarations
//!   values.yaml           default configuration tree
//!   values.schema.json    optional JSON Schema for the values
//!   templates/            template sources, `_*` files are helpers
//!   packages/<name>/      bundled dependency packages
//!   ...                   any other file, readable through `files`
//! ```

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{CoreError, Result};
use crate::schema::Schema;
use crate::values::Values;

/// API version accepted in `Package.yaml`
pub const API_VERSION: &str = "rudder/v1";

/// Directory holding bundled dependencies
pub const PACKAGES_DIR: &str = "packages";

/// Directory holding template sources
pub const TEMPLATES_DIR: &str = "templates";

const SCHEMA_FILES: [&str; 2] = ["values.schema.json", "values.schema.yaml"];

/// Contents of `Package.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageFile {
    /// API version (rudder/v1)
    pub api_version: String,

    /// Package metadata
    pub metadata: PackageMetadata,

    /// Dependencies
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// Package metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    /// Package name (required)
    pub name: String,

    /// Package version (required, SemVer)
    #[serde(with = "version_serde")]
    pub version: Version,

    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Application version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    /// Kubernetes version constraint (SemVer requirement, e.g. `>=1.25`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_version: Option<String>,

    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl PackageMetadata {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: None,
            app_version: None,
            kube_version: None,
            annotations: BTreeMap::new(),
        }
    }
}

/// Explicit child to parent value import
///
/// The dependency's default sub-tree at `child` is copied into the parent's
/// configuration tree at `parent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportValue {
    pub child: String,
    pub parent: String,
}

/// Package dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    /// Dependency name, also the directory under `packages/`
    pub name: String,

    /// Version constraint (semver)
    #[serde(default)]
    pub version: Option<String>,

    /// Where the dependency was fetched from (informational)
    #[serde(default)]
    pub repository: Option<String>,

    /// Static enable/disable flag
    ///
    /// When `false`, this dependency is ignored regardless of values.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Dot path evaluated against the parent's values, e.g. `redis.enabled`
    #[serde(default)]
    pub condition: Option<String>,

    /// Tags for conditional inclusion, enabled by `tags.<tag>: true`
    #[serde(default)]
    pub tags: Vec<String>,

    /// Alias name (overrides dependency name for value scoping and output)
    #[serde(default)]
    pub alias: Option<String>,

    /// Values imported from the dependency into the parent
    #[serde(default)]
    pub import_values: Vec<ImportValue>,
}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            repository: None,
            enabled: true,
            condition: None,
            tags: Vec::new(),
            alias: None,
            import_values: Vec::new(),
        }
    }

    /// Get the effective name (alias if set, otherwise name)
    #[inline]
    pub fn effective_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Decide activation against the parent's resolved values
    ///
    /// `enabled: false` always wins. A condition whose path exists decides
    /// next; otherwise any enabled tag activates, all disabled tags
    /// deactivate, and no opinion at all means active.
    pub fn is_active(&self, parent_values: &Values) -> bool {
        if !self.enabled {
            return false;
        }

        if let Some(decision) = self
            .condition
            .as_deref()
            .and_then(|condition| parent_values.truthy(condition))
        {
            return decision;
        }

        let tag_states: Vec<bool> = self
            .tags
            .iter()
            .filter_map(|tag| parent_values.truthy(&format!("tags.{}", tag)))
            .collect();

        if tag_states.is_empty() {
            true
        } else {
            tag_states.into_iter().any(|enabled| enabled)
        }
    }

    /// Check a bundled package's version against the declared constraint
    pub fn accepts(&self, version: &Version) -> Result<bool> {
        match &self.version {
            Some(constraint) => Ok(VersionReq::parse(constraint)?.matches(version)),
            None => Ok(true),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One template source file, named by its path under `templates/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    pub name: String,
    pub content: String,
}

impl TemplateSource {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Helpers (`_helpers.tpl`) are loadable but never rendered on their own
    pub fn is_helper(&self) -> bool {
        self.name
            .rsplit('/')
            .next()
            .map(|file| file.starts_with('_'))
            .unwrap_or(false)
    }

    /// Release notes template
    pub fn is_notes(&self) -> bool {
        self.name.eq_ignore_ascii_case("NOTES.txt")
    }
}

/// An immutable package: metadata, defaults, templates and bundled dependencies
#[derive(Debug, Clone)]
pub struct Package {
    pub metadata: PackageMetadata,
    pub dependencies: Vec<Dependency>,
    pub values: Values,
    pub schema: Option<Schema>,
    /// Templates ordered by name
    pub templates: Vec<TemplateSource>,
    /// Non-template files keyed by path relative to the package root
    pub files: BTreeMap<String, String>,
    /// Bundled dependency packages keyed by dependency name
    pub subpackages: BTreeMap<String, Package>,
}

impl Package {
    /// Start building an in-memory package
    pub fn builder(name: impl Into<String>, version: Version) -> PackageBuilder {
        PackageBuilder::new(PackageMetadata::new(name, version))
    }

    /// Load a package from a directory
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let root = path.as_ref();

        if !root.is_dir() {
            return Err(CoreError::PackageNotFound {
                path: root.display().to_string(),
            });
        }

        let package_file = root.join("Package.yaml");
        if !package_file.exists() {
            return Err(CoreError::InvalidPackage {
                message: format!("Package.yaml not found in {}", root.display()),
            });
        }

        let definition: PackageFile = serde_yaml::from_str(&std::fs::read_to_string(&package_file)?)?;
        if definition.api_version != API_VERSION {
            return Err(CoreError::InvalidPackage {
                message: format!(
                    "Unsupported API version: {}. Expected: {}",
                    definition.api_version, API_VERSION
                ),
            });
        }

        let values_path = root.join("values.yaml");
        let values = if values_path.exists() {
            Values::from_file(&values_path)?
        } else {
            Values::new()
        };

        let schema = SCHEMA_FILES
            .iter()
            .map(|name| root.join(name))
            .find(|p| p.exists())
            .map(Schema::from_file)
            .transpose()?;

        let mut templates = Vec::new();
        let mut files = BTreeMap::new();
        let packages_dir = root.join(PACKAGES_DIR);

        for entry in walkdir::WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.path() != packages_dir)
        {
            let entry = entry.map_err(|e| CoreError::FileAccess {
                path: root.display().to_string(),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| CoreError::FileAccess {
                    path: entry.path().display().to_string(),
                    message: e.to_string(),
                })?
                .to_string_lossy()
                .replace('\\', "/");

            if rel == "Package.yaml" || rel == "values.yaml" || SCHEMA_FILES.contains(&rel.as_str()) {
                continue;
            }

            let content = std::fs::read_to_string(entry.path())?;
            match rel.strip_prefix("templates/") {
                Some(name) => templates.push(TemplateSource::new(name, content)),
                None => {
                    files.insert(rel, content);
                }
            }
        }

        let mut subpackages = BTreeMap::new();
        for dep in &definition.dependencies {
            let dir = packages_dir.join(&dep.name);
            if !dir.is_dir() {
                // Disabled dependencies need not be bundled; activation decides later.
                continue;
            }
            let sub = Package::load(&dir)?;
            if !dep.accepts(&sub.metadata.version)? {
                return Err(CoreError::InvalidPackage {
                    message: format!(
                        "bundled dependency '{}' {} does not satisfy {}",
                        dep.name,
                        sub.metadata.version,
                        dep.version.as_deref().unwrap_or("*")
                    ),
                });
            }
            subpackages.insert(dep.name.clone(), sub);
        }

        templates.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            metadata: definition.metadata,
            dependencies: definition.dependencies,
            values,
            schema,
            templates,
            files,
            subpackages,
        })
    }

    /// Check the declared Kubernetes constraint against a cluster version
    pub fn check_kube_version(&self, kube_version: &str) -> Result<()> {
        let Some(constraint) = &self.metadata.kube_version else {
            return Ok(());
        };

        let req = VersionReq::parse(constraint)?;
        let actual = parse_kube_version(kube_version)?;

        if req.matches(&actual) {
            Ok(())
        } else {
            Err(CoreError::ConstraintNotSatisfied {
                package: self.metadata.name.clone(),
                constraint: constraint.clone(),
                actual: kube_version.to_string(),
            })
        }
    }

    /// Schema defaults overlaid with `values.yaml`
    pub fn default_values(&self) -> Values {
        let mut defaults = self
            .schema
            .as_ref()
            .map(Schema::defaults)
            .unwrap_or_default();
        defaults.merge(&self.values);
        defaults
    }
}

/// Parse `v1.31.2`, `1.31` or `v1.31.0-gke.100` into a comparable version
fn parse_kube_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    let core = trimmed.split(['-', '+']).next().unwrap_or(trimmed);
    let mut parts = core.split('.');
    let mut next = || -> Result<u64> {
        match parts.next() {
            Some(p) => p.parse::<u64>().map_err(|_| CoreError::InvalidPackage {
                message: format!("invalid Kubernetes version '{}'", raw),
            }),
            None => Ok(0),
        }
    };
    Ok(Version::new(next()?, next()?, next()?))
}

/// Builder for in-memory packages
#[derive(Debug)]
pub struct PackageBuilder {
    package: Package,
}

impl PackageBuilder {
    pub fn new(metadata: PackageMetadata) -> Self {
        Self {
            package: Package {
                metadata,
                dependencies: Vec::new(),
                values: Values::new(),
                schema: None,
                templates: Vec::new(),
                files: BTreeMap::new(),
                subpackages: BTreeMap::new(),
            },
        }
    }

    pub fn app_version(mut self, app_version: impl Into<String>) -> Self {
        self.package.metadata.app_version = Some(app_version.into());
        self
    }

    pub fn kube_version(mut self, constraint: impl Into<String>) -> Self {
        self.package.metadata.kube_version = Some(constraint.into());
        self
    }

    pub fn values(mut self, values: Values) -> Self {
        self.package.values = values;
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.package.schema = Some(schema);
        self
    }

    pub fn template(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.package.templates.push(TemplateSource::new(name, content));
        self
    }

    pub fn file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.package.files.insert(path.into(), content.into());
        self
    }

    /// Declare a dependency and bundle its package
    pub fn dependency(mut self, dependency: Dependency, package: Package) -> Self {
        self.package
            .subpackages
            .insert(dependency.name.clone(), package);
        self.package.dependencies.push(dependency);
        self
    }

    pub fn build(mut self) -> Package {
        self.package.templates.sort_by(|a, b| a.name.cmp(&b.name));
        self.package
    }
}

/// Custom serde for semver::Version
mod version_serde {
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(version: &Version, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&version.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Version, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}
