//! Value resolution across a package and its dependencies
//!
//! Precedence, lowest first:
//!
//! 1. schema defaults
//! 2. `values.yaml` defaults
//! 3. values imported from dependencies (explicit child to parent mappings)
//! 4. user value files, in argument order
//! 5. user `key=value` overrides
//!
//! The top level `global` tree is computed once from the result and injected
//! into every active dependency, overriding whatever globals the dependency
//! declares itself.

use serde_json::Value as JsonValue;
use std::path::Path;

use crate::error::{CoreError, Result};
use crate::package::Package;
use crate::values::{Values, parse_set_values};

/// Maximum nesting of bundled dependencies
pub const MAX_DEPENDENCY_DEPTH: usize = 10;

/// Copy `child` from a dependency's defaults to `parent` in the importing tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportMapping {
    pub dependency: String,
    pub child: String,
    pub parent: String,
}

impl ImportMapping {
    pub fn new(
        dependency: impl Into<String>,
        child: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        Self {
            dependency: dependency.into(),
            child: child.into(),
            parent: parent.into(),
        }
    }

    /// Mappings declared by the package's enabled dependencies
    pub fn declared_by(package: &Package) -> Vec<ImportMapping> {
        package
            .dependencies
            .iter()
            .filter(|dep| dep.enabled)
            .flat_map(|dep| {
                dep.import_values
                    .iter()
                    .map(|iv| ImportMapping::new(&dep.name, &iv.child, &iv.parent))
            })
            .collect()
    }
}

/// User supplied configuration layers
#[derive(Debug, Clone, Default)]
pub struct UserOverrides {
    /// Value files, later layers win
    pub layers: Vec<Values>,
    /// `key=value` expressions, applied last
    pub set: Vec<String>,
}

impl UserOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer(mut self, values: Values) -> Self {
        self.layers.push(values);
        self
    }

    pub fn file<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        Ok(self.layer(Values::from_file(path)?))
    }

    pub fn set(mut self, expr: impl Into<String>) -> Self {
        self.set.push(expr.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty() && self.set.is_empty()
    }

    /// All user layers folded into one tree
    pub fn flatten(&self) -> Result<Values> {
        let mut merged = Values::merge_all(&self.layers);
        if !self.set.is_empty() {
            merged.merge(&parse_set_values(&self.set)?);
        }
        Ok(merged)
    }
}

/// An active dependency with its fully resolved values
#[derive(Debug, Clone)]
pub struct EffectiveDependency {
    /// Effective names from the root package down to this dependency
    pub scope: Vec<String>,
    pub package: Package,
    pub values: Values,
}

impl EffectiveDependency {
    /// Output prefix, e.g. `backend/redis`
    pub fn path(&self) -> String {
        self.scope.join("/")
    }
}

/// Root configuration tree plus the flattened dependency list
#[derive(Debug, Clone)]
pub struct ResolvedValues {
    pub values: Values,
    /// Active dependencies, depth-first in declaration order
    pub dependencies: Vec<EffectiveDependency>,
}

/// Merges configuration layers and resolves dependency scoping
#[derive(Debug, Clone)]
pub struct ValueResolver {
    max_depth: usize,
}

impl Default for ValueResolver {
    fn default() -> Self {
        Self {
            max_depth: MAX_DEPENDENCY_DEPTH,
        }
    }
}

impl ValueResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Resolve using the import mappings the package declares itself
    pub fn resolve_package(&self, package: &Package, user: &UserOverrides) -> Result<ResolvedValues> {
        self.resolve(package, &ImportMapping::declared_by(package), user)
    }

    /// Resolve the configuration tree of `package` and every active dependency
    pub fn resolve(
        &self,
        package: &Package,
        dependency_overrides: &[ImportMapping],
        user: &UserOverrides,
    ) -> Result<ResolvedValues> {
        let mut values = package.default_values();
        values.merge(&self.imports(package, dependency_overrides)?);
        values.merge(&user.flatten()?);

        validate(package, &values)?;

        let global = values.global();
        let mut dependencies = Vec::new();
        self.flatten(package, &values, &global, &mut Vec::new(), &mut dependencies)?;

        Ok(ResolvedValues {
            values,
            dependencies,
        })
    }

    fn imports(&self, package: &Package, mappings: &[ImportMapping]) -> Result<Values> {
        let mut imported = Values::new();

        for mapping in mappings {
            let sub = package.subpackages.get(&mapping.dependency).ok_or_else(|| {
                CoreError::MissingDependency {
                    parent: package.metadata.name.clone(),
                    name: mapping.dependency.clone(),
                }
            })?;

            let defaults = sub.default_values();
            let value = defaults.get(&mapping.child).ok_or_else(|| CoreError::ValuesMerge {
                message: format!(
                    "dependency '{}' has no value at '{}' to import",
                    mapping.dependency, mapping.child
                ),
            })?;

            let mut layer = Values::new();
            if mapping.parent.is_empty() {
                match value {
                    JsonValue::Object(_) => layer = Values(value.clone()),
                    _ => {
                        return Err(CoreError::ValuesMerge {
                            message: format!(
                                "import of '{}' from '{}' into the root must be a mapping",
                                mapping.child, mapping.dependency
                            ),
                        });
                    }
                }
            } else {
                layer.set(&mapping.parent, value.clone())?;
            }
            imported.merge(&layer);
        }

        Ok(imported)
    }

    fn flatten(
        &self,
        package: &Package,
        values: &Values,
        global: &Values,
        scope: &mut Vec<String>,
        out: &mut Vec<EffectiveDependency>,
    ) -> Result<()> {
        for dep in &package.dependencies {
            if !dep.is_active(values) {
                continue;
            }

            let sub = package
                .subpackages
                .get(&dep.name)
                .ok_or_else(|| CoreError::MissingDependency {
                    parent: package.metadata.name.clone(),
                    name: dep.name.clone(),
                })?;

            let name = dep.effective_name();
            scope.push(name.to_string());
            if scope.len() > self.max_depth {
                return Err(CoreError::DependencyDepth {
                    scope: scope.join("/"),
                    max: self.max_depth,
                });
            }

            let mut child = sub.default_values();
            child.merge(&values.scope_for_dependency(name));
            child.inject_global(global);
            validate(sub, &child)?;

            out.push(EffectiveDependency {
                scope: scope.clone(),
                package: sub.clone(),
                values: child.clone(),
            });
            self.flatten(sub, &child, global, scope, out)?;
            scope.pop();
        }

        Ok(())
    }
}

fn validate(package: &Package, values: &Values) -> Result<()> {
    match &package.schema {
        Some(schema) => schema.compile()?.validate(&package.metadata.name, values),
        None => Ok(()),
    }
}
