//! Renders a package together with its effective dependencies

use std::collections::BTreeMap;

use rudder_core::{Capabilities, Package, PackageFiles, ReleaseInfo, ResolvedValues, TemplateContext};
use tracing::debug;

use crate::engine::Engine;
use crate::error::{EngineError, Result};

/// Output of rendering a package tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedPackage {
    /// Rendered documents keyed by path; dependency output is prefixed with
    /// its scope, e.g. `redis/templates/service.yaml`
    pub files: BTreeMap<String, String>,

    /// Release notes from the root package
    pub notes: Option<String>,

    /// `lookup()` was backed by a live source, so output may differ between
    /// a dry run and the real operation
    pub used_live_lookup: bool,
}

/// Renders the root package and every active dependency
#[derive(Debug, Clone, Default)]
pub struct PackageRenderer {
    engine: Engine,
}

impl PackageRenderer {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn render(
        &self,
        package: &Package,
        resolved: &ResolvedValues,
        release: &ReleaseInfo,
        capabilities: &Capabilities,
    ) -> Result<RenderedPackage> {
        package.check_kube_version(&capabilities.kube_version.version)?;

        let context = TemplateContext::new(resolved.values.clone(), release.clone(), &package.metadata)
            .with_capabilities(capabilities.clone());
        let root = self.engine.render(
            &package.templates,
            &context,
            &PackageFiles::new(package.files.clone()),
        )?;

        let mut rendered = RenderedPackage {
            files: root.manifests,
            notes: root.notes,
            used_live_lookup: self.engine.has_lookup(),
        };

        for dependency in &resolved.dependencies {
            let scope = dependency.path();
            dependency
                .package
                .check_kube_version(&capabilities.kube_version.version)?;

            let context = TemplateContext::new(
                dependency.values.clone(),
                release.clone(),
                &dependency.package.metadata,
            )
            .with_capabilities(capabilities.clone())
            .with_template("", &scope);

            let output = self
                .engine
                .render(
                    &dependency.package.templates,
                    &context,
                    &PackageFiles::new(dependency.package.files.clone()),
                )
                .map_err(|err| match err {
                    EngineError::Template(e) => EngineError::Template(Box::new(e.in_scope(&scope))),
                    other => other,
                })?;

            debug!(
                dependency = %scope,
                manifests = output.manifests.len(),
                "rendered dependency"
            );

            rendered.files.extend(
                output
                    .manifests
                    .into_iter()
                    .map(|(path, content)| (format!("{}/{}", scope, path), content)),
            );
        }

        debug!(
            package = %package.metadata.name,
            release = %release.name,
            files = rendered.files.len(),
            "rendered package"
        );

        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TemplateErrorKind;
    use rudder_core::{Dependency, UserOverrides, ValueResolver, Values};
    use semver::Version;

    fn redis() -> Package {
        Package::builder("redis", Version::new(7, 0, 0))
            .values(Values::from_yaml("port: 6379\narchitecture: standalone").unwrap())
            .template(
                "service.yaml",
                "port: {{ values.port }}\nenv: {{ values.global.env }}\nbase: {{ template.basePath }}",
            )
            .template("NOTES.txt", "redis notes are dropped")
            .build()
    }

    fn web() -> Package {
        Package::builder("web", Version::new(1, 2, 0))
            .values(Values::from_yaml("replicas: 1\nglobal:\n  env: prod\nredis:\n  port: 6380").unwrap())
            .file("config/app.conf", "listen 80")
            .template(
                "deployment.yaml",
                "replicas: {{ values.replicas }}\nconf: {{ files.get('config/app.conf') }}",
            )
            .template("NOTES.txt", "web is up")
            .dependency(Dependency::new("redis"), redis())
            .build()
    }

    fn render(package: &Package, overrides: UserOverrides) -> Result<RenderedPackage> {
        let resolved = ValueResolver::new()
            .resolve_package(package, &overrides)
            .unwrap();
        PackageRenderer::default().render(
            package,
            &resolved,
            &ReleaseInfo::for_install("web", "default"),
            &Capabilities::default(),
        )
    }

    #[test]
    fn test_render_root_and_dependency() {
        let rendered = render(&web(), UserOverrides::new().set("replicas=3")).unwrap();

        assert_eq!(
            rendered.files.keys().collect::<Vec<_>>(),
            vec!["redis/templates/service.yaml", "templates/deployment.yaml"]
        );
        insta::assert_snapshot!(rendered.files["templates/deployment.yaml"], @r"
        replicas: 3
        conf: listen 80
        ");
        assert_eq!(
            rendered.files["redis/templates/service.yaml"],
            "port: 6380\nenv: prod\nbase: redis"
        );
        assert_eq!(rendered.notes.as_deref(), Some("web is up"));
        assert!(!rendered.used_live_lookup);
    }

    #[test]
    fn test_render_twice_is_identical() {
        let first = render(&web(), UserOverrides::new()).unwrap();
        let second = render(&web(), UserOverrides::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_dependency_error_is_scoped() {
        let broken = Package::builder("redis", Version::new(7, 0, 0))
            .template("service.yaml", "{{ fail('no redis today') }}")
            .build();
        let package = Package::builder("web", Version::new(1, 0, 0))
            .dependency(Dependency::new("redis"), broken)
            .build();

        match render(&package, UserOverrides::new()) {
            Err(EngineError::Template(e)) => {
                assert_eq!(e.kind, TemplateErrorKind::FailDirective);
                assert_eq!(e.template, "redis/service.yaml");
                assert_eq!(e.message, "no redis today");
            }
            other => panic!("expected template error, got {other:?}"),
        }
    }

    #[test]
    fn test_kube_version_constraint() {
        let package = Package::builder("web", Version::new(1, 0, 0))
            .kube_version(">=1.40.0")
            .template("a.yaml", "a: 1")
            .build();

        assert!(matches!(
            render(&package, UserOverrides::new()),
            Err(EngineError::Core(_))
        ));
    }
}
