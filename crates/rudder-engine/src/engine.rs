//! Template engine based on MiniJinja

use std::collections::BTreeMap;
use std::sync::Arc;

use minijinja::{Environment, UndefinedBehavior, Value};
use rudder_core::package::TEMPLATES_DIR;
use rudder_core::{PackageFiles, TemplateContext, TemplateInfo, TemplateSource};

use crate::error::{Result, TemplateError};
use crate::files_object::FilesObject;
use crate::lookup::{self, Lookup};
use crate::{filters, functions};

/// Rendered manifests of one package
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderResult {
    /// Rendered documents keyed by output path (`templates/deployment.yaml`)
    pub manifests: BTreeMap<String, String>,

    /// Rendered `NOTES.txt`, if any
    pub notes: Option<String>,
}

/// Template engine builder
#[derive(Debug, Default)]
pub struct EngineBuilder {
    lenient: bool,
    lookup: Option<Arc<dyn Lookup>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set strict mode (fail on undefined variables)
    pub fn strict(mut self, strict: bool) -> Self {
        self.lenient = !strict;
        self
    }

    /// Answer `lookup()` calls from `source` instead of an empty mapping
    pub fn lookup(mut self, source: Arc<dyn Lookup>) -> Self {
        self.lookup = Some(source);
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            strict: !self.lenient,
            lookup: self.lookup,
        }
    }
}

/// The template engine
#[derive(Debug, Clone)]
pub struct Engine {
    strict: bool,
    lookup: Option<Arc<dyn Lookup>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Engine {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            lookup: None,
        }
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Whether `lookup()` may return live data, making output non-reproducible
    pub fn has_lookup(&self) -> bool {
        self.lookup.is_some()
    }

    fn create_environment(&self) -> Environment<'static> {
        let mut env = Environment::new();

        env.set_undefined_behavior(if self.strict {
            UndefinedBehavior::Strict
        } else {
            UndefinedBehavior::Lenient
        });

        env.add_filter("toyaml", filters::toyaml);
        env.add_filter("tojson", filters::tojson);
        env.add_filter("b64encode", filters::b64encode);
        env.add_filter("b64decode", filters::b64decode);
        env.add_filter("quote", filters::quote);
        env.add_filter("squote", filters::squote);
        env.add_filter("indent", filters::indent);
        env.add_filter("nindent", filters::nindent);
        env.add_filter("required", filters::required);
        env.add_filter("empty", filters::empty);
        env.add_filter("haskey", filters::haskey);
        env.add_filter("sha256", filters::sha256);
        env.add_filter("trunc", filters::trunc);
        env.add_filter("trimprefix", filters::trimprefix);
        env.add_filter("trimsuffix", filters::trimsuffix);
        env.add_filter("semver_match", filters::semver_match);

        env.add_function("fail", functions::fail);
        env.add_function("dict", functions::dict);
        env.add_function("list", functions::list);
        env.add_function("get", functions::get);
        env.add_function("dig", functions::dig);
        env.add_function("coalesce", functions::coalesce);
        env.add_function("ternary", functions::ternary);
        env.add_function("tostring", functions::tostring);
        env.add_function("toint", functions::toint);

        let source = self.lookup.clone();
        env.add_function(
            "lookup",
            move |api_version: String, kind: String, namespace: String, name: String| {
                lookup::evaluate(source.as_ref(), &api_version, &kind, &namespace, &name)
            },
        );

        env
    }

    fn context_value(context: &TemplateContext, template: &TemplateInfo, files: Value) -> Value {
        minijinja::context! {
            values => &context.values,
            release => &context.release,
            package => &context.package,
            capabilities => &context.capabilities,
            template => template,
            files => files,
        }
    }

    /// Render a single template string
    pub fn render_string(
        &self,
        template: &str,
        context: &TemplateContext,
        template_name: &str,
    ) -> Result<String> {
        let mut env = self.create_environment();
        let sources = |_: &str| Some(template);

        env.add_template_owned(template_name.to_string(), template.to_string())
            .map_err(|e| TemplateError::from_minijinja(e, template_name, sources, Some(&context.values)))?;

        let files = FilesObject::new(PackageFiles::default()).into_value();
        let ctx = Self::context_value(context, &context.template, files);

        env.get_template(template_name)
            .and_then(|tmpl| tmpl.render(ctx))
            .map_err(|e| {
                TemplateError::from_minijinja(e, template_name, sources, Some(&context.values)).into()
            })
    }

    /// Render every non-helper template
    ///
    /// All sources are registered first so `include` and `import` can reach
    /// helpers. Documents that render to nothing are dropped and `NOTES.txt`
    /// becomes the notes.
    pub fn render(
        &self,
        templates: &[TemplateSource],
        context: &TemplateContext,
        files: &PackageFiles,
    ) -> Result<RenderResult> {
        let mut env = self.create_environment();
        let sources = |name: &str| {
            templates
                .iter()
                .find(|t| t.name == name)
                .map(|t| t.content.as_str())
        };

        for source in templates {
            env.add_template_owned(source.name.clone(), source.content.clone())
                .map_err(|e| {
                    TemplateError::from_minijinja(e, &source.name, sources, Some(&context.values))
                })?;
        }

        let files = FilesObject::new(files.clone()).into_value();
        let mut result = RenderResult::default();

        for source in templates.iter().filter(|t| !t.is_helper()) {
            let info = TemplateInfo {
                name: source.name.clone(),
                base_path: context.template.base_path.clone(),
            };
            let ctx = Self::context_value(context, &info, files.clone());

            let rendered = env
                .get_template(&source.name)
                .and_then(|tmpl| tmpl.render(ctx))
                .map_err(|e| {
                    TemplateError::from_minijinja(e, &source.name, sources, Some(&context.values))
                })?;

            if source.is_notes() {
                result.notes = Some(rendered);
                continue;
            }

            let trimmed = rendered.trim();
            if trimmed.is_empty() || trimmed == "---" {
                continue;
            }

            let output = source
                .name
                .trim_end_matches(".j2")
                .trim_end_matches(".jinja2");
            result
                .manifests
                .insert(format!("{}/{}", TEMPLATES_DIR, output), rendered);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, TemplateErrorKind};
    use crate::lookup::StaticLookup;
    use rudder_core::{PackageMetadata, ReleaseInfo, Values};
    use semver::Version;

    fn create_test_context() -> TemplateContext {
        let values = Values::from_yaml(
            r#"
image:
  repository: nginx
  tag: "1.25"
replicas: 3
"#,
        )
        .unwrap();

        let release = ReleaseInfo::for_install("myapp", "default");
        let mut package = PackageMetadata::new("mypackage", Version::new(1, 0, 0));
        package.app_version = Some("2.0.0".to_string());

        TemplateContext::new(values, release, &package)
    }

    fn template_error(err: EngineError) -> TemplateError {
        match err {
            EngineError::Template(e) => *e,
            other => panic!("expected template error, got {other:?}"),
        }
    }

    #[test]
    fn test_render_simple() {
        let engine = Engine::new(true);
        let ctx = create_test_context();

        let result = engine
            .render_string("replicas: {{ values.replicas }}", &ctx, "test.yaml")
            .unwrap();
        assert_eq!(result, "replicas: 3");
    }

    #[test]
    fn test_render_release_and_package() {
        let engine = Engine::default();
        let ctx = create_test_context();

        let template = "{{ release.name }}/{{ release.namespace }}/{{ release.revision }} {{ package.name }}@{{ package.appVersion }} {{ release.service }}";
        let result = engine.render_string(template, &ctx, "test.yaml").unwrap();
        assert_eq!(result, "myapp/default/1 mypackage@2.0.0 Rudder");
    }

    #[test]
    fn test_render_with_filters() {
        let engine = Engine::default();
        let ctx = create_test_context();

        let result = engine
            .render_string("image:{{ values.image | toyaml | nindent(2) }}", &ctx, "test.yaml")
            .unwrap();
        assert_eq!(result, "image:\n  repository: nginx\n  tag: '1.25'");
    }

    #[test]
    fn test_undefined_error_has_location_and_hint() {
        let engine = Engine::default();
        let ctx = create_test_context();

        let err = engine
            .render_string("a: 1\nreplicas: {{ values.replcias }}", &ctx, "deploy.yaml")
            .unwrap_err();
        let err = template_error(err);

        assert_eq!(err.kind, TemplateErrorKind::UndefinedValue);
        assert_eq!(err.template, "deploy.yaml");
        assert_eq!(err.line, Some(2));
        assert_eq!(err.suggestion.as_deref(), Some("did you mean `values.replicas`?"));
    }

    #[test]
    fn test_render_templates_with_helpers_and_notes() {
        let engine = Engine::default();
        let ctx = create_test_context();
        let templates = vec![
            TemplateSource::new("_helpers.tpl", "{% macro fullname(name) %}{{ name }}-web{% endmacro %}"),
            TemplateSource::new(
                "deployment.yaml.j2",
                "{% from '_helpers.tpl' import fullname %}name: {{ fullname(release.name) }}\ntemplate: {{ template.name }}",
            ),
            TemplateSource::new("empty.yaml", "{% if false %}x: 1{% endif %}\n---\n"),
            TemplateSource::new("NOTES.txt", "Installed {{ release.name }}"),
        ];

        let result = engine.render(&templates, &ctx, &PackageFiles::default()).unwrap();

        assert_eq!(result.manifests.len(), 1);
        assert_eq!(
            result.manifests["templates/deployment.yaml"],
            "name: myapp-web\ntemplate: deployment.yaml.j2"
        );
        assert_eq!(result.notes.as_deref(), Some("Installed myapp"));
    }

    #[test]
    fn test_render_is_pure() {
        let engine = Engine::default();
        let ctx = create_test_context();
        let templates = vec![TemplateSource::new(
            "cm.yaml",
            "data: {{ values | tojson | sha256 }}\nlookup: {{ lookup('v1', 'Secret', 'default', 'db') | length }}",
        )];

        let first = engine.render(&templates, &ctx, &PackageFiles::default()).unwrap();
        let second = engine.render(&templates, &ctx, &PackageFiles::default()).unwrap();
        assert_eq!(first, second);
        assert!(first.manifests["templates/cm.yaml"].ends_with("lookup: 0"));
    }

    #[test]
    fn test_required_and_fail_are_classified() {
        let engine = Engine::default();
        let ctx = create_test_context();

        let err = engine
            .render_string("{{ values.missing | required('missing is required') }}", &ctx, "a.yaml")
            .unwrap_err();
        let err = template_error(err);
        assert_eq!(err.kind, TemplateErrorKind::RequiredValue);
        assert_eq!(err.message, "missing is required");

        let err = engine
            .render_string("x: 1\n{{ fail('unsupported') }}", &ctx, "b.yaml")
            .unwrap_err();
        let err = template_error(err);
        assert_eq!(err.kind, TemplateErrorKind::FailDirective);
        assert_eq!(err.line, Some(2));
    }

    #[test]
    fn test_syntax_error_points_at_template() {
        let engine = Engine::default();
        let ctx = create_test_context();
        let templates = vec![TemplateSource::new("broken.yaml", "a: {{ values.replicas ")];

        let err = template_error(
            engine
                .render(&templates, &ctx, &PackageFiles::default())
                .unwrap_err(),
        );
        assert_eq!(err.kind, TemplateErrorKind::Syntax);
        assert_eq!(err.template, "broken.yaml");
    }

    #[test]
    fn test_lookup_with_source() {
        let source = StaticLookup::new().with_object(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"namespace": "default", "name": "existing"},
            "data": {"key": "value"}
        }));
        let engine = Engine::builder().lookup(Arc::new(source)).build();
        assert!(engine.has_lookup());

        let result = engine
            .render_string(
                "{{ lookup('v1', 'ConfigMap', 'default', 'existing').data.key }}",
                &create_test_context(),
                "x.yaml",
            )
            .unwrap();
        assert_eq!(result, "value");
    }
}
