//! Engine error types with source-annotated diagnostics

use miette::{Diagnostic, NamedSource, SourceSpan};
use once_cell::sync::Lazy;
use regex::Regex;
use rudder_core::CoreError;
use thiserror::Error;

use crate::suggestions::{
    AVAILABLE_FILTERS, AVAILABLE_FUNCTIONS, suggest_filter, suggest_function, suggest_values_path,
};

/// Main engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Template(#[from] Box<TemplateError>),

    #[error("Package error: {0}")]
    Core(#[from] CoreError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TemplateError> for EngineError {
    fn from(err: TemplateError) -> Self {
        Self::Template(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// What went wrong while rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TemplateErrorKind {
    /// A `required` assertion found no value
    RequiredValue,
    /// The template called `fail(...)`
    FailDirective,
    /// Malformed template syntax
    Syntax,
    UndefinedValue,
    UnknownFilter,
    UnknownFunction,
    Type,
    Other,
}

impl TemplateErrorKind {
    /// Convert to a code string for diagnostics
    pub fn to_code_string(&self) -> &'static str {
        match self {
            Self::RequiredValue => "required",
            Self::FailDirective => "fail",
            Self::Syntax => "syntax",
            Self::UndefinedValue => "undefined_value",
            Self::UnknownFilter => "unknown_filter",
            Self::UnknownFunction => "unknown_function",
            Self::Type => "type",
            Self::Other => "render",
        }
    }
}

/// Marker attached as the source of errors raised by `required` and `fail`
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Directive {
    #[error("required value missing")]
    Required,
    #[error("fail directive")]
    Fail,
}

impl Directive {
    /// Build the MiniJinja error a directive raises
    pub(crate) fn raise(self, message: impl Into<String>) -> minijinja::Error {
        minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, message.into()).with_source(self)
    }
}

/// Template-specific error with source information
#[derive(Error, Debug, Diagnostic, Clone)]
#[error("{template}{}: {message}", .line.map(|l| format!(":{}", l)).unwrap_or_default())]
#[diagnostic(code(rudder::template::render))]
pub struct TemplateError {
    /// Error message
    pub message: String,

    /// Error kind for categorization
    pub kind: TemplateErrorKind,

    /// Output path of the template that failed
    pub template: String,

    /// 1-based line in the failing template
    pub line: Option<usize>,

    /// Template source code
    #[source_code]
    pub src: NamedSource<String>,

    /// Error location in source
    #[label("error occurred here")]
    pub span: Option<SourceSpan>,

    /// Suggestion for fixing the error
    #[help]
    pub suggestion: Option<String>,
}

impl TemplateError {
    /// Build from a MiniJinja error raised while rendering `template_name`
    ///
    /// `sources` resolves template names to their text so errors raised inside
    /// an included helper point at the helper's line.
    pub fn from_minijinja<'a>(
        err: minijinja::Error,
        template_name: &str,
        sources: impl Fn(&str) -> Option<&'a str>,
        values: Option<&serde_json::Value>,
    ) -> Self {
        let failing = err.name().unwrap_or(template_name).to_string();
        let source = sources(&failing).unwrap_or_default();
        let line = err.line();
        let kind = categorize(&err);
        let message = clean_message(&err, kind);

        let span = line.and_then(|l| calculate_span(source, l));
        let line_text = line.and_then(|l| source.lines().nth(l.saturating_sub(1)));
        let suggestion = line_text.and_then(|text| generate_suggestion(kind, text, values));

        Self {
            message,
            kind,
            template: failing.clone(),
            line,
            src: NamedSource::new(failing, source.to_string()),
            span,
            suggestion,
        }
    }

    /// Create a simple error without source mapping
    pub fn simple(template: impl Into<String>, message: impl Into<String>) -> Self {
        let template = template.into();
        Self {
            message: message.into(),
            kind: TemplateErrorKind::Other,
            template: template.clone(),
            line: None,
            src: NamedSource::new(template, String::new()),
            span: None,
            suggestion: None,
        }
    }

    /// Prefix the template path with a dependency scope
    pub fn in_scope(mut self, scope: &str) -> Self {
        if !scope.is_empty() {
            self.template = format!("{}/{}", scope, self.template);
        }
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> TemplateErrorKind {
        self.kind
    }
}

fn categorize(err: &minijinja::Error) -> TemplateErrorKind {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(directive) = inner.downcast_ref::<Directive>() {
            return match directive {
                Directive::Required => TemplateErrorKind::RequiredValue,
                Directive::Fail => TemplateErrorKind::FailDirective,
            };
        }
        source = inner.source();
    }

    match err.kind() {
        minijinja::ErrorKind::SyntaxError | minijinja::ErrorKind::BadEscape => TemplateErrorKind::Syntax,
        minijinja::ErrorKind::UndefinedError => TemplateErrorKind::UndefinedValue,
        minijinja::ErrorKind::UnknownFilter => TemplateErrorKind::UnknownFilter,
        minijinja::ErrorKind::UnknownFunction => TemplateErrorKind::UnknownFunction,
        minijinja::ErrorKind::NonPrimitive
        | minijinja::ErrorKind::NonKey
        | minijinja::ErrorKind::CannotUnpack => TemplateErrorKind::Type,
        _ => TemplateErrorKind::Other,
    }
}

fn clean_message(err: &minijinja::Error, kind: TemplateErrorKind) -> String {
    let detail = err
        .detail()
        .map(str::to_string)
        .unwrap_or_else(|| err.kind().to_string());

    match kind {
        TemplateErrorKind::UndefinedValue => detail.replace("undefined value", "undefined variable"),
        _ => detail,
    }
}

/// Calculate the span of a whole 1-based line
fn calculate_span(source: &str, line_num: usize) -> Option<SourceSpan> {
    let mut offset = 0;

    for (idx, line) in source.lines().enumerate() {
        if idx + 1 == line_num {
            return Some(SourceSpan::new(offset.into(), line.len()));
        }
        offset += line.len() + 1;
    }

    None
}

static FILTER_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\|\s*([A-Za-z_][A-Za-z0-9_]*)").expect("static regex"));
static FUNCTION_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("static regex"));

fn generate_suggestion(
    kind: TemplateErrorKind,
    line: &str,
    values: Option<&serde_json::Value>,
) -> Option<String> {
    match kind {
        TemplateErrorKind::UndefinedValue => values.and_then(|v| suggest_values_path(line, v)),
        TemplateErrorKind::RequiredValue => {
            Some("provide the value in a values file or with --set key=value".to_string())
        }
        TemplateErrorKind::UnknownFilter => FILTER_CALL
            .captures_iter(line)
            .map(|c| c[1].to_string())
            .find(|name| !AVAILABLE_FILTERS.contains(&name.as_str()))
            .and_then(|name| suggest_filter(&name)),
        TemplateErrorKind::UnknownFunction => FUNCTION_CALL
            .captures_iter(line)
            .map(|c| c[1].to_string())
            .find(|name| !AVAILABLE_FUNCTIONS.contains(&name.as_str()))
            .and_then(|name| suggest_function(&name)),
        _ => None,
    }
}
