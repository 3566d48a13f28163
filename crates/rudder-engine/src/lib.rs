//! Rudder Engine - Jinja2 templating for Kubernetes manifests
//!
//! Rendering is a pure function of the package, its resolved values and the
//! release context. The only escape hatch is `lookup()`, which stays inert
//! unless a [`Lookup`] source is configured.

pub mod engine;
pub mod error;
pub mod files_object;
pub mod filters;
pub mod functions;
pub mod lookup;
pub mod package_renderer;
pub mod suggestions;

pub use engine::{Engine, EngineBuilder, RenderResult};
pub use error::{EngineError, Result, TemplateError, TemplateErrorKind};
pub use files_object::FilesObject;
pub use lookup::{Lookup, StaticLookup};
pub use package_renderer::{PackageRenderer, RenderedPackage};
