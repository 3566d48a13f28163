//! Rudder Core - package model and configuration resolution
//!
//! This crate provides the foundational types used throughout Rudder:
//! - `Package`: The package definition with bundled dependencies
//! - `Values`: Configuration trees with deep merge support
//! - `ValueResolver`: Layered value resolution and dependency scoping
//! - `Schema`: Values schema validation
//! - `TemplateContext`: What templates get to see

pub mod context;
pub mod error;
pub mod files;
pub mod package;
pub mod release;
pub mod resolver;
pub mod schema;
pub mod values;

pub use context::{Capabilities, KubeVersion, PackageInfo, TemplateContext, TemplateInfo};
pub use error::{CoreError, Result, ValidationErrorInfo};
pub use files::{FileEntry, PackageFiles};
pub use package::{Dependency, ImportValue, Package, PackageBuilder, PackageMetadata, TemplateSource};
pub use release::{Operation, ReleaseInfo};
pub use resolver::{EffectiveDependency, ImportMapping, ResolvedValues, UserOverrides, ValueResolver};
pub use schema::{Schema, SchemaValidator};
pub use values::{Values, parse_set_values};
