//! Error types for rudder-kube

use std::time::Duration;

use rudder_core::CoreError;
use rudder_engine::EngineError;
use thiserror::Error;

use crate::manifest::ResourceId;

/// Result type for rudder-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Coarse error category, for callers deciding whether to retry or surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad user input; never retried
    Config,
    /// Template expansion failed
    Render,
    /// Rendered output is not a valid manifest set
    Manifest,
    /// Another operation holds the release; retry after backoff
    ConcurrentModification,
    /// The cluster rejected an operation
    Apply,
    /// A hook reached a failed terminal state
    Hook,
    Timeout,
    /// The automatic rollback itself failed; manual recovery needed
    Rollback,
    /// The operation failed and was rolled back
    RolledBack,
    NotFound,
    AlreadyExists,
    Storage,
    Cancelled,
    Cluster,
}

/// Errors reported by a [`Cluster`](crate::cluster::Cluster)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("conflict on {resource}: {message}")]
    Conflict { resource: String, message: String },

    #[error("{resource} rejected: {message}")]
    Rejected { resource: String, message: String },

    #[error("transient cluster error: {message}")]
    Transient { message: String },

    #[error("cluster error: {message}")]
    Other { message: String },
}

impl ClusterError {
    /// Worth another attempt within the retry budget
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Transient { .. })
    }
}

/// Structural problems in rendered output
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("{source_file} (document {document}): invalid YAML: {message}")]
    Parse {
        source_file: String,
        document: usize,
        message: String,
    },

    #[error("{source_file} (document {document}): document is not a mapping")]
    NotAMapping { source_file: String, document: usize },

    #[error("{source_file} (document {document}): missing required field '{field}'")]
    MissingField {
        source_file: String,
        document: usize,
        field: &'static str,
    },

    #[error("duplicate resource {id} (defined in {first} and {second})")]
    Duplicate {
        id: ResourceId,
        first: String,
        second: String,
    },

    #[error("{source_file}: invalid hook on {id}: {message}")]
    InvalidHook {
        source_file: String,
        id: ResourceId,
        message: String,
    },
}

/// Which plan entries were applied before a failure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyProgress {
    pub applied: Vec<ResourceId>,
    pub remaining: Vec<ResourceId>,
}

impl std::fmt::Display for ApplyProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} applied, {} not attempted",
            self.applied.len(),
            self.remaining.len()
        )
    }
}

/// Errors that can occur during release operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Invalid values, schema violation or unsatisfied constraint
    #[error("configuration error: {0}")]
    Config(#[source] CoreError),

    /// Template rendering error
    #[error("render error: {0}")]
    Render(#[source] EngineError),

    /// Unusable Rudder configuration file
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    /// Another operation is in progress on the release
    #[error("another operation ({operation}) is in progress for release '{name}' in namespace '{namespace}' since {since}\nHint: retry later, or run recover if the operation crashed")]
    ConcurrentModification {
        name: String,
        namespace: String,
        operation: String,
        since: String,
    },

    /// The cluster refused a plan entry
    #[error("failed to apply {resource}: {message} ({progress})")]
    Apply {
        resource: String,
        message: String,
        progress: ApplyProgress,
    },

    /// Hook execution failed
    #[error("hook '{hook}' failed during {phase}: {message}")]
    HookFailed {
        hook: String,
        phase: String,
        message: String,
    },

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    /// The operation failed and the release was restored
    #[error("release '{name}' revision {revision} failed and was rolled back: {cause}")]
    RolledBack {
        name: String,
        revision: u32,
        cause: Box<KubeError>,
    },

    /// The automatic rollback failed; the release needs manual attention
    #[error("rollback of release '{name}' failed: {message} (original failure: {cause})")]
    Rollback {
        name: String,
        message: String,
        cause: Box<KubeError>,
    },

    /// Release not found
    #[error("release '{name}' not found in namespace '{namespace}'")]
    ReleaseNotFound { name: String, namespace: String },

    #[error("revision {revision} of release '{name}' not found in namespace '{namespace}'")]
    RevisionNotFound {
        name: String,
        namespace: String,
        revision: u32,
    },

    /// Release already exists
    #[error("release '{name}' already exists in namespace '{namespace}'")]
    ReleaseAlreadyExists { name: String, namespace: String },

    #[error("operation on release '{name}' was cancelled")]
    Cancelled { name: String },

    /// Storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Compression error
    #[error("compression error: {0}")]
    Compression(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<CoreError> for KubeError {
    fn from(e: CoreError) -> Self {
        KubeError::Config(e)
    }
}

impl From<EngineError> for KubeError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Core(core) => KubeError::Config(core),
            other => KubeError::Render(other),
        }
    }
}

impl KubeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::InvalidConfig { .. } => ErrorKind::Config,
            Self::Render(_) => ErrorKind::Render,
            Self::Manifest(_) => ErrorKind::Manifest,
            Self::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            Self::Apply { .. } => ErrorKind::Apply,
            Self::HookFailed { .. } => ErrorKind::Hook,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RolledBack { .. } => ErrorKind::RolledBack,
            Self::Rollback { .. } => ErrorKind::Rollback,
            Self::ReleaseNotFound { .. } | Self::RevisionNotFound { .. } => ErrorKind::NotFound,
            Self::ReleaseAlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Storage(_) | Self::Serialization(_) | Self::Compression(_) | Self::Io(_) => {
                ErrorKind::Storage
            }
            Self::Cluster(_) | Self::Api(_) => ErrorKind::Cluster,
        }
    }

    /// Only contention is worth retrying automatically
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ConcurrentModification
    }

    /// Errors raised before anything touched the cluster
    pub fn is_preflight(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Config | ErrorKind::Render | ErrorKind::Manifest
        )
    }

    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 404)
            || matches!(self, KubeError::Cluster(ClusterError::NotFound { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_core_errors_become_config() {
        let err: KubeError = EngineError::Core(CoreError::ValuesMerge {
            message: "bad".into(),
        })
        .into();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.is_preflight());
    }

    #[test]
    fn test_only_contention_is_retryable() {
        let busy = KubeError::ConcurrentModification {
            name: "web".into(),
            namespace: "default".into(),
            operation: "upgrade".into(),
            since: "now".into(),
        };
        assert!(busy.is_retryable());
        assert!(!KubeError::Storage("disk full".into()).is_retryable());
    }

    #[test]
    fn test_cluster_error_retry_classes() {
        assert!(ClusterError::Transient { message: "503".into() }.is_retryable());
        assert!(
            !ClusterError::Rejected {
                resource: "x".into(),
                message: "invalid".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_apply_error_reports_progress() {
        let err = KubeError::Apply {
            resource: "apps/Deployment/default/web".into(),
            message: "denied".into(),
            progress: ApplyProgress {
                applied: vec![],
                remaining: vec![],
            },
        };
        assert_eq!(
            err.to_string(),
            "failed to apply apps/Deployment/default/web: denied (0 applied, 0 not attempted)"
        );
    }
}
