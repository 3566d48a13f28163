//! Release identity as seen by templates

use serde::{Deserialize, Serialize};

/// Name reported as `release.service`
pub const SERVICE_NAME: &str = "Rudder";

/// Kind of lifecycle operation producing a revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Install,
    Upgrade,
    Rollback,
    Uninstall,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::Rollback => "rollback",
            Self::Uninstall => "uninstall",
        };
        f.write_str(s)
    }
}

/// Release information for templates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Revision number being rendered
    pub revision: u32,

    /// Is this an install operation?
    pub is_install: bool,

    /// Is this an upgrade operation?
    pub is_upgrade: bool,

    /// Is this a rollback operation?
    pub is_rollback: bool,

    /// Service (always "Rudder")
    pub service: String,
}

impl ReleaseInfo {
    /// Create release info for a new install
    pub fn for_install(name: &str, namespace: &str) -> Self {
        Self::for_operation(name, namespace, 1, Operation::Install)
    }

    /// Create release info for an upgrade
    pub fn for_upgrade(name: &str, namespace: &str, revision: u32) -> Self {
        Self::for_operation(name, namespace, revision, Operation::Upgrade)
    }

    pub fn for_operation(name: &str, namespace: &str, revision: u32, operation: Operation) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision,
            is_install: operation == Operation::Install,
            is_upgrade: operation == Operation::Upgrade,
            is_rollback: operation == Operation::Rollback,
            service: SERVICE_NAME.to_string(),
        }
    }
}
