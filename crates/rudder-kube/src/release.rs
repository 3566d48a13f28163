//! Revision records and their status state machine

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rudder_core::{Operation, PackageMetadata, Values};
use serde::{Deserialize, Serialize};

/// Default timeout for pending operations (5 minutes)
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// One revision of a release, as persisted by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    /// Release name
    pub name: String,

    /// Kubernetes namespace
    pub namespace: String,

    /// 1-based, strictly increasing per release
    pub revision: u32,

    pub status: RevisionStatus,

    /// Package metadata at deploy time
    pub package: PackageMetadata,

    /// Effective values the manifest was rendered from
    pub config: Values,

    /// Overrides the user supplied, layered again by `reuse_values`
    #[serde(default)]
    pub user_config: Values,

    /// Canonical manifest text, hooks included
    pub manifest: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Revision {
    /// Storage key for this revision
    pub fn storage_key(&self) -> String {
        format!("rudder.release.v1.{}.v{}", self.name, self.revision)
    }

    pub fn is_deployed(&self) -> bool {
        self.status == RevisionStatus::Deployed
    }

    /// Move to `status`, touching `updated_at`
    pub fn transition(&mut self, status: RevisionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Revision status with timing information for pending operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RevisionStatus {
    PendingInstall {
        started_at: DateTime<Utc>,
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },
    PendingUpgrade {
        started_at: DateTime<Utc>,
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },
    PendingRollback {
        started_at: DateTime<Utc>,
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },
    PendingUninstall {
        started_at: DateTime<Utc>,
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },

    /// Successfully deployed
    Deployed,

    Failed { reason: String },

    /// Replaced by a newer revision
    Superseded,

    /// Release was uninstalled with history kept
    Uninstalled,
}

impl RevisionStatus {
    /// The pending status of `operation`, starting now
    pub fn pending(operation: Operation, timeout: Duration) -> Self {
        let started_at = Utc::now();
        match operation {
            Operation::Install => Self::PendingInstall { started_at, timeout },
            Operation::Upgrade => Self::PendingUpgrade { started_at, timeout },
            Operation::Rollback => Self::PendingRollback { started_at, timeout },
            Operation::Uninstall => Self::PendingUninstall { started_at, timeout },
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// Check if this is a pending (transitional) state
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingInstall { .. }
                | Self::PendingUpgrade { .. }
                | Self::PendingRollback { .. }
                | Self::PendingUninstall { .. }
        )
    }

    /// Pending for longer than its timeout, so its operation is presumed dead
    pub fn is_stale(&self) -> bool {
        match self {
            Self::PendingInstall { started_at, timeout }
            | Self::PendingUpgrade { started_at, timeout }
            | Self::PendingRollback { started_at, timeout }
            | Self::PendingUninstall { started_at, timeout } => is_expired(*started_at, *timeout),
            _ => false,
        }
    }
}

impl fmt::Display for RevisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingInstall { .. } => write!(f, "pending-install"),
            Self::PendingUpgrade { .. } => write!(f, "pending-upgrade"),
            Self::PendingRollback { .. } => write!(f, "pending-rollback"),
            Self::PendingUninstall { .. } => write!(f, "pending-uninstall"),
            Self::Deployed => write!(f, "deployed"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
            Self::Superseded => write!(f, "superseded"),
            Self::Uninstalled => write!(f, "uninstalled"),
        }
    }
}

/// Has `timeout` elapsed since `started_at`?
pub(crate) fn is_expired(started_at: DateTime<Utc>, timeout: Duration) -> bool {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|t| started_at.checked_add_signed(t))
        .is_some_and(|deadline| Utc::now() > deadline)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revision(status: RevisionStatus) -> Revision {
        let now = Utc::now();
        Revision {
            name: "web".to_string(),
            namespace: "default".to_string(),
            revision: 2,
            status,
            package: PackageMetadata::new("web", semver::Version::new(1, 0, 0)),
            config: Values::new(),
            user_config: Values::new(),
            manifest: String::new(),
            notes: None,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_pending_status_matches_operation() {
        let status = RevisionStatus::pending(Operation::Rollback, DEFAULT_OPERATION_TIMEOUT);
        assert!(matches!(status, RevisionStatus::PendingRollback { .. }));
        assert!(status.is_pending());
        assert!(!status.is_stale());
        assert!(!RevisionStatus::Deployed.is_pending());
    }

    #[test]
    fn test_stale_detection() {
        let status = RevisionStatus::PendingUpgrade {
            started_at: Utc::now() - chrono::Duration::minutes(10),
            timeout: Duration::from_secs(60),
        };
        assert!(status.is_stale());
        assert!(!RevisionStatus::failed("boom").is_stale());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(RevisionStatus::failed("hook failed")).unwrap();
        assert_eq!(json, serde_json::json!({"status": "failed", "reason": "hook failed"}));

        let pending = RevisionStatus::pending(Operation::Install, Duration::from_secs(300));
        let json = serde_json::to_value(&pending).unwrap();
        assert_eq!(json["status"], "pending-install");
        assert_eq!(json["timeout"], "5m");
        let back: RevisionStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, pending);
    }

    #[test]
    fn test_transition_touches_updated_at() {
        let mut rev = revision(RevisionStatus::pending(Operation::Install, DEFAULT_OPERATION_TIMEOUT));
        let before = rev.updated_at;
        rev.transition(RevisionStatus::Deployed);
        assert!(rev.is_deployed());
        assert!(rev.updated_at >= before);
        assert_eq!(rev.storage_key(), "rudder.release.v1.web.v2");
        assert_eq!(rev.status.to_string(), "deployed");
    }
}
