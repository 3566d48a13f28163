//! Rudder Kube - release lifecycle against a Kubernetes cluster
//!
//! This crate provides:
//! - **Manifest Sets**: Rendered files split into identified resources and hooks
//! - **Planning**: Three-way diff of desired, previous and live state into an ordered plan
//! - **Release Store**: Revision history with a per-release operation lock
//! - **Storage Drivers**: In-memory and file backends with compressed payloads
//! - **Hooks**: Phase hooks with weights, timeouts and delete policies
//! - **Orchestrator**: Install, upgrade, rollback and uninstall with atomic rollback
//! - **Annotations**: Helm-compatible annotation parsing with Rudder extensions

pub mod actions;
pub mod annotations;
pub mod cluster;
pub mod config;
pub mod error;
pub mod hooks;
pub mod manifest;
pub mod orchestrator;
pub mod plan;
pub mod release;
pub mod storage;
pub mod store;

pub use actions::{CancelToken, InstallOptions, RollbackOptions, UninstallOptions, UpgradeOptions};
pub use cluster::{Cluster, HookBehavior, InMemoryCluster, KubeCluster, OperationRecord, TerminalSignal};
pub use config::{RudderConfig, StorageBackend};
pub use error::{ApplyProgress, ClusterError, ErrorKind, KubeError, ManifestError, Result};
pub use hooks::{DeletePolicy, HookExecutor, HookOutcome, HookPhase, HookResult, HookSpec};
pub use manifest::{Manifest, ManifestSet, ManifestSetBuilder, Resource, ResourceId};
pub use orchestrator::{AppliedEntry, OperationPhase, OperationReport, Orchestrator};
pub use plan::{
    DriftPolicy, IgnoreRule, LiveState, Plan, PlanAction, PlanEntry, PlanReason, Planner,
    ResourceCategory,
};
pub use release::{DEFAULT_OPERATION_TIMEOUT, Revision, RevisionStatus};
pub use storage::{
    CompressionMethod, FileDriver, LockRecord, MemoryDriver, OperationCounts, StorageDriver,
};
pub use store::{NewRevision, OperationLock, RecoveryReport, ReleaseStore};
