//! Lifecycle orchestrator: install, upgrade, rollback and uninstall
//!
//! Every mutating operation runs the same state machine:
//!
//! ```text
//! Planning -> PreHooks -> Applying -> PostHooks -> Finalizing -> Deployed
//!                  \           |           /
//!                   +------> Failed ------+--(atomic)--> RollingBack -> RolledBack
//! ```
//!
//! Planning is pure: resolving values, rendering and building the manifest
//! set happen before a revision exists, so a bad input never leaves a
//! revision behind. From the first revision write on, every exit path
//! records a terminal status and releases the per-release lock.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rudder_core::{Capabilities, Operation, Package, ReleaseInfo, UserOverrides, ValueResolver, Values};
use rudder_engine::{Engine, Lookup, PackageRenderer};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::actions::{Budget, CancelToken, InstallOptions, RollbackOptions, UninstallOptions, UpgradeOptions};
use crate::cluster::{Cluster, apply_with_retries, patch_with_retries};
use crate::config::RudderConfig;
use crate::error::{ApplyProgress, ClusterError, KubeError, Result};
use crate::hooks::{HookExecutor, HookPhase, HookResult};
use crate::manifest::{ManifestSet, ResourceId};
use crate::plan::{LiveState, Plan, PlanAction, PlanEntry, Planner};
use crate::release::{Revision, RevisionStatus};
use crate::storage::StorageDriver;
use crate::store::{NewRevision, OperationLock, RecoveryReport, ReleaseStore};

/// Metadata fields the API server owns; never sent back on apply
const SERVER_METADATA: &[&str] = &["managedFields", "resourceVersion", "uid", "creationTimestamp", "generation"];

/// States of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationPhase {
    Planning,
    PreHooks,
    Applying,
    PostHooks,
    Finalizing,
    RollingBack,
    Deployed,
    Failed,
    RolledBack,
    Uninstalled,
}

impl OperationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deployed | Self::Failed | Self::RolledBack | Self::Uninstalled)
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::PreHooks => "pre-hooks",
            Self::Applying => "applying",
            Self::PostHooks => "post-hooks",
            Self::Finalizing => "finalizing",
            Self::RollingBack => "rolling-back",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled-back",
            Self::Uninstalled => "uninstalled",
        };
        f.write_str(s)
    }
}

/// A plan entry that reached the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedEntry {
    pub id: ResourceId,
    pub action: PlanAction,
}

/// What an operation did
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub operation: Operation,
    pub release: String,
    pub namespace: String,
    /// Revision created, or the one uninstalled
    pub revision: u32,
    /// Final phase; `Planning` for dry runs
    pub outcome: OperationPhase,
    /// Phases entered, in order
    pub phases: Vec<OperationPhase>,
    pub plan: Plan,
    pub applied: Vec<AppliedEntry>,
    pub hooks: Vec<HookResult>,
    pub notes: Option<String>,
    /// Non-fatal problems, e.g. hooks that could not be cleaned up
    pub warnings: Vec<String>,
    pub dry_run: bool,
}

/// Progress of one operation, turned into a report at the end
struct Run {
    operation: Operation,
    release: String,
    namespace: String,
    revision: u32,
    phases: Vec<OperationPhase>,
    plan: Plan,
    applied: Vec<AppliedEntry>,
    warnings: Vec<String>,
}

impl Run {
    fn new(operation: Operation, release: &str, namespace: &str, revision: u32) -> Self {
        let mut run = Self {
            operation,
            release: release.to_string(),
            namespace: namespace.to_string(),
            revision,
            phases: Vec::new(),
            plan: Plan::default(),
            applied: Vec::new(),
            warnings: Vec::new(),
        };
        run.enter(OperationPhase::Planning);
        run
    }

    fn enter(&mut self, phase: OperationPhase) {
        info!(
            release = %self.release,
            namespace = %self.namespace,
            revision = self.revision,
            operation = %self.operation,
            %phase,
            "entering phase"
        );
        self.phases.push(phase);
    }

    fn outcome(&self) -> OperationPhase {
        self.phases.last().copied().unwrap_or(OperationPhase::Planning)
    }

    fn into_report(self, hooks: Vec<HookResult>, notes: Option<String>, dry_run: bool) -> OperationReport {
        OperationReport {
            outcome: self.outcome(),
            operation: self.operation,
            release: self.release,
            namespace: self.namespace,
            revision: self.revision,
            phases: self.phases,
            plan: self.plan,
            applied: self.applied,
            hooks,
            notes,
            warnings: self.warnings,
            dry_run,
        }
    }
}

/// Output of the pure planning steps
struct Prepared {
    set: ManifestSet,
    manifest: String,
    config: Values,
    user_config: Values,
    notes: Option<String>,
}

/// Inputs of the hook and apply phases
struct Deployment<'a> {
    operation: Operation,
    desired: &'a ManifestSet,
    previous: Option<&'a ManifestSet>,
    /// Source of the operation's hooks
    hooks: &'a ManifestSet,
    /// Restored by an atomic operation that fails; `None` removes everything
    restore: Option<&'a ManifestSet>,
    atomic: bool,
    no_hooks: bool,
    timeout: Duration,
    cancel: Option<CancelToken>,
}

/// Drives releases through their lifecycle
pub struct Orchestrator<S, C> {
    store: ReleaseStore<S>,
    cluster: C,
    renderer: PackageRenderer,
    resolver: ValueResolver,
    planner: Planner,
    config: RudderConfig,
    capabilities: Capabilities,
}

impl<S: StorageDriver, C: Cluster> Orchestrator<S, C> {
    pub fn new(store: ReleaseStore<S>, cluster: C) -> Self {
        Self::with_config(store, cluster, RudderConfig::default())
    }

    pub fn with_config(store: ReleaseStore<S>, cluster: C, config: RudderConfig) -> Self {
        Self {
            store,
            cluster,
            renderer: PackageRenderer::new(Engine::builder().build()),
            resolver: ValueResolver::new(),
            planner: config.planner(),
            config,
            capabilities: Capabilities::default(),
        }
    }

    /// Answer template `lookup()` calls from `source`
    pub fn with_lookup(mut self, source: Arc<dyn Lookup>) -> Self {
        self.renderer = PackageRenderer::new(Engine::builder().lookup(source).build());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn store(&self) -> &ReleaseStore<S> {
        &self.store
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    pub fn config(&self) -> &RudderConfig {
        &self.config
    }

    /// Install a new release
    pub async fn install(
        &self,
        package: &Package,
        overrides: &UserOverrides,
        opts: &InstallOptions,
    ) -> Result<OperationReport> {
        let timeout = opts.timeout.unwrap_or(self.config.timeout);
        if opts.dry_run {
            let history = self.store.list_revisions(&opts.namespace, &opts.name).await?;
            ensure_installable(&history, &opts.name, &opts.namespace)?;
            let release = release_info(&history, &opts.name, &opts.namespace, Operation::Install);
            let previous = self.applied_set(&opts.namespace, &history)?;
            return self
                .preview(release, package, overrides, &previous, timeout)
                .await;
        }

        let lock = self
            .store
            .lock(&opts.namespace, &opts.name, Operation::Install, timeout)
            .await?;
        let result = self.install_locked(&lock, package, overrides, opts, timeout).await;
        self.finish(lock, result).await
    }

    async fn install_locked(
        &self,
        lock: &OperationLock,
        package: &Package,
        overrides: &UserOverrides,
        opts: &InstallOptions,
        timeout: Duration,
    ) -> Result<OperationReport> {
        let (name, namespace) = (lock.name(), lock.namespace());
        let history = self.store.list_revisions(namespace, name).await?;
        ensure_installable(&history, name, namespace)?;

        let release = release_info(&history, name, namespace, Operation::Install);
        let prepared = self.prepare(package, overrides, &release)?;
        // A failed predecessor may have left resources behind
        let previous = self.applied_set(namespace, &history)?;

        let deployment = Deployment {
            operation: Operation::Install,
            desired: &prepared.set,
            previous: Some(&previous),
            hooks: &prepared.set,
            restore: None,
            atomic: opts.atomic,
            no_hooks: opts.no_hooks,
            timeout,
            cancel: opts.cancel.clone(),
        };
        let new = NewRevision {
            package: package.metadata.clone(),
            config: prepared.config,
            user_config: prepared.user_config,
            manifest: prepared.manifest,
            notes: prepared.notes,
            description: Some(
                opts.description
                    .clone()
                    .unwrap_or_else(|| "Install complete".to_string()),
            ),
        };
        self.execute(lock, new, deployment, opts.max_history).await
    }

    /// Upgrade a release to a new package or configuration
    pub async fn upgrade(
        &self,
        package: &Package,
        overrides: &UserOverrides,
        opts: &UpgradeOptions,
    ) -> Result<OperationReport> {
        let timeout = opts.timeout.unwrap_or(self.config.timeout);
        if opts.dry_run {
            let history = self.store.list_revisions(&opts.namespace, &opts.name).await?;
            let current = current_revision(&history, &opts.name, &opts.namespace)?;
            let user = upgrade_overrides(current, overrides, opts)?;
            let release = release_info(&history, &opts.name, &opts.namespace, Operation::Upgrade);
            let previous = self.applied_set(&opts.namespace, &history)?;
            return self
                .preview(release, package, &user, &previous, timeout)
                .await;
        }

        let lock = self
            .store
            .lock(&opts.namespace, &opts.name, Operation::Upgrade, timeout)
            .await?;
        let result = self.upgrade_locked(&lock, package, overrides, opts, timeout).await;
        self.finish(lock, result).await
    }

    async fn upgrade_locked(
        &self,
        lock: &OperationLock,
        package: &Package,
        overrides: &UserOverrides,
        opts: &UpgradeOptions,
        timeout: Duration,
    ) -> Result<OperationReport> {
        let (name, namespace) = (lock.name(), lock.namespace());
        let history = self.store.list_revisions(namespace, name).await?;
        let current = current_revision(&history, name, namespace)?;

        let user = upgrade_overrides(current, overrides, opts)?;
        let release = release_info(&history, name, namespace, Operation::Upgrade);
        let prepared = self.prepare(package, &user, &release)?;
        let previous = self.applied_set(namespace, &history)?;
        let restore = self
            .config
            .manifest_builder(namespace)
            .parse_manifest(&current.manifest)?;

        let deployment = Deployment {
            operation: Operation::Upgrade,
            desired: &prepared.set,
            previous: Some(&previous),
            hooks: &prepared.set,
            restore: Some(&restore),
            atomic: opts.atomic,
            no_hooks: opts.no_hooks,
            timeout,
            cancel: opts.cancel.clone(),
        };
        let new = NewRevision {
            package: package.metadata.clone(),
            config: prepared.config,
            user_config: prepared.user_config,
            manifest: prepared.manifest,
            notes: prepared.notes,
            description: Some(
                opts.description
                    .clone()
                    .unwrap_or_else(|| format!("Upgrade to {} complete", package.metadata.version)),
            ),
        };
        self.execute(lock, new, deployment, opts.max_history).await
    }

    /// Roll a release back to an earlier revision's manifest
    ///
    /// Creates a new revision; nothing is re-rendered.
    pub async fn rollback(&self, opts: &RollbackOptions) -> Result<OperationReport> {
        let timeout = opts.timeout.unwrap_or(self.config.timeout);
        if opts.dry_run {
            let history = self.store.list_revisions(&opts.namespace, &opts.name).await?;
            let target = rollback_target(&history, opts)?;
            current_revision(&history, &opts.name, &opts.namespace)?;
            let desired = self
                .config
                .manifest_builder(&opts.namespace)
                .parse_manifest(&target.manifest)?;
            let previous = self.applied_set(&opts.namespace, &history)?;

            let mut run = Run::new(
                Operation::Rollback,
                &opts.name,
                &opts.namespace,
                next_number(&history),
            );
            run.plan = self.plan_against_live(&desired, Some(&previous), &opts.name, timeout).await?;
            return Ok(run.into_report(Vec::new(), target.notes.clone(), true));
        }

        let lock = self
            .store
            .lock(&opts.namespace, &opts.name, Operation::Rollback, timeout)
            .await?;
        let result = self.rollback_locked(&lock, opts, timeout).await;
        self.finish(lock, result).await
    }

    async fn rollback_locked(
        &self,
        lock: &OperationLock,
        opts: &RollbackOptions,
        timeout: Duration,
    ) -> Result<OperationReport> {
        let (name, namespace) = (lock.name(), lock.namespace());
        let history = self.store.list_revisions(namespace, name).await?;
        let target = rollback_target(&history, opts)?;
        current_revision(&history, name, namespace)?;

        let desired = self
            .config
            .manifest_builder(namespace)
            .parse_manifest(&target.manifest)?;
        // Everything since the last settled revision, failed attempts included
        let previous = self.applied_set(namespace, &history)?;
        info!(release = name, namespace, target = target.revision, "rolling back");

        let deployment = Deployment {
            operation: Operation::Rollback,
            desired: &desired,
            previous: Some(&previous),
            hooks: &desired,
            restore: None,
            atomic: false,
            no_hooks: opts.no_hooks,
            timeout,
            cancel: opts.cancel.clone(),
        };
        let new = NewRevision {
            package: target.package.clone(),
            config: target.config.clone(),
            user_config: target.user_config.clone(),
            manifest: target.manifest.clone(),
            notes: target.notes.clone(),
            description: Some(
                opts.description
                    .clone()
                    .unwrap_or_else(|| format!("Rollback to {}", target.revision)),
            ),
        };
        self.execute(lock, new, deployment, opts.max_history).await
    }

    /// Remove a release's resources, and its history unless kept
    pub async fn uninstall(&self, opts: &UninstallOptions) -> Result<OperationReport> {
        let timeout = opts.timeout.unwrap_or(self.config.timeout);
        if opts.dry_run {
            let history = self.store.list_revisions(&opts.namespace, &opts.name).await?;
            let current = uninstall_target(&history, &opts.name, &opts.namespace)?;
            let previous = self.applied_set(&opts.namespace, &history)?;

            let mut run = Run::new(Operation::Uninstall, &opts.name, &opts.namespace, current.revision);
            run.plan = self
                .plan_against_live(&ManifestSet::new(), Some(&previous), &opts.name, timeout)
                .await?;
            return Ok(run.into_report(Vec::new(), None, true));
        }

        let lock = self
            .store
            .lock(&opts.namespace, &opts.name, Operation::Uninstall, timeout)
            .await?;
        let result = self.uninstall_locked(opts, timeout).await;
        self.finish(lock, result).await
    }

    async fn uninstall_locked(&self, opts: &UninstallOptions, timeout: Duration) -> Result<OperationReport> {
        let (name, namespace) = (opts.name.as_str(), opts.namespace.as_str());
        let history = self.store.list_revisions(namespace, name).await?;
        let current = uninstall_target(&history, name, namespace)?;
        let previous = self.applied_set(namespace, &history)?;
        let hook_source = self
            .config
            .manifest_builder(namespace)
            .parse_manifest(&current.manifest)?;
        let empty = ManifestSet::new();

        let deployment = Deployment {
            operation: Operation::Uninstall,
            desired: &empty,
            previous: Some(&previous),
            hooks: &hook_source,
            restore: None,
            atomic: false,
            no_hooks: opts.no_hooks,
            timeout,
            cancel: opts.cancel.clone(),
        };

        let mut run = Run::new(Operation::Uninstall, name, namespace, current.revision);
        self.store
            .set_status(
                namespace,
                name,
                current.revision,
                RevisionStatus::pending(Operation::Uninstall, timeout),
            )
            .await?;

        let budget = Budget::new(name, timeout, opts.cancel.clone());
        let mut hooks = HookExecutor::new(&self.cluster, self.config.apply_retries);
        if let Err(cause) = self.drive(&mut run, &deployment, &mut hooks, &budget).await {
            return Err(self.fail(&mut run, &deployment, cause).await);
        }

        run.enter(OperationPhase::Finalizing);
        run.warnings.extend(hooks.cleanup_succeeded(&budget).await);
        if opts.keep_history {
            let mut revision = self
                .store
                .set_status(namespace, name, current.revision, RevisionStatus::Uninstalled)
                .await?;
            if let Some(description) = &opts.description {
                revision.description = Some(description.clone());
                self.store.driver().update(&revision).await?;
            }
        } else {
            let removed = self.store.delete_release(namespace, name).await?;
            debug!(release = name, namespace, revisions = removed.len(), "deleted release history");
        }
        run.enter(OperationPhase::Uninstalled);

        Ok(run.into_report(hooks.into_results(), None, false))
    }

    /// All revisions of a release, oldest first
    pub async fn history(&self, namespace: &str, name: &str) -> Result<Vec<Revision>> {
        let history = self.store.list_revisions(namespace, name).await?;
        if history.is_empty() {
            return Err(KubeError::ReleaseNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        }
        Ok(history)
    }

    /// Latest revision of a release
    pub async fn status(&self, namespace: &str, name: &str) -> Result<Revision> {
        self.store.latest(namespace, name).await
    }

    /// Plan an install or upgrade without changing anything
    pub async fn dry_run_plan(
        &self,
        name: &str,
        namespace: &str,
        package: &Package,
        overrides: &UserOverrides,
    ) -> Result<Plan> {
        let history = self.store.list_revisions(namespace, name).await?;
        let current = history
            .iter()
            .rev()
            .find(|r| r.is_deployed())
            .or(history.last());
        let operation = if current.is_some_and(Revision::is_deployed) {
            Operation::Upgrade
        } else {
            Operation::Install
        };
        let release = release_info(&history, name, namespace, operation);
        let previous = self.applied_set(namespace, &history)?;
        let report = self
            .preview(release, package, overrides, &previous, self.config.timeout)
            .await?;
        Ok(report.plan)
    }

    /// Clear a stale lock and fail pending revisions left by a crash
    pub async fn recover(&self, namespace: &str, name: &str, force: bool) -> Result<RecoveryReport> {
        self.store.recover(namespace, name, force).await
    }

    /// Resolve values, render and build the manifest set
    fn prepare(&self, package: &Package, user: &UserOverrides, release: &ReleaseInfo) -> Result<Prepared> {
        let user_config = user.flatten()?;
        let resolved = self.resolver.resolve_package(package, user)?;
        let rendered = self
            .renderer
            .render(package, &resolved, release, &self.capabilities)?;
        if rendered.used_live_lookup {
            debug!(release = %release.name, "rendered with live lookups");
        }

        let set = self
            .config
            .manifest_builder(&release.namespace)
            .build(&rendered.files)?;
        let manifest = set.to_manifest()?;
        Ok(Prepared {
            set,
            manifest,
            config: resolved.values,
            user_config,
            notes: rendered.notes,
        })
    }

    /// Dry run of an install or upgrade
    async fn preview(
        &self,
        release: ReleaseInfo,
        package: &Package,
        user: &UserOverrides,
        previous: &ManifestSet,
        timeout: Duration,
    ) -> Result<OperationReport> {
        let prepared = self.prepare(package, user, &release)?;
        let operation = if release.is_upgrade {
            Operation::Upgrade
        } else {
            Operation::Install
        };

        let mut run = Run::new(operation, &release.name, &release.namespace, release.revision);
        run.plan = self
            .plan_against_live(&prepared.set, Some(previous), &release.name, timeout)
            .await?;
        Ok(run.into_report(Vec::new(), prepared.notes, true))
    }

    async fn plan_against_live(
        &self,
        desired: &ManifestSet,
        previous: Option<&ManifestSet>,
        release: &str,
        timeout: Duration,
    ) -> Result<Plan> {
        let budget = Budget::new(release, timeout, None);
        let sets: Vec<&ManifestSet> = std::iter::once(desired).chain(previous).collect();
        let live = self.live_state(&sets, &budget).await?;
        Ok(self.planner.plan(desired, previous, &live))
    }

    /// Create the revision, run it, and settle its final status
    async fn execute(
        &self,
        lock: &OperationLock,
        new: NewRevision,
        deployment: Deployment<'_>,
        max_history: Option<u32>,
    ) -> Result<OperationReport> {
        let notes = new.notes.clone();
        let revision = self.store.create_revision(lock, new).await?;
        let (name, namespace) = (revision.name.as_str(), revision.namespace.as_str());

        let mut run = Run::new(deployment.operation, name, namespace, revision.revision);
        let budget = Budget::new(name, deployment.timeout, deployment.cancel.clone());
        let mut hooks = HookExecutor::new(&self.cluster, self.config.apply_retries);

        if let Err(cause) = self.drive(&mut run, &deployment, &mut hooks, &budget).await {
            return Err(self.fail(&mut run, &deployment, cause).await);
        }

        run.enter(OperationPhase::Finalizing);
        self.store
            .set_status(namespace, name, revision.revision, RevisionStatus::Deployed)
            .await?;
        for older in self.store.list_revisions(namespace, name).await? {
            if older.revision != revision.revision && older.is_deployed() {
                self.store
                    .set_status(namespace, name, older.revision, RevisionStatus::Superseded)
                    .await?;
            }
        }
        run.warnings.extend(hooks.cleanup_succeeded(&budget).await);
        self.store
            .purge_history(namespace, name, max_history.unwrap_or(self.config.max_history))
            .await?;
        run.enter(OperationPhase::Deployed);

        Ok(run.into_report(hooks.into_results(), notes, false))
    }

    /// PreHooks, Applying and PostHooks
    async fn drive<'c>(
        &'c self,
        run: &mut Run,
        deployment: &Deployment<'_>,
        hooks: &mut HookExecutor<'c, C>,
        budget: &Budget,
    ) -> Result<()> {
        let sets: Vec<&ManifestSet> = std::iter::once(deployment.desired)
            .chain(deployment.previous)
            .collect();
        let live = self.live_state(&sets, budget).await?;
        run.plan = self.planner.plan(deployment.desired, deployment.previous, &live);
        info!(release = %run.release, revision = run.revision, plan = %run.plan.summary(), "planned");

        let (pre, post) = HookPhase::for_operation(deployment.operation);
        if !deployment.no_hooks {
            run.enter(OperationPhase::PreHooks);
            hooks.execute_phase(deployment.hooks, pre, budget).await?;
        }

        run.enter(OperationPhase::Applying);
        self.apply_plan(&run.plan, budget, &mut run.applied).await?;

        if !deployment.no_hooks {
            run.enter(OperationPhase::PostHooks);
            hooks.execute_phase(deployment.hooks, post, budget).await?;
        }
        Ok(())
    }

    /// Record the failure and, for atomic operations, restore the release
    ///
    /// Returns the error the operation ends with.
    async fn fail(&self, run: &mut Run, deployment: &Deployment<'_>, cause: KubeError) -> KubeError {
        warn!(
            release = %run.release,
            namespace = %run.namespace,
            revision = run.revision,
            error = %cause,
            "operation failed"
        );
        run.enter(OperationPhase::Failed);

        if let Err(e) = self
            .store
            .set_status(
                &run.namespace,
                &run.release,
                run.revision,
                RevisionStatus::failed(cause.to_string()),
            )
            .await
        {
            return KubeError::Storage(format!(
                "could not mark revision {} failed ({}) after: {}",
                run.revision, e, cause
            ));
        }

        // A cancelled operation stops where it is
        if !deployment.atomic || matches!(cause, KubeError::Cancelled { .. }) {
            return cause;
        }

        run.enter(OperationPhase::RollingBack);
        match self.restore(deployment).await {
            Ok(()) => {
                run.enter(OperationPhase::RolledBack);
                KubeError::RolledBack {
                    name: run.release.clone(),
                    revision: run.revision,
                    cause: Box::new(cause),
                }
            }
            Err(e) => {
                warn!(release = %run.release, error = %e, "automatic rollback failed");
                KubeError::Rollback {
                    name: run.release.clone(),
                    message: e.to_string(),
                    cause: Box::new(cause),
                }
            }
        }
    }

    /// Bring the cluster back to the state before a failed operation
    ///
    /// Gets a fresh time budget, since the failure may have used up the
    /// operation's. No revision is written and no hooks run.
    async fn restore(&self, deployment: &Deployment<'_>) -> Result<()> {
        let empty = ManifestSet::new();
        let target = deployment.restore.unwrap_or(&empty);
        let budget = Budget::new("rollback", deployment.timeout, None);

        // Leftovers of earlier failures go too, not only what this run created
        let mut applied = deployment.previous.cloned().unwrap_or_default();
        applied.overlay(deployment.desired);
        let live = self.live_state(&[target, &applied], &budget).await?;
        let plan = self.planner.plan(target, Some(&applied), &live);
        info!(plan = %plan.summary(), "restoring previous state");

        let mut done = Vec::new();
        self.apply_plan(&plan, &budget, &mut done).await
    }

    /// Apply every changing entry in order, stopping at the first failure
    async fn apply_plan(&self, plan: &Plan, budget: &Budget, applied: &mut Vec<AppliedEntry>) -> Result<()> {
        let changes: Vec<&PlanEntry> = plan.entries.iter().filter(|e| e.is_change()).collect();

        for (index, entry) in changes.iter().enumerate() {
            let outcome = budget
                .run(format!("{} {}", entry.action, entry.id), None, async {
                    Ok(self.apply_entry(entry).await)
                })
                .await?;

            if let Err(e) = outcome {
                warn!(resource = %entry.id, action = %entry.action, error = %e, "plan entry failed");
                return Err(KubeError::Apply {
                    resource: entry.id.to_string(),
                    message: e.to_string(),
                    progress: ApplyProgress {
                        applied: applied.iter().map(|a| a.id.clone()).collect(),
                        remaining: changes[index + 1..].iter().map(|e| e.id.clone()).collect(),
                    },
                });
            }

            debug!(resource = %entry.id, action = %entry.action, reason = ?entry.reason, "applied");
            applied.push(AppliedEntry {
                id: entry.id.clone(),
                action: entry.action,
            });
        }
        Ok(())
    }

    async fn apply_entry(&self, entry: &PlanEntry) -> std::result::Result<(), ClusterError> {
        match entry.action {
            PlanAction::Create => self.apply_document(entry).await,
            // Only the planned patch is sent so fields owned by other
            // controllers stay untouched
            PlanAction::Update => match &entry.patch {
                Some(patch) => {
                    patch_with_retries(&self.cluster, &entry.id, patch, self.config.apply_retries).await?;
                    Ok(())
                }
                None => self.apply_document(entry).await,
            },
            PlanAction::Delete => {
                if !self.cluster.delete(&entry.id).await? {
                    debug!(resource = %entry.id, "already deleted");
                }
                Ok(())
            }
            PlanAction::Unchanged => Ok(()),
        }
    }

    async fn apply_document(&self, entry: &PlanEntry) -> std::result::Result<(), ClusterError> {
        let document = entry.after.as_ref().ok_or_else(|| ClusterError::Other {
            message: format!("no document to apply for {}", entry.id),
        })?;
        apply_with_retries(&self.cluster, &for_apply(document), self.config.apply_retries).await?;
        Ok(())
    }

    /// Resources this release may have in the cluster
    ///
    /// The last settled revision's manifest, overlaid with every failed or
    /// pending revision after it, since those may have applied part of
    /// their plan before stopping.
    fn applied_set(&self, namespace: &str, history: &[Revision]) -> Result<ManifestSet> {
        let builder = self.config.manifest_builder(namespace);
        let settled = history.iter().rposition(|r| !left_partial(r));

        let mut set = match settled.map(|i| &history[i]) {
            Some(r) if r.status != RevisionStatus::Uninstalled => builder.parse_manifest(&r.manifest)?,
            _ => ManifestSet::new(),
        };
        for revision in &history[settled.map_or(0, |i| i + 1)..] {
            set.overlay(&builder.parse_manifest(&revision.manifest)?);
        }
        Ok(set)
    }

    /// Read the live state of every main resource in `sets`
    async fn live_state(&self, sets: &[&ManifestSet], budget: &Budget) -> Result<LiveState> {
        let ids: BTreeSet<&ResourceId> = sets.iter().flat_map(|s| s.main()).map(|m| &m.id).collect();

        let mut live = LiveState::new();
        for id in ids {
            let found = budget
                .run(format!("reading {}", id), None, async { Ok(self.cluster.get(id).await?) })
                .await?;
            if let Some(document) = found {
                live.insert(id.clone(), document);
            }
        }
        Ok(live)
    }

    /// Release the lock whatever the operation's result
    async fn finish<T>(&self, lock: OperationLock, result: Result<T>) -> Result<T> {
        let unlocked = self.store.unlock(lock).await;
        match (result, unlocked) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unlock)) => {
                warn!(error = %unlock, "failed to release lock after error");
                Err(e)
            }
        }
    }
}

/// Copy of `document` without server-owned fields
fn for_apply(document: &JsonValue) -> JsonValue {
    let mut document = document.clone();
    if let Some(object) = document.as_object_mut() {
        object.remove("status");
        if let Some(metadata) = object.get_mut("metadata").and_then(JsonValue::as_object_mut) {
            for field in SERVER_METADATA {
                metadata.remove(*field);
            }
        }
    }
    document
}

fn next_number(history: &[Revision]) -> u32 {
    history.last().map_or(1, |r| r.revision + 1)
}

fn release_info(history: &[Revision], name: &str, namespace: &str, operation: Operation) -> ReleaseInfo {
    ReleaseInfo::for_operation(name, namespace, next_number(history), operation)
}

fn left_partial(revision: &Revision) -> bool {
    revision.status.is_pending() || matches!(revision.status, RevisionStatus::Failed { .. })
}

fn ensure_installable(history: &[Revision], name: &str, namespace: &str) -> Result<()> {
    if history.iter().any(Revision::is_deployed) {
        return Err(KubeError::ReleaseAlreadyExists {
            name: name.to_string(),
            namespace: namespace.to_string(),
        });
    }
    Ok(())
}

/// The deployed revision, or the latest when none is deployed
fn current_revision<'a>(history: &'a [Revision], name: &str, namespace: &str) -> Result<&'a Revision> {
    let not_found = || KubeError::ReleaseNotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
    };
    let current = history
        .iter()
        .rev()
        .find(|r| r.is_deployed())
        .or(history.last())
        .ok_or_else(not_found)?;
    if current.status == RevisionStatus::Uninstalled {
        return Err(not_found());
    }
    Ok(current)
}

fn uninstall_target<'a>(history: &'a [Revision], name: &str, namespace: &str) -> Result<&'a Revision> {
    current_revision(history, name, namespace)
}

/// Revision `opts.revision`, or the one before the latest when 0
fn rollback_target<'a>(history: &'a [Revision], opts: &RollbackOptions) -> Result<&'a Revision> {
    let latest = history.last().ok_or_else(|| KubeError::ReleaseNotFound {
        name: opts.name.clone(),
        namespace: opts.namespace.clone(),
    })?;
    let wanted = match opts.revision {
        0 => latest.revision.saturating_sub(1),
        n => n,
    };
    history
        .iter()
        .find(|r| r.revision == wanted)
        .ok_or_else(|| KubeError::RevisionNotFound {
            name: opts.name.clone(),
            namespace: opts.namespace.clone(),
            revision: wanted,
        })
}

/// Overrides for an upgrade: fresh by default, layered over the previous
/// revision's configuration with `reuse_values`
fn upgrade_overrides(current: &Revision, overrides: &UserOverrides, opts: &UpgradeOptions) -> Result<UserOverrides> {
    if opts.reuse_values && !opts.reset_values {
        Ok(UserOverrides::new()
            .layer(current.user_config.clone())
            .layer(overrides.flatten()?))
    } else {
        Ok(overrides.clone())
    }
}
