//! Lifecycle hooks
//!
//! Hooks of a phase run one at a time in (weight, identity) order, each to a
//! terminal signal, because later hooks may rely on earlier ones.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rudder_core::Operation;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::actions::Budget;
use crate::annotations::{get_annotation, helm, parse_duration, rudder, split_list};
use crate::cluster::{Cluster, TerminalSignal, apply_with_retries};
use crate::error::{KubeError, Result};
use crate::manifest::{Manifest, ManifestSet, ResourceId};

/// Hook execution phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookPhase {
    PreInstall,
    PostInstall,
    PreUpgrade,
    PostUpgrade,
    PreRollback,
    PostRollback,
    PreDelete,
    PostDelete,
    /// Run on demand, never during an operation
    Test,
}

impl HookPhase {
    /// The (pre, post) phases of an operation
    pub fn for_operation(operation: Operation) -> (HookPhase, HookPhase) {
        match operation {
            Operation::Install => (HookPhase::PreInstall, HookPhase::PostInstall),
            Operation::Upgrade => (HookPhase::PreUpgrade, HookPhase::PostUpgrade),
            Operation::Rollback => (HookPhase::PreRollback, HookPhase::PostRollback),
            Operation::Uninstall => (HookPhase::PreDelete, HookPhase::PostDelete),
        }
    }

    /// Is this a "pre" phase (before the operation)?
    pub fn is_pre(&self) -> bool {
        matches!(
            self,
            HookPhase::PreInstall
                | HookPhase::PreUpgrade
                | HookPhase::PreRollback
                | HookPhase::PreDelete
        )
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HookPhase::PreInstall => "pre-install",
            HookPhase::PostInstall => "post-install",
            HookPhase::PreUpgrade => "pre-upgrade",
            HookPhase::PostUpgrade => "post-upgrade",
            HookPhase::PreRollback => "pre-rollback",
            HookPhase::PostRollback => "post-rollback",
            HookPhase::PreDelete => "pre-delete",
            HookPhase::PostDelete => "post-delete",
            HookPhase::Test => "test",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for HookPhase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "pre-install" => Ok(HookPhase::PreInstall),
            "post-install" => Ok(HookPhase::PostInstall),
            "pre-upgrade" => Ok(HookPhase::PreUpgrade),
            "post-upgrade" => Ok(HookPhase::PostUpgrade),
            "pre-rollback" => Ok(HookPhase::PreRollback),
            "post-rollback" => Ok(HookPhase::PostRollback),
            "pre-delete" => Ok(HookPhase::PreDelete),
            "post-delete" => Ok(HookPhase::PostDelete),
            "test" | "test-success" => Ok(HookPhase::Test),
            other => Err(format!("unknown hook phase '{}'", other)),
        }
    }
}

/// When a hook resource is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletePolicy {
    /// Delete any previous instance before creating the hook
    BeforeHookCreation,
    /// Delete once the operation finalizes successfully
    HookSucceeded,
    /// Delete as soon as the hook fails
    HookFailed,
}

impl FromStr for DeletePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "before-hook-creation" => Ok(DeletePolicy::BeforeHookCreation),
            "hook-succeeded" => Ok(DeletePolicy::HookSucceeded),
            "hook-failed" => Ok(DeletePolicy::HookFailed),
            other => Err(format!("unknown hook delete policy '{}'", other)),
        }
    }
}

/// Hook declaration read from annotations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    pub phases: Vec<HookPhase>,
    /// Lower runs first
    pub weight: i32,
    /// Defaults to `before-hook-creation` when none is declared
    pub delete_policies: BTreeSet<DeletePolicy>,
    /// Falls back to the operation timeout
    pub timeout: Option<Duration>,
}

impl HookSpec {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> std::result::Result<Self, String> {
        let phases = get_annotation(annotations, rudder::HOOK, helm::HOOK)
            .map(split_list)
            .unwrap_or_default()
            .into_iter()
            .map(HookPhase::from_str)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if phases.is_empty() {
            return Err("hook annotation lists no phase".to_string());
        }

        let weight = match get_annotation(annotations, rudder::HOOK_WEIGHT, helm::HOOK_WEIGHT) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| format!("hook weight '{}' is not an integer", raw))?,
            None => 0,
        };

        let mut delete_policies = get_annotation(
            annotations,
            rudder::HOOK_DELETE_POLICY,
            helm::HOOK_DELETE_POLICY,
        )
        .map(split_list)
        .unwrap_or_default()
        .into_iter()
        .map(DeletePolicy::from_str)
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;
        if delete_policies.is_empty() {
            delete_policies.insert(DeletePolicy::BeforeHookCreation);
        }

        let timeout = match annotations.get(rudder::HOOK_TIMEOUT) {
            Some(raw) => Some(
                parse_duration(raw).ok_or_else(|| format!("hook timeout '{}' is not a duration", raw))?,
            ),
            None => None,
        };

        Ok(Self {
            phases,
            weight,
            delete_policies,
            timeout,
        })
    }
}

/// How a hook ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "outcome", content = "message")]
pub enum HookOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
}

/// Result of executing a hook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResult {
    pub id: ResourceId,

    /// Phase it ran in
    pub phase: HookPhase,

    pub outcome: HookOutcome,

    /// When execution started
    pub started_at: DateTime<Utc>,

    /// When execution completed
    pub completed_at: DateTime<Utc>,
}

impl HookResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == HookOutcome::Succeeded
    }

    /// Duration of execution
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at.signed_duration_since(self.started_at)
    }
}

/// Runs hook resources against a [`Cluster`]
pub struct HookExecutor<'a, C: Cluster + ?Sized> {
    cluster: &'a C,
    apply_retries: u32,
    /// Results of executed hooks
    results: Vec<HookResult>,
    /// Delete policies of every hook that ran, for cleanup
    policies: BTreeMap<ResourceId, BTreeSet<DeletePolicy>>,
}

impl<'a, C: Cluster + ?Sized> HookExecutor<'a, C> {
    pub fn new(cluster: &'a C, apply_retries: u32) -> Self {
        Self {
            cluster,
            apply_retries,
            results: Vec::new(),
            policies: BTreeMap::new(),
        }
    }

    pub fn results(&self) -> &[HookResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<HookResult> {
        self.results
    }

    /// Check if any hooks failed
    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| !r.succeeded())
    }

    /// Execute all hooks of `phase`, stopping at the first failure
    pub(crate) async fn execute_phase(
        &mut self,
        set: &ManifestSet,
        phase: HookPhase,
        budget: &Budget,
    ) -> Result<()> {
        for (manifest, spec) in set.hooks_for(phase) {
            self.execute_hook(manifest, spec, phase, budget).await?;
        }
        Ok(())
    }

    async fn execute_hook(
        &mut self,
        manifest: &Manifest,
        spec: &HookSpec,
        phase: HookPhase,
        budget: &Budget,
    ) -> Result<()> {
        let id = &manifest.id;
        let started_at = Utc::now();
        info!(hook = %id, %phase, weight = spec.weight, "running hook");
        self.policies.insert(id.clone(), spec.delete_policies.clone());

        let outcome = self.run_to_completion(manifest, spec, phase, budget).await;
        let result = HookResult {
            id: id.clone(),
            phase,
            outcome: match &outcome {
                Ok(()) => HookOutcome::Succeeded,
                Err(KubeError::Timeout { .. }) => HookOutcome::TimedOut,
                Err(e) => HookOutcome::Failed(e.to_string()),
            },
            started_at,
            completed_at: Utc::now(),
        };
        info!(hook = %id, %phase, outcome = ?result.outcome, "hook finished");
        self.results.push(result);

        if outcome.is_err() && spec.delete_policies.contains(&DeletePolicy::HookFailed) {
            self.delete(id, budget).await;
        }
        outcome
    }

    async fn run_to_completion(
        &self,
        manifest: &Manifest,
        spec: &HookSpec,
        phase: HookPhase,
        budget: &Budget,
    ) -> Result<()> {
        let id = &manifest.id;
        let failed = |message: String| KubeError::HookFailed {
            hook: id.to_string(),
            phase: phase.to_string(),
            message,
        };

        if spec.delete_policies.contains(&DeletePolicy::BeforeHookCreation) {
            budget
                .run(format!("deleting hook {}", id), None, async {
                    Ok(self.cluster.delete(id).await?)
                })
                .await?;
        }

        budget
            .run(format!("applying hook {}", id), None, async {
                apply_with_retries(self.cluster, &manifest.document, self.apply_retries)
                    .await
                    .map_err(|e| failed(e.to_string()))
            })
            .await?;

        let signal = budget
            .run(format!("hook {}", id), spec.timeout, async {
                Ok(self.cluster.watch_status(id).await?)
            })
            .await?;

        match signal {
            TerminalSignal::Succeeded => Ok(()),
            TerminalSignal::Failed(message) => Err(failed(message)),
        }
    }

    /// Delete hooks that succeeded and asked for `hook-succeeded` cleanup
    ///
    /// Returns a warning per hook that could not be deleted.
    pub(crate) async fn cleanup_succeeded(&self, budget: &Budget) -> Vec<String> {
        let mut warnings = Vec::new();
        for result in self.results.iter().filter(|r| r.succeeded()) {
            let wants_cleanup = self
                .policies
                .get(&result.id)
                .is_some_and(|p| p.contains(&DeletePolicy::HookSucceeded));
            if wants_cleanup && let Some(warning) = self.delete(&result.id, budget).await {
                warnings.push(warning);
            }
        }
        warnings
    }

    async fn delete(&self, id: &ResourceId, budget: &Budget) -> Option<String> {
        let deleted = budget
            .run(format!("deleting hook {}", id), None, async {
                Ok(self.cluster.delete(id).await?)
            })
            .await;
        match deleted {
            Ok(_) => None,
            Err(e) => {
                warn!(hook = %id, error = %e, "failed to clean up hook");
                Some(format!("hook {} was not cleaned up: {}", id, e))
            }
        }
    }
}
