//! Cluster state accessor
//!
//! Every mutation the orchestrator makes goes through [`Cluster`]. Two
//! implementations ship: [`KubeCluster`] talks to a real API server through
//! `kube`, [`InMemoryCluster`] is a deterministic stand-in with scriptable
//! hook outcomes and apply failures.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PropagationPolicy},
    core::GroupVersionKind,
    discovery::{Discovery, Scope},
    runtime::wait::await_condition,
};
use rudder_engine::Lookup;
use serde_json::Value as JsonValue;
use tokio::sync::{Barrier, Notify};
use tracing::debug;

use crate::error::{ClusterError, KubeError, Result};
use crate::manifest::{ResourceId, group_of};
use crate::plan::apply_merge_patch;

/// Field manager name for Server-Side Apply
const FIELD_MANAGER: &str = "rudder";

/// Delay before the first apply retry; doubled on each further attempt
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Final state of a watched resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalSignal {
    Succeeded,
    Failed(String),
}

/// Access to live cluster state
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Live document, `None` when the resource does not exist
    async fn get(&self, id: &ResourceId) -> std::result::Result<Option<JsonValue>, ClusterError>;

    /// Create or update a resource, returning the stored document
    async fn apply(&self, document: &JsonValue) -> std::result::Result<JsonValue, ClusterError>;

    /// Merge-patch an existing resource, touching only the fields in `patch`
    async fn patch(&self, id: &ResourceId, patch: &JsonValue) -> std::result::Result<JsonValue, ClusterError>;

    /// Delete a resource; `false` when it did not exist
    async fn delete(&self, id: &ResourceId) -> std::result::Result<bool, ClusterError>;

    /// Wait until the resource reaches a terminal state
    ///
    /// Jobs and Pods complete or fail; any other kind is done once it exists.
    async fn watch_status(&self, id: &ResourceId) -> std::result::Result<TerminalSignal, ClusterError>;
}

/// Run a cluster call with a bounded number of retries for conflicts and
/// transient errors
pub(crate) async fn with_retries<T, F, Fut>(
    what: &str,
    retries: u32,
    mut call: F,
) -> std::result::Result<T, ClusterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ClusterError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Err(e) if e.is_retryable() && attempt < retries => {
                let delay = RETRY_BACKOFF * 2u32.saturating_pow(attempt);
                debug!(error = %e, attempt, ?delay, what, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Apply with a bounded number of retries for conflicts and transient errors
pub(crate) async fn apply_with_retries<C: Cluster + ?Sized>(
    cluster: &C,
    document: &JsonValue,
    retries: u32,
) -> std::result::Result<JsonValue, ClusterError> {
    with_retries("apply", retries, || cluster.apply(document)).await
}

/// Merge-patch with the same retry rules as [`apply_with_retries`]
pub(crate) async fn patch_with_retries<C: Cluster + ?Sized>(
    cluster: &C,
    id: &ResourceId,
    patch: &JsonValue,
    retries: u32,
) -> std::result::Result<JsonValue, ClusterError> {
    with_retries("patch", retries, || cluster.patch(id, patch)).await
}

/// Scripted outcome of a hook in [`InMemoryCluster`]
#[derive(Debug, Clone, Default)]
pub enum HookBehavior {
    #[default]
    Succeed,
    Fail(String),
    /// Never reaches a terminal state
    Hang,
    /// Succeeds once the notify is signalled
    WaitFor(Arc<Notify>),
    /// Succeeds once every party reached the barrier
    Barrier(Arc<Barrier>),
}

/// One call recorded by [`InMemoryCluster`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRecord {
    Get(ResourceId),
    Apply(ResourceId),
    Patch(ResourceId),
    Delete(ResourceId),
    Watch(ResourceId),
}

impl OperationRecord {
    /// Does the call change cluster state?
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Apply(_) | Self::Patch(_) | Self::Delete(_))
    }
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ResourceId, JsonValue>,
    hooks: BTreeMap<String, HookBehavior>,
    apply_failures: BTreeMap<ResourceId, VecDeque<ClusterError>>,
    operations: Vec<OperationRecord>,
}

/// Deterministic in-process cluster
///
/// Clones share state, so a test can keep a handle while the orchestrator
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<State>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set how the hook named `name` behaves when watched
    pub fn script_hook(&self, name: impl Into<String>, behavior: HookBehavior) {
        self.state().hooks.insert(name.into(), behavior);
    }

    /// Fail the next `times` applies or patches of `id` with `error`
    pub fn fail_apply(&self, id: ResourceId, error: ClusterError, times: usize) {
        self.state()
            .apply_failures
            .entry(id)
            .or_default()
            .extend(std::iter::repeat_n(error, times));
    }

    /// Change live state behind the orchestrator's back
    pub fn insert(&self, document: JsonValue) -> Option<ResourceId> {
        let id = ResourceId::of(&document)?;
        self.state().objects.insert(id.clone(), document);
        Some(id)
    }

    pub fn remove(&self, id: &ResourceId) -> Option<JsonValue> {
        self.state().objects.remove(id)
    }

    pub fn object(&self, id: &ResourceId) -> Option<JsonValue> {
        self.state().objects.get(id).cloned()
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.state().objects.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        self.state().objects.keys().cloned().collect()
    }

    /// Every call made so far, in order
    pub fn operations(&self) -> Vec<OperationRecord> {
        self.state().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.state().operations.clear();
    }
}

#[async_trait]
impl Cluster for InMemoryCluster {
    async fn get(&self, id: &ResourceId) -> std::result::Result<Option<JsonValue>, ClusterError> {
        let mut state = self.state();
        state.operations.push(OperationRecord::Get(id.clone()));
        Ok(state.objects.get(id).cloned())
    }

    async fn apply(&self, document: &JsonValue) -> std::result::Result<JsonValue, ClusterError> {
        let id = ResourceId::of(document).ok_or_else(|| ClusterError::Rejected {
            resource: "document".to_string(),
            message: "missing apiVersion, kind or metadata.name".to_string(),
        })?;

        let mut state = self.state();
        state.operations.push(OperationRecord::Apply(id.clone()));
        if let Some(error) = state.apply_failures.get_mut(&id).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        state.objects.insert(id, document.clone());
        Ok(document.clone())
    }

    async fn patch(&self, id: &ResourceId, patch: &JsonValue) -> std::result::Result<JsonValue, ClusterError> {
        let mut state = self.state();
        state.operations.push(OperationRecord::Patch(id.clone()));
        if let Some(error) = state.apply_failures.get_mut(id).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        let object = state.objects.get_mut(id).ok_or_else(|| ClusterError::NotFound {
            resource: id.to_string(),
        })?;
        apply_merge_patch(object, patch);
        Ok(object.clone())
    }

    async fn delete(&self, id: &ResourceId) -> std::result::Result<bool, ClusterError> {
        let mut state = self.state();
        state.operations.push(OperationRecord::Delete(id.clone()));
        Ok(state.objects.remove(id).is_some())
    }

    async fn watch_status(&self, id: &ResourceId) -> std::result::Result<TerminalSignal, ClusterError> {
        let behavior = {
            let mut state = self.state();
            state.operations.push(OperationRecord::Watch(id.clone()));
            if !state.objects.contains_key(id) {
                return Err(ClusterError::NotFound {
                    resource: id.to_string(),
                });
            }
            state.hooks.get(&id.name).cloned().unwrap_or_default()
        };

        match behavior {
            HookBehavior::Succeed => Ok(TerminalSignal::Succeeded),
            HookBehavior::Fail(message) => Ok(TerminalSignal::Failed(message)),
            HookBehavior::Hang => std::future::pending().await,
            HookBehavior::WaitFor(notify) => {
                notify.notified().await;
                Ok(TerminalSignal::Succeeded)
            }
            HookBehavior::Barrier(barrier) => {
                barrier.wait().await;
                Ok(TerminalSignal::Succeeded)
            }
        }
    }
}

impl Lookup for InMemoryCluster {
    fn get(&self, api_version: &str, kind: &str, namespace: &str, name: &str) -> Option<JsonValue> {
        let namespace = (!namespace.is_empty()).then_some(namespace);
        let id = ResourceId::new(group_of(api_version), kind, namespace, name);
        self.object(&id)
            .filter(|doc| doc.get("apiVersion").and_then(JsonValue::as_str) == Some(api_version))
    }

    fn list(&self, api_version: &str, kind: &str, namespace: &str) -> Vec<JsonValue> {
        self.state()
            .objects
            .iter()
            .filter(|(id, doc)| {
                id.kind == kind
                    && doc.get("apiVersion").and_then(JsonValue::as_str) == Some(api_version)
                    && (namespace.is_empty() || id.namespace.as_deref() == Some(namespace))
            })
            .map(|(_, doc)| doc.clone())
            .collect()
    }
}

/// [`Cluster`] backed by a Kubernetes API server
pub struct KubeCluster {
    client: Client,
    /// Cached discovery information
    discovery: Discovery,
}

impl KubeCluster {
    /// Connect with an existing client, running API discovery once
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(KubeError::Api)?;

        Ok(Self { client, discovery })
    }

    /// Connect using the ambient kubeconfig or in-cluster configuration
    pub async fn try_default() -> Result<Self> {
        Self::new(Client::try_default().await?).await
    }

    /// Refresh discovery cache (call after CRD changes)
    pub async fn refresh_discovery(&mut self) -> Result<()> {
        self.discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(KubeError::Api)?;
        Ok(())
    }

    fn api_for(&self, id: &ResourceId) -> Option<Api<DynamicObject>> {
        let (resource, capabilities) = self
            .discovery
            .get(&id.group)?
            .recommended_kind(&id.kind)?;
        Some(match (&capabilities.scope, &id.namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        })
    }

    fn api_for_document(&self, id: &ResourceId, document: &JsonValue) -> std::result::Result<Api<DynamicObject>, ClusterError> {
        let api_version = document
            .get("apiVersion")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        let gvk = gvk_from_api_version(api_version, &id.kind);
        let (resource, capabilities) =
            self.discovery
                .resolve_gvk(&gvk)
                .ok_or_else(|| ClusterError::Rejected {
                    resource: id.to_string(),
                    message: format!("unknown resource type {}/{}", api_version, id.kind),
                })?;
        Ok(match (&capabilities.scope, &id.namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        })
    }

    async fn watch_job(&self, id: &ResourceId) -> std::result::Result<TerminalSignal, ClusterError> {
        let namespace = id.namespace.as_deref().unwrap_or("default");
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let condition = |status: &Job, kind: &str| {
            status
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .and_then(|c| c.iter().find(|c| c.type_ == kind && c.status == "True"))
                .map(|c| c.message.clone().unwrap_or_else(|| kind.to_string()))
        };

        let job = await_condition(jobs, &id.name, |job: Option<&Job>| {
            job.is_some_and(|j| condition(j, "Complete").is_some() || condition(j, "Failed").is_some())
        })
        .await
        .map_err(|e| ClusterError::Other {
            message: e.to_string(),
        })?;

        Ok(match job {
            None => TerminalSignal::Failed("job was deleted before completion".to_string()),
            Some(job) => match condition(&job, "Failed") {
                Some(message) => TerminalSignal::Failed(message),
                None => TerminalSignal::Succeeded,
            },
        })
    }

    async fn watch_pod(&self, id: &ResourceId) -> std::result::Result<TerminalSignal, ClusterError> {
        let namespace = id.namespace.as_deref().unwrap_or("default");
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let phase = |pod: &Pod| pod.status.as_ref().and_then(|s| s.phase.clone());

        let pod = await_condition(pods, &id.name, |pod: Option<&Pod>| {
            pod.and_then(phase)
                .is_some_and(|p| p == "Succeeded" || p == "Failed")
        })
        .await
        .map_err(|e| ClusterError::Other {
            message: e.to_string(),
        })?;

        Ok(match pod.as_ref().and_then(phase).as_deref() {
            Some("Succeeded") => TerminalSignal::Succeeded,
            Some(_) => TerminalSignal::Failed(format!("pod {} failed", id.name)),
            None => TerminalSignal::Failed("pod was deleted before completion".to_string()),
        })
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get(&self, id: &ResourceId) -> std::result::Result<Option<JsonValue>, ClusterError> {
        // A kind the server does not know yet cannot have instances
        let Some(api) = self.api_for(id) else {
            return Ok(None);
        };
        let object = api
            .get_opt(&id.name)
            .await
            .map_err(|e| classify(&id.to_string(), e))?;
        object
            .map(|o| serde_json::to_value(o).map_err(|e| ClusterError::Other { message: e.to_string() }))
            .transpose()
    }

    async fn apply(&self, document: &JsonValue) -> std::result::Result<JsonValue, ClusterError> {
        let id = ResourceId::of(document).ok_or_else(|| ClusterError::Rejected {
            resource: "document".to_string(),
            message: "missing apiVersion, kind or metadata.name".to_string(),
        })?;
        let api = self.api_for_document(&id, document)?;
        let object: DynamicObject =
            serde_json::from_value(document.clone()).map_err(|e| ClusterError::Rejected {
                resource: id.to_string(),
                message: e.to_string(),
            })?;

        let mut params = PatchParams::apply(FIELD_MANAGER);
        params.force = true;

        let applied = api
            .patch(&id.name, &params, &Patch::Apply(&object))
            .await
            .map_err(|e| classify(&id.to_string(), e))?;
        serde_json::to_value(applied).map_err(|e| ClusterError::Other {
            message: e.to_string(),
        })
    }

    async fn patch(&self, id: &ResourceId, patch: &JsonValue) -> std::result::Result<JsonValue, ClusterError> {
        let api = self.api_for(id).ok_or_else(|| ClusterError::NotFound {
            resource: id.to_string(),
        })?;
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        let patched = api
            .patch(&id.name, &params, &Patch::Merge(patch))
            .await
            .map_err(|e| classify(&id.to_string(), e))?;
        serde_json::to_value(patched).map_err(|e| ClusterError::Other {
            message: e.to_string(),
        })
    }

    async fn delete(&self, id: &ResourceId) -> std::result::Result<bool, ClusterError> {
        let Some(api) = self.api_for(id) else {
            return Ok(false);
        };
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match api.delete(&id.name, &params).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(classify(&id.to_string(), e)),
        }
    }

    async fn watch_status(&self, id: &ResourceId) -> std::result::Result<TerminalSignal, ClusterError> {
        match (id.group.as_str(), id.kind.as_str()) {
            ("batch", "Job") => self.watch_job(id).await,
            ("", "Pod") => self.watch_pod(id).await,
            _ => match self.get(id).await? {
                Some(_) => Ok(TerminalSignal::Succeeded),
                None => Err(ClusterError::NotFound {
                    resource: id.to_string(),
                }),
            },
        }
    }
}

/// Map API failures onto the retry classes the orchestrator understands
fn classify(resource: &str, error: kube::Error) -> ClusterError {
    match error {
        kube::Error::Api(resp) => match resp.code {
            404 => ClusterError::NotFound {
                resource: resource.to_string(),
            },
            409 => ClusterError::Conflict {
                resource: resource.to_string(),
                message: resp.message,
            },
            429 | 500..=599 => ClusterError::Transient {
                message: format!("{}: {}", resource, resp.message),
            },
            400..=499 => ClusterError::Rejected {
                resource: resource.to_string(),
                message: resp.message,
            },
            _ => ClusterError::Other {
                message: format!("{}: {}", resource, resp.message),
            },
        },
        other => ClusterError::Transient {
            message: format!("{}: {}", resource, other),
        },
    }
}

/// Split an apiVersion into group and version
///
/// - "apps/v1" -> group="apps", version="v1"
/// - "v1" -> group="", version="v1" (core API)
fn gvk_from_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = match api_version.rsplit_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };

    GroupVersionKind {
        group,
        version,
        kind: kind.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_map(name: &str) -> JsonValue {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "default"},
            "data": {"a": "1"}
        })
    }

    #[tokio::test]
    async fn test_in_memory_apply_get_delete() {
        let cluster = InMemoryCluster::new();
        let id = ResourceId::new("", "ConfigMap", Some("default"), "cfg");

        assert_eq!(Cluster::get(&cluster, &id).await.unwrap(), None);
        cluster.apply(&config_map("cfg")).await.unwrap();
        assert_eq!(
            Cluster::get(&cluster, &id).await.unwrap(),
            Some(config_map("cfg"))
        );

        assert!(cluster.delete(&id).await.unwrap());
        assert!(!cluster.delete(&id).await.unwrap());

        let mutations = cluster
            .operations()
            .into_iter()
            .filter(OperationRecord::is_mutation)
            .count();
        assert_eq!(mutations, 3);
    }

    #[tokio::test]
    async fn test_patch_touches_only_listed_fields() {
        let cluster = InMemoryCluster::new();
        let id = ResourceId::new("", "ConfigMap", Some("default"), "cfg");
        let mut live = config_map("cfg");
        live["data"]["owner"] = json!("autoscaler");
        cluster.insert(live);

        let patched = patch_with_retries(&cluster, &id, &json!({"data": {"a": "2"}}), 0)
            .await
            .unwrap();
        assert_eq!(patched["data"], json!({"a": "2", "owner": "autoscaler"}));
        assert_eq!(cluster.object(&id).unwrap(), patched);
        assert!(cluster.operations().contains(&OperationRecord::Patch(id.clone())));

        let missing = ResourceId::new("", "ConfigMap", Some("default"), "gone");
        assert!(matches!(
            cluster.patch(&missing, &json!({})).await,
            Err(ClusterError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_scripted_failures_are_retried() {
        let cluster = InMemoryCluster::new();
        let id = ResourceId::new("", "ConfigMap", Some("default"), "cfg");
        cluster.fail_apply(
            id.clone(),
            ClusterError::Transient {
                message: "etcd leader changed".into(),
            },
            2,
        );

        assert!(apply_with_retries(&cluster, &config_map("cfg"), 1).await.is_err());
        // One scripted failure left, and one retry covers it
        apply_with_retries(&cluster, &config_map("cfg"), 1).await.unwrap();
        assert!(cluster.contains(&id));
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let cluster = InMemoryCluster::new();
        let id = ResourceId::new("", "ConfigMap", Some("default"), "cfg");
        let rejected = ClusterError::Rejected {
            resource: id.to_string(),
            message: "invalid".into(),
        };
        cluster.fail_apply(id.clone(), rejected.clone(), 1);

        assert_eq!(
            apply_with_retries(&cluster, &config_map("cfg"), 5).await,
            Err(rejected)
        );
        assert_eq!(cluster.operations().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_scripted_hooks() {
        let cluster = InMemoryCluster::new();
        let id = cluster.insert(config_map("job")).unwrap();

        assert_eq!(cluster.watch_status(&id).await.unwrap(), TerminalSignal::Succeeded);

        cluster.script_hook("job", HookBehavior::Fail("boom".into()));
        assert_eq!(
            cluster.watch_status(&id).await.unwrap(),
            TerminalSignal::Failed("boom".into())
        );

        let notify = Arc::new(Notify::new());
        cluster.script_hook("job", HookBehavior::WaitFor(notify.clone()));
        notify.notify_one();
        assert_eq!(cluster.watch_status(&id).await.unwrap(), TerminalSignal::Succeeded);

        let missing = ResourceId::new("batch", "Job", Some("default"), "missing");
        assert!(matches!(
            cluster.watch_status(&missing).await,
            Err(ClusterError::NotFound { .. })
        ));
    }

    #[test]
    fn test_lookup_reads_live_objects() {
        let cluster = InMemoryCluster::new();
        cluster.insert(config_map("cfg"));

        let found = Lookup::get(&cluster, "v1", "ConfigMap", "default", "cfg").unwrap();
        assert_eq!(found["data"]["a"], "1");
        assert!(Lookup::get(&cluster, "v2", "ConfigMap", "default", "cfg").is_none());
        assert_eq!(Lookup::list(&cluster, "v1", "ConfigMap", "").len(), 1);
    }

    #[test]
    fn test_gvk_from_api_version() {
        let gvk = gvk_from_api_version("apps/v1", "Deployment");
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");

        let gvk = gvk_from_api_version("v1", "ConfigMap");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
    }
}
