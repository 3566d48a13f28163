//! Three-way diff between the previous revision, the new desired state and
//! the live cluster
//!
//! For every resource the planner computes an RFC 7386 merge patch against
//! live state:
//! - fields the desired document sets win when they differ from live
//! - fields the previous revision set but the desired one dropped are
//!   cleared with `null`
//! - fields neither revision ever set are left alone, so values written by
//!   other controllers survive
//!
//! Planning is pure; the orchestrator gathers live state beforehand.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use similar::{ChangeTag, TextDiff};

use crate::manifest::{Manifest, ManifestSet, ResourceId};

/// Live documents by identity; missing entries do not exist in the cluster
pub type LiveState = BTreeMap<ResourceId, JsonValue>;

/// Install order of resource kinds
///
/// Lower categories are created first and deleted last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceCategory {
    /// Namespace - created before namespace-scoped resources
    Namespace = 0,
    /// CustomResourceDefinition
    Crd = 1,
    /// ResourceQuota, LimitRange
    NamespaceConfig = 2,
    /// ClusterRole, ClusterRoleBinding
    ClusterRbac = 10,
    /// Role, RoleBinding, ServiceAccount
    NamespacedRbac = 11,
    /// ConfigMap, Secret
    Config = 20,
    /// PersistentVolume, PersistentVolumeClaim, StorageClass
    Storage = 21,
    /// NetworkPolicy, Service, Endpoints, Ingress
    Network = 30,
    /// Deployment, StatefulSet, DaemonSet, ReplicaSet, Pod
    Workload = 40,
    /// Job, CronJob
    Batch = 50,
    /// HorizontalPodAutoscaler, VerticalPodAutoscaler, PodDisruptionBudget
    Autoscaling = 60,
    /// Custom Resources (using CRDs)
    CustomResource = 70,
    /// Everything else
    Other = 100,
}

/// Built-in API groups; anything else is served by a CRD
const BUILTIN_GROUPS: &[&str] = &[
    "",
    "apps",
    "batch",
    "autoscaling",
    "policy",
    "networking.k8s.io",
    "rbac.authorization.k8s.io",
    "storage.k8s.io",
    "admissionregistration.k8s.io",
    "apiextensions.k8s.io",
    "apiregistration.k8s.io",
    "certificates.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "events.k8s.io",
    "flowcontrol.apiserver.k8s.io",
    "node.k8s.io",
    "scheduling.k8s.io",
];

impl ResourceCategory {
    pub fn of(id: &ResourceId) -> Self {
        match id.kind.as_str() {
            "Namespace" => Self::Namespace,
            "CustomResourceDefinition" => Self::Crd,
            "ResourceQuota" | "LimitRange" => Self::NamespaceConfig,
            "ClusterRole" | "ClusterRoleBinding" => Self::ClusterRbac,
            "Role" | "RoleBinding" | "ServiceAccount" => Self::NamespacedRbac,
            "ConfigMap" | "Secret" => Self::Config,
            "PersistentVolume" | "PersistentVolumeClaim" | "StorageClass" => Self::Storage,
            "NetworkPolicy" | "Service" | "Endpoints" | "Ingress" | "IngressClass" => Self::Network,
            "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Pod" => Self::Workload,
            "Job" | "CronJob" => Self::Batch,
            "HorizontalPodAutoscaler" | "VerticalPodAutoscaler" | "PodDisruptionBudget" => {
                Self::Autoscaling
            }
            _ if !BUILTIN_GROUPS.contains(&id.group.as_str()) => Self::CustomResource,
            _ => Self::Other,
        }
    }
}

/// A field left to live state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreRule {
    /// Restrict the rule to one kind; every kind when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Dot-separated field path, e.g. `spec.replicas`
    pub path: String,
}

impl IgnoreRule {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            kind: None,
            path: path.into(),
        }
    }

    pub fn for_kind(kind: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            path: path.into(),
        }
    }

    fn matches(&self, kind: &str, path: &[String]) -> bool {
        self.kind.as_deref().is_none_or(|k| k == kind)
            && self.path.split('.').eq(path.iter().map(String::as_str))
    }
}

/// Tolerance for changes made outside of Rudder
///
/// Ignored fields keep their live value as long as one exists; the desired
/// value only seeds them on creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftPolicy {
    #[serde(default)]
    pub ignore: Vec<IgnoreRule>,
}

impl DriftPolicy {
    pub fn ignore(mut self, rule: IgnoreRule) -> Self {
        self.ignore.push(rule);
        self
    }

    fn is_ignored(&self, kind: &str, path: &[String]) -> bool {
        self.ignore.iter().any(|rule| rule.matches(kind, path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanAction {
    Create,
    Update,
    Delete,
    Unchanged,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanAction::Create => "create",
            PlanAction::Update => "update",
            PlanAction::Delete => "delete",
            PlanAction::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// Why an action was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanReason {
    /// Not in the previous revision
    New,
    /// In the previous revision but deleted from the cluster
    Recreate,
    Modified,
    InSync,
    /// No longer desired
    Removed,
    /// No longer desired, but marked `resource-policy: keep`
    Retained,
}

/// The action required for one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub id: ResourceId,
    pub action: PlanAction,
    pub reason: PlanReason,
    /// Live document, or the previous revision's when live is unknown
    pub before: Option<JsonValue>,
    /// Document the cluster should hold afterwards
    pub after: Option<JsonValue>,
    /// Merge patch against `before` for updates
    pub patch: Option<JsonValue>,
}

impl PlanEntry {
    /// Does applying this entry change the cluster?
    pub fn is_change(&self) -> bool {
        self.action != PlanAction::Unchanged
    }

    /// Line diff of `before` and `after` rendered as YAML
    pub fn unified_diff(&self) -> String {
        let render = |doc: &Option<JsonValue>| {
            doc.as_ref()
                .and_then(|d| serde_yaml::to_string(d).ok())
                .unwrap_or_default()
        };
        let old = render(&self.before);
        let new = render(&self.after);

        let mut output = format!("--- {}\n+++ {}\n", self.id, self.id);
        for change in TextDiff::from_lines(&old, &new).iter_all_changes() {
            let prefix = match change.tag() {
                ChangeTag::Delete => "-",
                ChangeTag::Insert => "+",
                ChangeTag::Equal => " ",
            };
            output.push_str(prefix);
            output.push_str(change.value().trim_end());
            output.push('\n');
        }
        output
    }
}

/// Ordered plan entries for one operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn entry(&self, id: &ResourceId) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn count(&self, action: PlanAction) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(PlanEntry::is_change)
    }

    /// e.g. "2 to create, 1 to update, 0 to delete, 3 unchanged"
    pub fn summary(&self) -> String {
        format!(
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.count(PlanAction::Create),
            self.count(PlanAction::Update),
            self.count(PlanAction::Delete),
            self.count(PlanAction::Unchanged),
        )
    }
}

/// Computes plans; holds only policy, no state
#[derive(Debug, Clone, Default)]
pub struct Planner {
    drift: DriftPolicy,
    delete_first_kinds: BTreeSet<String>,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_drift_policy(mut self, drift: DriftPolicy) -> Self {
        self.drift = drift;
        self
    }

    /// Delete stale resources of `kind` before anything is created, for kinds
    /// whose old instance would block the new one
    pub fn delete_first_kind(mut self, kind: impl Into<String>) -> Self {
        self.delete_first_kinds.insert(kind.into());
        self
    }

    /// Plan the main resources of `desired`; hooks are not planned
    pub fn plan(&self, desired: &ManifestSet, previous: Option<&ManifestSet>, live: &LiveState) -> Plan {
        let mut applies = Vec::new();
        let mut removals = Vec::new();

        for manifest in desired.main() {
            let before = previous.and_then(|p| p.main_manifest(&manifest.id));
            applies.push(self.plan_desired(manifest, before, live.get(&manifest.id)));
        }

        for stale in previous.into_iter().flat_map(ManifestSet::main) {
            if desired.main_manifest(&stale.id).is_some() {
                continue;
            }
            // Already gone from the cluster, nothing to do
            let Some(current) = live.get(&stale.id) else {
                continue;
            };
            let (action, reason) = if stale.is_kept() {
                (PlanAction::Unchanged, PlanReason::Retained)
            } else {
                (PlanAction::Delete, PlanReason::Removed)
            };
            removals.push(PlanEntry {
                id: stale.id.clone(),
                action,
                reason,
                before: Some(current.clone()),
                after: (action == PlanAction::Unchanged).then(|| current.clone()),
                patch: None,
            });
        }

        applies.sort_by(|a, b| (ResourceCategory::of(&a.id), &a.id).cmp(&(ResourceCategory::of(&b.id), &b.id)));
        removals.sort_by(|a, b| {
            (Reverse(ResourceCategory::of(&a.id)), &a.id).cmp(&(Reverse(ResourceCategory::of(&b.id)), &b.id))
        });
        let (hoisted, removals): (Vec<_>, Vec<_>) = removals
            .into_iter()
            .partition(|e| e.action == PlanAction::Delete && self.delete_first_kinds.contains(&e.id.kind));

        Plan {
            entries: hoisted.into_iter().chain(applies).chain(removals).collect(),
        }
    }

    fn plan_desired(&self, desired: &Manifest, previous: Option<&Manifest>, live: Option<&JsonValue>) -> PlanEntry {
        let id = desired.id.clone();
        let Some(live) = live else {
            return PlanEntry {
                id,
                action: PlanAction::Create,
                reason: if previous.is_some() {
                    PlanReason::Recreate
                } else {
                    PlanReason::New
                },
                before: None,
                after: Some(desired.document.clone()),
                patch: None,
            };
        };

        let patch = three_way_patch(
            previous.map(|p| &p.document),
            &desired.document,
            live,
            &|path| self.drift.is_ignored(&desired.id.kind, path),
        );

        if patch.is_empty() {
            return PlanEntry {
                id,
                action: PlanAction::Unchanged,
                reason: PlanReason::InSync,
                before: Some(live.clone()),
                after: Some(live.clone()),
                patch: None,
            };
        }

        let patch = JsonValue::Object(patch);
        let mut after = live.clone();
        apply_merge_patch(&mut after, &patch);
        PlanEntry {
            id,
            action: PlanAction::Update,
            reason: PlanReason::Modified,
            before: Some(live.clone()),
            after: Some(after),
            patch: Some(patch),
        }
    }
}

/// Merge patch taking `live` to the desired state
///
/// Empty when nothing needs to change.
pub fn three_way_patch(
    previous: Option<&JsonValue>,
    desired: &JsonValue,
    live: &JsonValue,
    ignored: &dyn Fn(&[String]) -> bool,
) -> Map<String, JsonValue> {
    let empty = Map::new();
    let desired = desired.as_object().unwrap_or(&empty);
    let live = live.as_object().unwrap_or(&empty);
    diff_object(
        previous.and_then(JsonValue::as_object),
        desired,
        live,
        &mut Vec::new(),
        ignored,
    )
}

fn diff_object(
    previous: Option<&Map<String, JsonValue>>,
    desired: &Map<String, JsonValue>,
    live: &Map<String, JsonValue>,
    path: &mut Vec<String>,
    ignored: &dyn Fn(&[String]) -> bool,
) -> Map<String, JsonValue> {
    let mut patch = Map::new();

    for (key, want) in desired {
        path.push(key.clone());
        let have = live.get(key);

        if !(have.is_some() && ignored(path)) {
            match (want, have) {
                (JsonValue::Object(want), Some(JsonValue::Object(have))) => {
                    let before = previous
                        .and_then(|p| p.get(key))
                        .and_then(JsonValue::as_object);
                    let nested = diff_object(before, want, have, path, ignored);
                    if !nested.is_empty() {
                        patch.insert(key.clone(), JsonValue::Object(nested));
                    }
                }
                (JsonValue::Null, None) => {}
                (want, Some(have)) if want == have => {}
                (want, _) => {
                    patch.insert(key.clone(), want.clone());
                }
            }
        }
        path.pop();
    }

    // Fields the previous revision owned and the new one dropped
    for key in previous.into_iter().flat_map(Map::keys) {
        if desired.contains_key(key) || !live.contains_key(key) {
            continue;
        }
        path.push(key.clone());
        if !ignored(path) {
            patch.insert(key.clone(), JsonValue::Null);
        }
        path.pop();
    }

    patch
}

/// Apply an RFC 7386 merge patch in place
pub fn apply_merge_patch(target: &mut JsonValue, patch: &JsonValue) {
    let JsonValue::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = JsonValue::Object(Map::new());
    }
    if let JsonValue::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                apply_merge_patch(map.entry(key.clone()).or_insert(JsonValue::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestSetBuilder;
    use serde_json::json;

    fn set(docs: &[JsonValue]) -> ManifestSet {
        let files = docs
            .iter()
            .enumerate()
            .map(|(i, d)| (format!("templates/{i}.yaml"), serde_yaml::to_string(d).unwrap()))
            .collect();
        ManifestSetBuilder::new("default").build(&files).unwrap()
    }

    fn live_of(set: &ManifestSet) -> LiveState {
        set.main()
            .map(|m| (m.id.clone(), m.document.clone()))
            .collect()
    }

    fn deployment(spec: JsonValue) -> JsonValue {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": spec
        })
    }

    fn config_map(name: &str) -> JsonValue {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "default"},
            "data": {"k": "v"}
        })
    }

    fn web_id() -> ResourceId {
        ResourceId::new("apps", "Deployment", Some("default"), "web")
    }

    #[test]
    fn test_plan_against_itself_is_unchanged() {
        let desired = set(&[deployment(json!({"replicas": 2})), config_map("cfg")]);
        let plan = Planner::new().plan(&desired, Some(&desired), &live_of(&desired));

        assert_eq!(plan.entries.len(), 2);
        assert!(plan.entries.iter().all(|e| e.action == PlanAction::Unchanged));
        assert!(!plan.has_changes());
    }

    #[test]
    fn test_create_and_recreate() {
        let desired = set(&[deployment(json!({"replicas": 2})), config_map("cfg")]);
        let previous = set(&[deployment(json!({"replicas": 2}))]);

        let plan = Planner::new().plan(&desired, Some(&previous), &LiveState::new());
        let reasons: Vec<_> = plan.entries.iter().map(|e| (e.id.kind.as_str(), e.reason)).collect();
        // ConfigMaps are created before Deployments
        assert_eq!(
            reasons,
            vec![("ConfigMap", PlanReason::New), ("Deployment", PlanReason::Recreate)]
        );
        assert!(plan.entries.iter().all(|e| e.action == PlanAction::Create));
    }

    #[test]
    fn test_field_dropped_by_new_revision_is_cleared() {
        let previous = set(&[deployment(json!({"replicas": 3, "paused": true}))]);
        let desired = set(&[deployment(json!({"replicas": 3}))]);

        let plan = Planner::new().plan(&desired, Some(&previous), &live_of(&previous));
        let entry = plan.entry(&web_id()).unwrap();

        assert_eq!(entry.action, PlanAction::Update);
        assert_eq!(entry.patch, Some(json!({"spec": {"paused": null}})));
        assert_eq!(entry.after.as_ref().unwrap()["spec"], json!({"replicas": 3}));
    }

    #[test]
    fn test_external_fields_are_preserved() {
        let previous = set(&[deployment(json!({"template": {"image": "web:1"}}))]);
        let desired = set(&[deployment(json!({"template": {"image": "web:2"}}))]);

        let mut live = live_of(&previous);
        live.insert(
            web_id(),
            deployment(json!({"replicas": 7, "template": {"image": "web:1"}})),
        );

        let plan = Planner::new().plan(&desired, Some(&previous), &live);
        let entry = plan.entry(&web_id()).unwrap();

        assert_eq!(entry.patch, Some(json!({"spec": {"template": {"image": "web:2"}}})));
        assert_eq!(
            entry.after.as_ref().unwrap()["spec"],
            json!({"replicas": 7, "template": {"image": "web:2"}})
        );
    }

    #[test]
    fn test_drift_policy_leaves_ignored_fields_to_live() {
        let previous = set(&[deployment(json!({"replicas": 2}))]);
        let desired = set(&[deployment(json!({"replicas": 2}))]);
        let mut live = live_of(&previous);
        live.insert(web_id(), deployment(json!({"replicas": 9})));

        let strict = Planner::new().plan(&desired, Some(&previous), &live);
        assert_eq!(strict.entry(&web_id()).unwrap().action, PlanAction::Update);

        let tolerant = Planner::new()
            .with_drift_policy(DriftPolicy::default().ignore(IgnoreRule::for_kind("Deployment", "spec.replicas")));
        let plan = tolerant.plan(&desired, Some(&previous), &live);
        assert_eq!(plan.entry(&web_id()).unwrap().action, PlanAction::Unchanged);

        // Still seeded when the resource is created
        let plan = tolerant.plan(&desired, None, &LiveState::new());
        assert_eq!(plan.entries[0].after.as_ref().unwrap()["spec"]["replicas"], 2);
    }

    #[test]
    fn test_deletes_follow_applies_in_reverse_category_order() {
        let previous = set(&[
            deployment(json!({"replicas": 1})),
            config_map("old"),
            json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "svc"}}),
        ]);
        let desired = set(&[config_map("new")]);

        let plan = Planner::new().plan(&desired, Some(&previous), &live_of(&previous));
        let order: Vec<String> = plan
            .entries
            .iter()
            .map(|e| format!("{} {}", e.action, e.id))
            .collect();
        assert_eq!(
            order,
            vec![
                "create core/ConfigMap/default/new",
                "delete apps/Deployment/default/web",
                "delete core/Service/default/svc",
                "delete core/ConfigMap/default/old",
            ]
        );
        assert_eq!(plan.summary(), "1 to create, 0 to update, 3 to delete, 0 unchanged");
    }

    #[test]
    fn test_delete_first_kinds_are_hoisted() {
        let previous = set(&[json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "old"}})]);
        let desired = set(&[json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "new"}})]);

        let plan = Planner::new()
            .delete_first_kind("Service")
            .plan(&desired, Some(&previous), &live_of(&previous));
        let actions: Vec<PlanAction> = plan.entries.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![PlanAction::Delete, PlanAction::Create]);
    }

    #[test]
    fn test_kept_resources_are_retained() {
        let mut kept = config_map("data");
        kept["metadata"]["annotations"] = json!({"helm.sh/resource-policy": "keep"});
        let previous = set(&[kept]);

        let plan = Planner::new().plan(&ManifestSet::new(), Some(&previous), &live_of(&previous));
        assert_eq!(plan.entries[0].action, PlanAction::Unchanged);
        assert_eq!(plan.entries[0].reason, PlanReason::Retained);
    }

    #[test]
    fn test_already_deleted_resources_are_skipped() {
        let previous = set(&[config_map("gone")]);
        let plan = Planner::new().plan(&ManifestSet::new(), Some(&previous), &LiveState::new());
        assert!(plan.entries.is_empty());
    }

    #[test]
    fn test_unified_diff() {
        let previous = set(&[deployment(json!({"replicas": 3}))]);
        let desired = set(&[deployment(json!({"replicas": 1}))]);
        let plan = Planner::new().plan(&desired, Some(&previous), &live_of(&previous));

        insta::assert_snapshot!(plan.entries[0].unified_diff(), @r"
        --- apps/Deployment/default/web
        +++ apps/Deployment/default/web
         apiVersion: apps/v1
         kind: Deployment
         metadata:
           name: web
           namespace: default
         spec:
        -  replicas: 3
        +  replicas: 1
        ");
    }

    #[test]
    fn test_merge_patch() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "list": [1, 2]});
        apply_merge_patch(&mut target, &json!({"a": {"b": null, "d": 4}, "list": [3]}));
        assert_eq!(target, json!({"a": {"c": 2, "d": 4}, "list": [3]}));
    }
}
