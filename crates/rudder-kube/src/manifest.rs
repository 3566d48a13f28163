//! Manifest sets: rendered documents parsed, identified and classified
//!
//! Every rendered document becomes either a main resource or a hook at build
//! time; nothing downstream inspects annotations again to find out which.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::annotations::{annotations_of, get_annotation, helm, is_kept, rudder};
use crate::error::{ManifestError, Result};
use crate::hooks::{HookPhase, HookSpec};

/// Kinds that live outside any namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "CSIDriver",
    "CSINode",
    "CertificateSigningRequest",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "RuntimeClass",
    "StorageClass",
    "ValidatingAdmissionPolicy",
    "ValidatingAdmissionPolicyBinding",
    "ValidatingWebhookConfiguration",
    "VolumeAttachment",
];

/// Identity of a resource: API group, kind, namespace and name
///
/// Ordering is lexical over the fields in that order; cluster-scoped
/// resources have no namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Identity as written in the document, without any namespace defaulting
    pub fn of(document: &JsonValue) -> Option<Self> {
        let api_version = document.get("apiVersion")?.as_str()?;
        let kind = document.get("kind")?.as_str()?;
        let name = document.pointer("/metadata/name")?.as_str()?;
        let namespace = document
            .pointer("/metadata/namespace")
            .and_then(JsonValue::as_str)
            .filter(|ns| !ns.is_empty() && !is_cluster_scoped(kind));

        Some(Self::new(group_of(api_version), kind, namespace, name))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = if self.group.is_empty() {
            "core"
        } else {
            &self.group
        };
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}/{}", group, self.kind, ns, self.name),
            None => write!(f, "{}/{}/{}", group, self.kind, self.name),
        }
    }
}

/// API group of an apiVersion (`apps/v1` -> `apps`, `v1` -> ``)
pub fn group_of(api_version: &str) -> &str {
    api_version
        .split_once('/')
        .map(|(group, _)| group)
        .unwrap_or("")
}

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// One parsed document with its identity and origin
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub id: ResourceId,
    /// Rendered file the document came from
    pub source: String,
    pub document: JsonValue,
}

impl Manifest {
    pub fn api_version(&self) -> &str {
        self.document
            .get("apiVersion")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
    }

    /// Retained in the cluster when it leaves the desired set
    pub fn is_kept(&self) -> bool {
        is_kept(&annotations_of(&self.document))
    }
}

/// A rendered document, classified once at build time
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Main(Manifest),
    Hook(Manifest, HookSpec),
}

impl Resource {
    pub fn manifest(&self) -> &Manifest {
        match self {
            Resource::Main(m) | Resource::Hook(m, _) => m,
        }
    }

    pub fn hook(&self) -> Option<&HookSpec> {
        match self {
            Resource::Main(_) => None,
            Resource::Hook(_, spec) => Some(spec),
        }
    }
}

/// All resources of one revision, keyed by identity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestSet {
    resources: BTreeMap<ResourceId, Resource>,
}

impl ManifestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    /// Main resources in identity order
    pub fn main(&self) -> impl Iterator<Item = &Manifest> {
        self.resources.values().filter_map(|r| match r {
            Resource::Main(m) => Some(m),
            Resource::Hook(..) => None,
        })
    }

    pub fn main_manifest(&self, id: &ResourceId) -> Option<&Manifest> {
        match self.resources.get(id)? {
            Resource::Main(m) => Some(m),
            Resource::Hook(..) => None,
        }
    }

    /// Hook resources in identity order
    pub fn hooks(&self) -> impl Iterator<Item = (&Manifest, &HookSpec)> {
        self.resources.values().filter_map(|r| match r {
            Resource::Hook(m, spec) => Some((m, spec)),
            Resource::Main(_) => None,
        })
    }

    /// Hooks registered for `phase`, by ascending weight then identity
    pub fn hooks_for(&self, phase: HookPhase) -> Vec<(&Manifest, &HookSpec)> {
        let mut hooks: Vec<_> = self
            .hooks()
            .filter(|(_, spec)| spec.phases.contains(&phase))
            .collect();
        hooks.sort_by(|(a, sa), (b, sb)| sa.weight.cmp(&sb.weight).then_with(|| a.id.cmp(&b.id)));
        hooks
    }

    /// Canonical text: main resources then hooks, each with its source
    pub fn to_manifest(&self) -> Result<String> {
        let mut out = String::new();
        for manifest in self.main().chain(self.hooks().map(|(m, _)| m)) {
            out.push_str("---\n# Source: ");
            out.push_str(&manifest.source);
            out.push('\n');
            out.push_str(&serde_yaml::to_string(&manifest.document)?);
        }
        Ok(out)
    }

    /// Parse manifest text stored with a revision
    ///
    /// Knows only the built-in cluster-scoped kinds; custom ones need
    /// [`ManifestSetBuilder::parse_manifest`].
    pub fn from_manifest(text: &str, default_namespace: &str) -> std::result::Result<Self, ManifestError> {
        ManifestSetBuilder::new(default_namespace).parse_manifest(text)
    }

    /// Add the main resources of `other`, replacing those with the same identity
    ///
    /// Hooks are not carried over.
    pub fn overlay(&mut self, other: &ManifestSet) {
        for manifest in other.main() {
            self.resources
                .insert(manifest.id.clone(), Resource::Main(manifest.clone()));
        }
    }
}

/// Parses rendered files into a [`ManifestSet`]
#[derive(Debug, Clone)]
pub struct ManifestSetBuilder {
    default_namespace: String,
    extra_cluster_scoped: Vec<String>,
}

impl ManifestSetBuilder {
    pub fn new(default_namespace: impl Into<String>) -> Self {
        Self {
            default_namespace: default_namespace.into(),
            extra_cluster_scoped: Vec::new(),
        }
    }

    /// Treat a custom kind as cluster-scoped
    pub fn cluster_scoped_kind(mut self, kind: impl Into<String>) -> Self {
        self.extra_cluster_scoped.push(kind.into());
        self
    }

    fn cluster_scoped(&self, kind: &str) -> bool {
        is_cluster_scoped(kind) || self.extra_cluster_scoped.iter().any(|k| k == kind)
    }

    /// Build from rendered files keyed by path
    pub fn build(&self, files: &BTreeMap<String, String>) -> std::result::Result<ManifestSet, ManifestError> {
        let mut set = ManifestSet::new();
        for (source, content) in files {
            for (index, document) in split_documents(content).iter().enumerate() {
                self.add_document(&mut set, source, index + 1, document)?;
            }
        }
        Ok(set)
    }

    /// Parse canonical manifest text, keeping each document's `# Source:`
    pub fn parse_manifest(&self, text: &str) -> std::result::Result<ManifestSet, ManifestError> {
        let mut set = ManifestSet::new();
        for (index, document) in split_documents(text).iter().enumerate() {
            let source = document
                .lines()
                .find_map(|line| line.trim().strip_prefix("# Source:"))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| "manifest".to_string());
            self.add_document(&mut set, &source, index + 1, document)?;
        }
        Ok(set)
    }

    fn add_document(
        &self,
        set: &mut ManifestSet,
        source: &str,
        index: usize,
        text: &str,
    ) -> std::result::Result<(), ManifestError> {
        if is_blank(text) {
            return Ok(());
        }

        let mut document: JsonValue =
            serde_yaml::from_str(text).map_err(|e| ManifestError::Parse {
                source_file: source.to_string(),
                document: index,
                message: e.to_string(),
            })?;
        if document.is_null() {
            return Ok(());
        }

        let missing = |field| ManifestError::MissingField {
            source_file: source.to_string(),
            document: index,
            field,
        };
        let object = document
            .as_object_mut()
            .ok_or_else(|| ManifestError::NotAMapping {
                source_file: source.to_string(),
                document: index,
            })?;
        let api_version = non_empty_str(object.get("apiVersion")).ok_or_else(|| missing("apiVersion"))?;
        let kind = non_empty_str(object.get("kind")).ok_or_else(|| missing("kind"))?;
        let metadata = object
            .get_mut("metadata")
            .and_then(JsonValue::as_object_mut)
            .ok_or_else(|| missing("metadata.name"))?;
        let name = non_empty_str(metadata.get("name")).ok_or_else(|| missing("metadata.name"))?;

        let namespace = if self.cluster_scoped(&kind) {
            None
        } else {
            let ns = non_empty_str(metadata.get("namespace"))
                .unwrap_or_else(|| self.default_namespace.clone());
            metadata.insert("namespace".to_string(), JsonValue::String(ns.clone()));
            Some(ns)
        };

        let id = ResourceId {
            group: group_of(&api_version).to_string(),
            kind,
            namespace,
            name,
        };

        if let Some(existing) = set.resources.get(&id) {
            return Err(ManifestError::Duplicate {
                id,
                first: existing.manifest().source.clone(),
                second: source.to_string(),
            });
        }

        let annotations = annotations_of(&document);
        let manifest = Manifest {
            id: id.clone(),
            source: source.to_string(),
            document,
        };
        let resource = match get_annotation(&annotations, rudder::HOOK, helm::HOOK) {
            None => Resource::Main(manifest),
            Some(_) => {
                let spec = HookSpec::from_annotations(&annotations).map_err(|message| {
                    ManifestError::InvalidHook {
                        source_file: source.to_string(),
                        id: id.clone(),
                        message,
                    }
                })?;
                Resource::Hook(manifest, spec)
            }
        };

        set.resources.insert(id, resource);
        Ok(())
    }
}

fn non_empty_str(value: Option<&JsonValue>) -> Option<String> {
    value
        .and_then(JsonValue::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn is_blank(text: &str) -> bool {
    text.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#')
    })
}

fn is_separator(line: &str) -> bool {
    let line = line.trim_end();
    line == "---" || line.starts_with("--- ")
}

/// Split multi-document YAML on `---` lines
fn split_documents(text: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if is_separator(line) {
            documents.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    documents.push(current);
    documents
}
