//! Work plan construction
//!
//! The plan is rebuilt on every reconcile from the rotation's annotation
//! selector: for each target scope in declaration order, for each allowed
//! namespace in declaration order, matching workloads are emitted sorted by
//! name. Only the plan hash and the cursor persist across reconciles, so
//! the same cluster state must always hash to the same plan.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tracing::info;

use crate::crd::{
    AnnotationBump, LinkerdTrustRotation, RolloutStrategy, TargetScope, WorkRef, WorkloadKind,
};
use crate::{Error, Result};

use super::WorkloadApi;

/// Snapshot of the live object a work item restarts, tagged by kind
#[derive(Clone, Debug)]
pub enum WorkloadTarget {
    /// apps/v1 Deployment snapshot
    Deployment(Box<Deployment>),
    /// apps/v1 StatefulSet snapshot
    StatefulSet(Box<StatefulSet>),
    /// apps/v1 DaemonSet snapshot
    DaemonSet(Box<DaemonSet>),
    /// Schemaless custom resource snapshot with its API coordinates and the
    /// optional vendor annotation bump
    Custom {
        /// The object as listed
        object: Box<DynamicObject>,
        /// API coordinates used for follow-up get/patch calls
        resource: ApiResource,
        /// Vendor annotation bump carried from the target scope
        bump: Option<AnnotationBump>,
    },
}

/// A single workload scheduled for restart
#[derive(Clone, Debug)]
pub struct WorkItem {
    /// Workload namespace
    pub namespace: String,
    /// Workload name
    pub name: String,
    /// How this item is restarted
    pub strategy: RolloutStrategy,
    /// The snapshot needed to apply the restart
    pub target: WorkloadTarget,
}

impl WorkItem {
    /// The workload kind of this item
    pub fn kind(&self) -> WorkloadKind {
        match self.target {
            WorkloadTarget::Deployment(_) => WorkloadKind::Deployment,
            WorkloadTarget::StatefulSet(_) => WorkloadKind::StatefulSet,
            WorkloadTarget::DaemonSet(_) => WorkloadKind::DaemonSet,
            WorkloadTarget::Custom { .. } => WorkloadKind::CustomResource,
        }
    }

    /// Stable (kind, namespace, name) reference for status fields
    pub fn work_ref(&self) -> WorkRef {
        WorkRef {
            kind: self.kind().to_string(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    // Stable identifier line fed into the plan hash. Volatile fields
    // (resource version, snapshot contents) must not contribute.
    fn hash_line(&self) -> String {
        let mut line = format!(
            "{}|{}/{}|{}",
            self.kind(),
            self.namespace,
            self.name,
            self.strategy
        );
        if let WorkloadTarget::Custom { bump: Some(bump), .. } = &self.target {
            if !bump.key.is_empty() {
                line.push_str(&format!("|{}={}", bump.key, bump.value));
            }
        }
        line
    }
}

/// Per-kind match counters for logs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlanStats {
    /// Matched Deployments
    pub deployments: usize,
    /// Matched StatefulSets
    pub stateful_sets: usize,
    /// Matched DaemonSets
    pub daemon_sets: usize,
    /// Matched custom resources
    pub custom_resources: usize,
}

/// Ordered work plan with per-kind counters
#[derive(Clone, Debug, Default)]
pub struct Plan {
    /// Work items in execution order
    pub items: Vec<WorkItem>,
    /// Per-kind match counters
    pub stats: PlanStats,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DryRunEntry {
    kind: String,
    namespace: String,
    name: String,
    strategy: String,
}

impl Plan {
    /// Number of items in the plan
    pub fn total(&self) -> usize {
        self.items.len()
    }

    /// Content hash over the stable item identifiers: truncated hex SHA-1
    /// of `kind|namespace/name|strategy|(bumpKey=bumpValue)?` per item.
    pub fn hash(&self) -> String {
        let mut hasher = Sha1::new();
        for item in &self.items {
            hasher.update(item.hash_line().as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())[..12].to_string()
    }

    /// Human-readable YAML dump of the plan for dry runs
    pub fn dry_run_dump(&self) -> Result<String> {
        let entries: Vec<DryRunEntry> = self
            .items
            .iter()
            .map(|item| DryRunEntry {
                kind: item.kind().to_string(),
                namespace: item.namespace.clone(),
                name: item.name.clone(),
                strategy: item.strategy.to_string(),
            })
            .collect();
        serde_yaml::to_string(&entries).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// Builds the ordered work plan from the rotation's annotation selector
pub struct PlanBuilder {
    api: Arc<dyn WorkloadApi>,
}

impl PlanBuilder {
    /// Create a new builder over the given API
    pub fn new(api: Arc<dyn WorkloadApi>) -> Self {
        Self { api }
    }

    /// Scan the cluster and emit the deterministic work plan
    pub async fn build(&self, rotation: &LinkerdTrustRotation) -> Result<Plan> {
        let selector = &rotation.spec.rollout.selector;
        let key = &selector.annotation_key;
        let value = &selector.annotation_value;
        let mut plan = Plan::default();

        for scope in &selector.targets {
            if scope.allowed_namespaces.is_empty() {
                return Err(Error::configuration(format!(
                    "targets[{}]: allowedNamespaces is required",
                    scope.kind_type
                )));
            }

            let strategy = scope.strategy();
            match scope.kind_type {
                WorkloadKind::Deployment => {
                    let mut detected = 0;
                    for namespace in &scope.allowed_namespaces {
                        let mut matched: Vec<Deployment> = self
                            .api
                            .list_deployments(namespace)
                            .await?
                            .into_iter()
                            .filter(|d| {
                                d.spec
                                    .as_ref()
                                    .map(|s| template_has_annotation(&s.template, key, value))
                                    .unwrap_or(false)
                            })
                            .collect();
                        matched.sort_by(|a, b| a.name_any().cmp(&b.name_any()));
                        for dep in matched {
                            plan.items.push(WorkItem {
                                namespace: dep.namespace().unwrap_or_default(),
                                name: dep.name_any(),
                                strategy,
                                target: WorkloadTarget::Deployment(Box::new(dep)),
                            });
                            detected += 1;
                            plan.stats.deployments += 1;
                        }
                    }
                    info!(
                        count = detected,
                        namespaces = ?scope.allowed_namespaces,
                        "found Deployments matching selector"
                    );
                }
                WorkloadKind::StatefulSet => {
                    let mut detected = 0;
                    for namespace in &scope.allowed_namespaces {
                        let mut matched: Vec<StatefulSet> = self
                            .api
                            .list_stateful_sets(namespace)
                            .await?
                            .into_iter()
                            .filter(|s| {
                                s.spec
                                    .as_ref()
                                    .map(|s| template_has_annotation(&s.template, key, value))
                                    .unwrap_or(false)
                            })
                            .collect();
                        matched.sort_by(|a, b| a.name_any().cmp(&b.name_any()));
                        for sts in matched {
                            plan.items.push(WorkItem {
                                namespace: sts.namespace().unwrap_or_default(),
                                name: sts.name_any(),
                                strategy,
                                target: WorkloadTarget::StatefulSet(Box::new(sts)),
                            });
                            detected += 1;
                            plan.stats.stateful_sets += 1;
                        }
                    }
                    info!(
                        count = detected,
                        namespaces = ?scope.allowed_namespaces,
                        "found StatefulSets matching selector"
                    );
                }
                WorkloadKind::DaemonSet => {
                    let mut detected = 0;
                    for namespace in &scope.allowed_namespaces {
                        let mut matched: Vec<DaemonSet> = self
                            .api
                            .list_daemon_sets(namespace)
                            .await?
                            .into_iter()
                            .filter(|d| {
                                d.spec
                                    .as_ref()
                                    .map(|s| template_has_annotation(&s.template, key, value))
                                    .unwrap_or(false)
                            })
                            .collect();
                        matched.sort_by(|a, b| a.name_any().cmp(&b.name_any()));
                        for ds in matched {
                            plan.items.push(WorkItem {
                                namespace: ds.namespace().unwrap_or_default(),
                                name: ds.name_any(),
                                strategy,
                                target: WorkloadTarget::DaemonSet(Box::new(ds)),
                            });
                            detected += 1;
                            plan.stats.daemon_sets += 1;
                        }
                    }
                    info!(
                        count = detected,
                        namespaces = ?scope.allowed_namespaces,
                        "found DaemonSets matching selector"
                    );
                }
                WorkloadKind::CustomResource => {
                    let resource = scope_api_resource(scope)?;
                    let mut detected = 0;
                    for namespace in &scope.allowed_namespaces {
                        let mut matched: Vec<DynamicObject> = self
                            .api
                            .list_custom_resources(&resource, namespace)
                            .await?
                            .into_iter()
                            .filter(|obj| custom_resource_matches(obj, key, value))
                            .collect();
                        matched.sort_by(|a, b| a.name_any().cmp(&b.name_any()));
                        for obj in matched {
                            plan.items.push(WorkItem {
                                namespace: obj.namespace().unwrap_or_default(),
                                name: obj.name_any(),
                                strategy,
                                target: WorkloadTarget::Custom {
                                    object: Box::new(obj),
                                    resource: resource.clone(),
                                    bump: scope.annotation_bump.clone(),
                                },
                            });
                            detected += 1;
                            plan.stats.custom_resources += 1;
                        }
                    }
                    info!(
                        count = detected,
                        kind = %resource.kind,
                        namespaces = ?scope.allowed_namespaces,
                        "found custom resources matching selector"
                    );
                }
            }
        }

        Ok(plan)
    }
}

fn scope_api_resource(scope: &TargetScope) -> Result<ApiResource> {
    let (group, version, kind) = match (&scope.api_group, &scope.version, &scope.kind) {
        (Some(g), Some(v), Some(k)) if !g.is_empty() && !v.is_empty() && !k.is_empty() => (g, v, k),
        _ => {
            return Err(Error::configuration(format!(
                "targets[{}]: apiGroup, kind and version are required",
                scope.kind_type
            )));
        }
    };

    Ok(ApiResource {
        group: group.clone(),
        version: version.clone(),
        api_version: format!("{group}/{version}"),
        kind: kind.clone(),
        plural: pluralize_kind(kind),
    })
}

// The rotation targets user-supplied kinds with regular plurals; lowercase
// plus "s" covers them without a discovery round-trip.
fn pluralize_kind(kind: &str) -> String {
    format!("{}s", kind.to_lowercase())
}

fn template_has_annotation(template: &PodTemplateSpec, key: &str, value: &str) -> bool {
    template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(key))
        .map(|v| v == value)
        .unwrap_or(false)
}

/// Check the canonical pod-template annotation locations of a schemaless
/// object for `key=value`. An empty expected value matches the key's
/// presence regardless of its value.
pub fn custom_resource_matches(obj: &DynamicObject, key: &str, value: &str) -> bool {
    const PATHS: [&[&str]; 3] = [
        &["spec", "template", "metadata", "annotations"],
        &["spec", "jobTemplate", "spec", "template", "metadata", "annotations"],
        &["spec", "podTemplate", "metadata", "annotations"],
    ];

    for path in PATHS {
        if annotations_match_at(&obj.data, path, key, value) {
            return true;
        }
    }

    // spec.pods[*].metadata.annotations (pod-set style operators)
    if let Some(pods) = obj
        .data
        .get("spec")
        .and_then(|s| s.get("pods"))
        .and_then(|p| p.as_array())
    {
        for pod in pods {
            if annotations_match_at(pod, &["metadata", "annotations"], key, value) {
                return true;
            }
        }
    }

    false
}

fn annotations_match_at(
    root: &serde_json::Value,
    path: &[&str],
    key: &str,
    value: &str,
) -> bool {
    let mut cur = root;
    for part in path {
        match cur.get(part) {
            Some(next) => cur = next,
            None => return false,
        }
    }
    match cur.get(key).and_then(|v| v.as_str()) {
        Some(v) => value.is_empty() || v == value,
        None => false,
    }
}
