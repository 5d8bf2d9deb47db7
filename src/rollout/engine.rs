//! Rollout engine
//!
//! Executes the work plan item by item: apply the kind-appropriate restart,
//! wait for completion, optionally verify the mesh proxies, then advance the
//! persistent cursor. A failed item records a retry and leaves the cursor in
//! place so the next reconcile resumes exactly where it stopped.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::json;
use tokio::time::{sleep, Instant};
use tracing::info;

use crate::crd::{LinkerdTrustRotation, LinkerdTrustRotationSpec, Phase, Reason, RolloutStrategy};
use crate::status::StatusRecorder;
use crate::{Error, Result};

use super::check::ProxyCheck;
use super::plan::{PlanBuilder, WorkItem, WorkloadTarget};
use super::{WorkloadApi, RESTARTED_AT_ANNOTATION, ROLLOUT_ITEM_TIMEOUT, ROLLOUT_POLL_INTERVAL};

/// Restarts plan items with cursor-based resume
pub struct RolloutEngine {
    pub(super) api: Arc<dyn WorkloadApi>,
    pub(super) plans: PlanBuilder,
    pub(super) status: StatusRecorder,
    pub(super) check: ProxyCheck,
}

impl RolloutEngine {
    /// Create a new engine over the given API and status recorder
    pub fn new(api: Arc<dyn WorkloadApi>, status: StatusRecorder) -> Self {
        Self {
            plans: PlanBuilder::new(api.clone()),
            check: ProxyCheck::new(api.clone()),
            api,
            status,
        }
    }

    /// The plan builder backing this engine
    pub fn plan_builder(&self) -> &PlanBuilder {
        &self.plans
    }

    /// Restart every data-plane workload in the plan, resuming from the
    /// persisted cursor when the plan hash still matches.
    pub async fn restart_data_plane(&self, obj: &mut LinkerdTrustRotation) -> Result<()> {
        let spec = obj.spec.clone();
        let plan = self.plans.build(obj).await?;

        self.status
            .set_phase(
                obj,
                Phase::RollingDataPlane,
                Some(Reason::DataPlaneBatchRestarting),
                "Starting rollout restart of the Linkerd data plane",
            )
            .await?;

        let hash = plan.hash();
        let total = plan.total() as i32;

        let start = match obj.status.as_ref().and_then(|s| s.cursor.as_ref()) {
            Some(cursor)
                if cursor.plan_hash.as_deref() == Some(hash.as_str())
                    && cursor.next > 0
                    && cursor.next <= total =>
            {
                cursor.next
            }
            _ => {
                self.status.set_cursor(obj, None, 0, total, &hash).await?;
                0
            }
        };

        self.status
            .set_progress(obj, true, Some(start), Some(total))
            .await?;

        for index in (start as usize)..plan.items.len() {
            let item = &plan.items[index];
            info!(
                kind = %item.kind(),
                namespace = %item.namespace,
                name = %item.name,
                "restarting data plane workload"
            );

            if let Err(cause) = self.process_item(&spec, item).await {
                return self.record_failure(obj, item, cause).await;
            }

            let next = index as i32 + 1;
            self.status
                .set_cursor(obj, Some(item.work_ref()), next, total, &hash)
                .await?;
            self.status
                .set_progress(obj, true, Some(next), Some(total))
                .await?;
            info!(
                kind = %item.kind(),
                namespace = %item.namespace,
                name = %item.name,
                progress = format!("{next}/{total}"),
                "restarted data plane workload"
            );
        }

        self.status
            .set_phase(
                obj,
                Phase::RollingDataPlane,
                Some(Reason::DataPlaneThresholdReached),
                "Finished restarting the Linkerd data plane",
            )
            .await?;
        self.status.set_retry(obj, None, 0, "").await?;
        self.status.set_cursor(obj, None, 0, total, &hash).await
    }

    // Records the failure on the status without advancing the cursor, then
    // propagates the cause so the reconcile is retried.
    async fn record_failure(
        &self,
        obj: &mut LinkerdTrustRotation,
        item: &WorkItem,
        cause: Error,
    ) -> Result<()> {
        let count = obj
            .status
            .as_ref()
            .and_then(|s| s.retries.as_ref())
            .map(|r| r.count)
            .unwrap_or(0);

        self.status
            .set_retry(obj, Some(item.work_ref()), count + 1, &cause.to_string())
            .await?;

        Err(cause)
    }

    async fn process_item(&self, spec: &LinkerdTrustRotationSpec, item: &WorkItem) -> Result<()> {
        match &item.target {
            WorkloadTarget::Deployment(_) => {
                self.api
                    .merge_patch_deployment(&item.namespace, &item.name, &restarted_at_patch())
                    .await?;
                self.wait_deployment_rolled_out(&item.namespace, &item.name)
                    .await?;
            }
            WorkloadTarget::DaemonSet(_) => {
                self.api
                    .merge_patch_daemon_set(&item.namespace, &item.name, &restarted_at_patch())
                    .await?;
                self.wait_daemon_set_rolled_out(&item.namespace, &item.name)
                    .await?;
            }
            WorkloadTarget::StatefulSet(sts) => match item.strategy {
                RolloutStrategy::RolloutRestart => {
                    self.api
                        .merge_patch_stateful_set(&item.namespace, &item.name, &restarted_at_patch())
                        .await?;
                    self.wait_stateful_set_rolled_out(&item.namespace, &item.name)
                        .await?;
                }
                RolloutStrategy::RolloutDelete => {
                    self.restart_stateful_set_by_delete(sts, &item.namespace, &item.name)
                        .await?;
                }
            },
            WorkloadTarget::Custom { resource, bump, .. } => {
                let bump = bump
                    .as_ref()
                    .filter(|b| !b.key.is_empty() && !b.value.is_empty())
                    .ok_or_else(|| {
                        Error::configuration(format!(
                            "annotationBump key and value are required for custom resource {}",
                            resource.kind
                        ))
                    })?;

                let bump_key = bump.key.as_str();
                let bump_value = bump.value.as_str();
                let patch = json!({"metadata": {"annotations": { bump_key: bump_value }}});
                self.api
                    .merge_patch_custom_resource(resource, &item.namespace, &item.name, &patch)
                    .await?;
                self.wait_custom_resource_rolled_out(resource, &item.namespace, &item.name, &bump.key)
                    .await?;
            }
        }

        self.check
            .run(spec, &item.namespace, &item.name, ROLLOUT_ITEM_TIMEOUT)
            .await
    }

    pub(super) async fn wait_deployment_rolled_out(&self, namespace: &str, name: &str) -> Result<()> {
        let deadline = Instant::now() + ROLLOUT_ITEM_TIMEOUT;
        loop {
            if Instant::now() > deadline {
                return Err(Error::timeout(format!(
                    "waiting for Deployment {namespace}/{name} rollout"
                )));
            }
            sleep(ROLLOUT_POLL_INTERVAL).await;

            // not-found is unlikely mid-rollout; keep polling
            let Some(current) = self.api.get_deployment(namespace, name).await? else {
                continue;
            };
            if deployment_rolled_out(&current) {
                return Ok(());
            }
        }
    }

    async fn wait_stateful_set_rolled_out(&self, namespace: &str, name: &str) -> Result<()> {
        let deadline = Instant::now() + ROLLOUT_ITEM_TIMEOUT;
        loop {
            if Instant::now() > deadline {
                return Err(Error::timeout(format!(
                    "waiting for StatefulSet {namespace}/{name} rollout"
                )));
            }
            sleep(ROLLOUT_POLL_INTERVAL).await;

            let Some(current) = self.api.get_stateful_set(namespace, name).await? else {
                continue;
            };
            if stateful_set_rolled_out(&current) {
                return Ok(());
            }
        }
    }

    async fn wait_daemon_set_rolled_out(&self, namespace: &str, name: &str) -> Result<()> {
        let deadline = Instant::now() + ROLLOUT_ITEM_TIMEOUT;
        loop {
            if Instant::now() > deadline {
                return Err(Error::timeout(format!(
                    "waiting for DaemonSet {namespace}/{name} rollout"
                )));
            }
            sleep(ROLLOUT_POLL_INTERVAL).await;

            let Some(current) = self.api.get_daemon_set(namespace, name).await? else {
                continue;
            };
            if daemon_set_rollout_state(&current)? {
                return Ok(());
            }
        }
    }

    async fn wait_custom_resource_rolled_out(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        bump_key: &str,
    ) -> Result<()> {
        let deadline = Instant::now() + ROLLOUT_ITEM_TIMEOUT;
        loop {
            if Instant::now() > deadline {
                return Err(Error::timeout(format!(
                    "waiting for {} {namespace}/{name} rollout",
                    resource.kind
                )));
            }
            sleep(ROLLOUT_POLL_INTERVAL).await;

            let Some(current) = self
                .api
                .get_custom_resource(resource, namespace, name)
                .await?
            else {
                continue;
            };
            if custom_resource_rolled_out(&current, bump_key) {
                return Ok(());
            }
        }
    }

    // Manual rolling restart for StatefulSets that opt into rolloutDelete:
    // delete pods from the highest ordinal down, waiting for each
    // replacement to come back Running and Ready before the next delete.
    async fn restart_stateful_set_by_delete(
        &self,
        sts: &StatefulSet,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let selector = sts
            .spec
            .as_ref()
            .map(|s| label_selector_string(&s.selector))
            .unwrap_or_default();

        let mut pods = self.api.list_pods(namespace, &selector).await?;
        if pods.is_empty() {
            info!(
                namespace = %namespace,
                name = %name,
                "no pods found for StatefulSet, nothing to delete"
            );
            return Ok(());
        }

        pods.sort_by_key(|p| {
            std::cmp::Reverse(pod_ordinal(p.metadata.name.as_deref().unwrap_or_default()))
        });

        for pod in &pods {
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            self.delete_pod_and_wait_ready(namespace, &pod_name).await?;
        }

        Ok(())
    }

    async fn delete_pod_and_wait_ready(&self, namespace: &str, name: &str) -> Result<()> {
        self.api.delete_pod(namespace, name).await?;

        let deadline = Instant::now() + ROLLOUT_ITEM_TIMEOUT;
        loop {
            if Instant::now() > deadline {
                return Err(Error::timeout(format!(
                    "waiting for pod {namespace}/{name} to be Ready after delete"
                )));
            }
            sleep(ROLLOUT_POLL_INTERVAL).await;

            // still recreating; keep polling
            let Some(current) = self.api.get_pod(namespace, name).await? else {
                continue;
            };
            if current.metadata.deletion_timestamp.is_none()
                && current.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
                && pod_ready(&current)
            {
                return Ok(());
            }
        }
    }
}

/// Pod-template patch reproducing `kubectl rollout restart`
pub(super) fn restarted_at_patch() -> serde_json::Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        RESTARTED_AT_ANNOTATION: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
                    }
                }
            }
        }
    })
}

/// Whether a Deployment has fully rolled out, following the same logic as
/// `kubectl rollout status`. Desired replicas default to 1 when unset.
pub fn deployment_rolled_out(dep: &Deployment) -> bool {
    let desired = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let generation = dep.metadata.generation.unwrap_or(0);
    let Some(status) = &dep.status else {
        return false;
    };

    status.updated_replicas.unwrap_or(0) == desired
        && status.ready_replicas.unwrap_or(0) == desired
        && status.unavailable_replicas.unwrap_or(0) == 0
        && status.observed_generation.unwrap_or(0) >= generation
}

/// Whether a StatefulSet has finished its rolling update
pub fn stateful_set_rolled_out(sts: &StatefulSet) -> bool {
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let generation = sts.metadata.generation.unwrap_or(0);
    let Some(status) = &sts.status else {
        return false;
    };

    status.ready_replicas.unwrap_or(0) == desired
        && status.current_revision == status.update_revision
        && status.observed_generation.unwrap_or(0) >= generation
}

/// Whether a DaemonSet has finished its rolling update. A DaemonSet with the
/// OnDelete update strategy fails immediately: a template bump won't roll
/// its pods.
pub fn daemon_set_rollout_state(ds: &DaemonSet) -> Result<bool> {
    let namespace = ds.metadata.namespace.as_deref().unwrap_or_default();
    let name = ds.metadata.name.as_deref().unwrap_or_default();

    let on_delete = ds
        .spec
        .as_ref()
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|s| s.type_.as_deref())
        == Some("OnDelete");
    if on_delete {
        return Err(Error::incompatible(format!(
            "DaemonSet {namespace}/{name} uses OnDelete strategy: template bump won't roll pods"
        )));
    }

    let generation = ds.metadata.generation.unwrap_or(0);
    let Some(status) = &ds.status else {
        return Ok(false);
    };

    let desired = status.desired_number_scheduled;
    Ok(status.updated_number_scheduled.unwrap_or(0) == desired
        && status.number_available.unwrap_or(0) == desired
        && status.number_misscheduled == 0
        && status.observed_generation.unwrap_or(0) >= generation)
}

/// Whether a custom resource has finished rolling: its reported pods are all
/// ready, the status generation has caught up, and the bump annotation has
/// been cleared by the owning operator (absent or empty).
pub fn custom_resource_rolled_out(obj: &DynamicObject, bump_key: &str) -> bool {
    let status = obj.data.get("status");
    let ready = status
        .and_then(|s| s.get("readyPods"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let total = status
        .and_then(|s| s.get("pods"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let observed = status
        .and_then(|s| s.get("observedGeneration"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let generation = obj.metadata.generation.unwrap_or(0);

    let status_ok = total > 0 && ready == total && observed >= generation;

    let cleared = obj
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(bump_key))
        .map(|v| v.is_empty())
        .unwrap_or(true);

    status_ok && cleared
}

/// Whether a pod reports a true Ready condition
pub fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Numeric ordinal parsed from the suffix after the last `-` of a
/// StatefulSet pod name; -1 when absent or unparseable
pub fn pod_ordinal(name: &str) -> i32 {
    name.rsplit_once('-')
        .and_then(|(_, suffix)| suffix.parse().ok())
        .unwrap_or(-1)
}

fn label_selector_string(selector: &LabelSelector) -> String {
    let mut parts = Vec::new();
    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            parts.push(format!("{key}={value}"));
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let values = expr.values.clone().unwrap_or_default().join(",");
            match expr.operator.as_str() {
                "In" => parts.push(format!("{} in ({values})", expr.key)),
                "NotIn" => parts.push(format!("{} notin ({values})", expr.key)),
                "Exists" => parts.push(expr.key.clone()),
                "DoesNotExist" => parts.push(format!("!{}", expr.key)),
                _ => {}
            }
        }
    }
    parts.join(",")
}
