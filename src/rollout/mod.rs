//! Work plan construction and the workload restart engine
//!
//! The plan builder scans the cluster for workloads matching the rotation's
//! pod-template annotation selector and emits a deterministic, ordered work
//! plan. The rollout engine executes the plan item by item with the
//! kind-appropriate restart mechanism and readiness wait, persisting a
//! cursor on the rotation status so interrupted rollouts resume where they
//! stopped.

mod check;
mod control_plane;
mod engine;
mod plan;

pub use check::{ProxyCheck, DEFAULT_PROXY_CHECK_IMAGE, JOB_NAME_PREFIX, JOB_SERVICE_ACCOUNT};
pub use engine::{
    custom_resource_rolled_out, daemon_set_rollout_state, deployment_rolled_out, pod_ordinal,
    pod_ready, stateful_set_rolled_out, RolloutEngine,
};
pub use plan::{
    custom_resource_matches, Plan, PlanBuilder, PlanStats, WorkItem, WorkloadTarget,
};

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Api, Client};

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Pod-template annotation whose change forces a rolling restart
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Label selecting Linkerd control-plane deployments
pub const CONTROL_PLANE_NS_LABEL: &str = "linkerd.io/control-plane-ns";

/// Cadence of readiness polling
pub const ROLLOUT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Per-item deadline for restarts, waits, and verification jobs
pub const ROLLOUT_ITEM_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Trait abstracting the workload, pod, and job operations used by the plan
/// builder and the rollout engine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// List Deployments in a namespace
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>>;

    /// List Deployments in a namespace matching a label selector
    async fn list_deployments_labeled(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Deployment>>;

    /// List StatefulSets in a namespace
    async fn list_stateful_sets(&self, namespace: &str) -> Result<Vec<StatefulSet>>;

    /// List DaemonSets in a namespace
    async fn list_daemon_sets(&self, namespace: &str) -> Result<Vec<DaemonSet>>;

    /// List schemaless objects of the given resource in a namespace
    async fn list_custom_resources(
        &self,
        resource: &ApiResource,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>>;

    /// Fetch a Deployment, None when absent
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Fetch a StatefulSet, None when absent
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    /// Fetch a DaemonSet, None when absent
    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>>;

    /// Fetch a schemaless object, None when absent
    async fn get_custom_resource(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// JSON merge-patch a Deployment
    async fn merge_patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    /// JSON merge-patch a StatefulSet
    async fn merge_patch_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    /// JSON merge-patch a DaemonSet
    async fn merge_patch_daemon_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    /// JSON merge-patch a schemaless object
    async fn merge_patch_custom_resource(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    /// List pods in a namespace matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Fetch a pod, None when absent
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Delete a pod with background propagation and the pod's own grace
    /// period. Not-found is success.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a verification job
    async fn create_job(&self, job: &Job) -> Result<()>;

    /// Fetch a job, None when absent
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// Delete a job with foreground propagation. Not-found is success.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Real workload API backed by the cluster
pub struct KubeWorkloadApi {
    client: Client,
}

impl KubeWorkloadApi {
    /// Create a new API wrapper over the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn stateful_sets(&self, namespace: &str) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn daemon_sets(&self, namespace: &str) -> Api<DaemonSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn custom(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl WorkloadApi for KubeWorkloadApi {
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        Ok(self
            .deployments(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn list_deployments_labeled(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Deployment>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.deployments(namespace).list(&params).await?.items)
    }

    async fn list_stateful_sets(&self, namespace: &str) -> Result<Vec<StatefulSet>> {
        Ok(self
            .stateful_sets(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn list_daemon_sets(&self, namespace: &str) -> Result<Vec<DaemonSet>> {
        Ok(self
            .daemon_sets(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn list_custom_resources(
        &self,
        resource: &ApiResource,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>> {
        Ok(self
            .custom(resource, namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployments(namespace).get_opt(name).await?)
    }

    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.stateful_sets(namespace).get_opt(name).await?)
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        Ok(self.daemon_sets(namespace).get_opt(name).await?)
    }

    async fn get_custom_resource(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.custom(resource, namespace).get_opt(name).await?)
    }

    async fn merge_patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        self.deployments(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn merge_patch_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        self.stateful_sets(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn merge_patch_daemon_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        self.daemon_sets(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn merge_patch_custom_resource(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        self.custom(resource, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.pods(namespace).list(&params).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .pods(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        let namespace = job.metadata.namespace.as_deref().unwrap_or_default();
        self.jobs(namespace).create(&PostParams::default(), job).await?;
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.jobs(namespace).get_opt(name).await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .jobs(namespace)
            .delete(name, &DeleteParams::foreground())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
