//! Post-rollout proxy verification
//!
//! When protection.runProxyCheck is enabled, each successfully restarted
//! workload is followed by a short-lived job in the mesh namespace running
//! `linkerd check --proxy` against the workload's namespace. The engine
//! treats a Failed job or a wait timeout as a retryable item failure.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use sha1::{Digest, Sha1};
use tokio::time::{sleep, Instant};
use tracing::info;

use crate::crd::LinkerdTrustRotationSpec;
use crate::{Error, Result};

use super::{WorkloadApi, ROLLOUT_POLL_INTERVAL};

/// Prefix of verification job names
pub const JOB_NAME_PREFIX: &str = "linkerd-proxy-check";

/// Service account the verification job runs under
pub const JOB_SERVICE_ACCOUNT: &str = "l5d-check";

/// Image used when protection.proxyCheckImage is unset
pub const DEFAULT_PROXY_CHECK_IMAGE: &str = "ghcr.io/linkerd/cli-bin:stable-2.14.10";

/// Runs the proxy-check job and waits for its verdict
pub struct ProxyCheck {
    api: Arc<dyn WorkloadApi>,
}

impl ProxyCheck {
    /// Create a new proxy check over the given API
    pub fn new(api: Arc<dyn WorkloadApi>) -> Self {
        Self { api }
    }

    /// Deterministic job name: the target namespace plus a short hash of the
    /// target name, so repeated checks for the same workload replace each
    /// other without colliding across workloads.
    pub fn job_name(target_namespace: &str, target_name: &str) -> String {
        let digest = hex::encode(Sha1::digest(target_name.as_bytes()));
        format!("{JOB_NAME_PREFIX}-{target_namespace}-{}", &digest[..7])
    }

    /// Run the verification job for a restarted workload if the rotation
    /// enables proxy checks; otherwise a no-op.
    pub async fn run(
        &self,
        spec: &LinkerdTrustRotationSpec,
        target_namespace: &str,
        target_name: &str,
        timeout: Duration,
    ) -> Result<()> {
        if !spec.protection.run_proxy_check {
            return Ok(());
        }

        let mesh_namespace = &spec.mesh.namespace;
        let image = spec
            .protection
            .proxy_check_image
            .clone()
            .unwrap_or_else(|| DEFAULT_PROXY_CHECK_IMAGE.to_string());

        let name = Self::job_name(target_namespace, target_name);
        let job = build_check_job(&name, &image, target_namespace, mesh_namespace);

        // best-effort cleanup of a previous run with the same name
        let _ = self.api.delete_job(mesh_namespace, &name).await;
        self.api.create_job(&job).await?;
        info!(
            namespace = %mesh_namespace,
            job = %name,
            target = %target_namespace,
            "started proxy check job"
        );

        self.wait_job_succeeded(mesh_namespace, &name, timeout).await
    }

    async fn wait_job_succeeded(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() > deadline {
                return Err(Error::verification(format!(
                    "timeout waiting for linkerd check job {namespace}/{name}"
                )));
            }
            sleep(ROLLOUT_POLL_INTERVAL).await;

            let Some(job) = self.api.get_job(namespace, name).await? else {
                continue;
            };

            let conditions = job
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .cloned()
                .unwrap_or_default();
            for condition in &conditions {
                if condition.type_ == "Failed" && condition.status == "True" {
                    return Err(Error::verification(format!(
                        "linkerd check job failed: {}",
                        condition.message.as_deref().unwrap_or("no message")
                    )));
                }
                if condition.type_ == "Complete" && condition.status == "True" {
                    return Ok(());
                }
            }
        }
    }
}

fn build_check_job(name: &str, image: &str, target_namespace: &str, mesh_namespace: &str) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(mesh_namespace.to_string()),
            labels: Some(std::collections::BTreeMap::from([(
                "app".to_string(),
                JOB_NAME_PREFIX.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(60),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(format!("{JOB_NAME_PREFIX}-{target_namespace}")),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(JOB_SERVICE_ACCOUNT.to_string()),
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: JOB_NAME_PREFIX.to_string(),
                        image: Some(image.to_string()),
                        args: Some(vec![
                            "check".to_string(),
                            "--proxy".to_string(),
                            "--namespace".to_string(),
                            target_namespace.to_string(),
                            "--linkerd-namespace".to_string(),
                            mesh_namespace.to_string(),
                            "--wait=2m".to_string(),
                            "--verbose".to_string(),
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
