//! Control-plane restart
//!
//! The Linkerd control plane is restarted before the data plane so proxies
//! pick up certificates minted from the new anchor. The restart is short and
//! all-or-nothing: no cursor, reverse-name order (followers before leaders),
//! same restart-annotation mechanism and rollout wait as Deployments in the
//! data plane.

use kube::ResourceExt;
use tracing::info;

use crate::crd::{LinkerdTrustRotation, Phase, Reason};
use crate::Result;

use super::engine::{restarted_at_patch, RolloutEngine};
use super::CONTROL_PLANE_NS_LABEL;

impl RolloutEngine {
    /// Restart every control-plane Deployment and wait for each rollout
    pub async fn restart_control_plane(&self, obj: &mut LinkerdTrustRotation) -> Result<()> {
        let namespace = obj.spec.mesh.namespace.clone();
        let selector = format!("{CONTROL_PLANE_NS_LABEL}={namespace}");
        let mut deployments = self
            .api
            .list_deployments_labeled(&namespace, &selector)
            .await?;

        self.status
            .set_phase(
                obj,
                Phase::RollingControlPlane,
                Some(Reason::ControlPlaneRestarting),
                "Starting rollout restart of the Linkerd control plane",
            )
            .await?;
        self.status.set_progress(obj, false, None, None).await?;

        deployments.sort_by(|a, b| b.name_any().cmp(&a.name_any()));

        for deployment in &deployments {
            let name = deployment.name_any();
            info!(namespace = %namespace, name = %name, "restarting control plane deployment");

            self.api
                .merge_patch_deployment(&namespace, &name, &restarted_at_patch())
                .await?;
            self.wait_deployment_rolled_out(&namespace, &name).await?;

            info!(namespace = %namespace, name = %name, "restarted control plane deployment");
        }

        self.status.set_progress(obj, true, None, None).await?;
        self.status
            .set_phase(
                obj,
                Phase::RollingControlPlane,
                Some(Reason::ControlPlaneReady),
                "Finished restarting the Linkerd control plane",
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AnnotationSelector, LinkerdTrustRotationSpec, MeshSpec, ProtectionSpec, RolloutSpec,
        RotationStatus, TriggerSpec,
    };
    use crate::rollout::MockWorkloadApi;
    use crate::status::{MockStatusPatcher, StatusRecorder};
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::{Arc, Mutex};

    fn sample_rotation() -> LinkerdTrustRotation {
        LinkerdTrustRotation {
            metadata: ObjectMeta {
                name: Some("rotation".to_string()),
                namespace: Some("linkerd".to_string()),
                ..Default::default()
            },
            spec: LinkerdTrustRotationSpec {
                mesh: MeshSpec {
                    namespace: "linkerd".to_string(),
                    trust_roots_bundle_name: "linkerd-identity-trust-roots".to_string(),
                    current_anchor_secret_name: "linkerd-trust-anchor".to_string(),
                    previous_anchor_secret_name: "linkerd-previous-anchor".to_string(),
                    bootstrap_previous_if_missing: false,
                },
                trigger: TriggerSpec {
                    on_bundle_change: false,
                    on_anchor_divergence: true,
                },
                rollout: RolloutSpec {
                    selector: AnnotationSelector {
                        annotation_key: "linkerd.io/inject".to_string(),
                        annotation_value: "enabled".to_string(),
                        targets: vec![],
                    },
                },
                protection: ProtectionSpec::default(),
                dry_run: false,
            },
            status: None,
        }
    }

    fn ready_cp_deployment(name: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("linkerd".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                updated_replicas: Some(1),
                ready_replicas: Some(1),
                observed_generation: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn recorder_with_capture() -> (StatusRecorder, Arc<Mutex<Vec<RotationStatus>>>) {
        let updates: Arc<Mutex<Vec<RotationStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let updates_clone = updates.clone();
        let mut patcher = MockStatusPatcher::new();
        patcher
            .expect_patch_rotation_status()
            .returning(move |_, _, status| {
                updates_clone.lock().unwrap().push(status.clone());
                Ok(())
            });
        (StatusRecorder::new(Arc::new(patcher)), updates)
    }

    /// Story: control-plane deployments restart in reverse-name order so
    /// followers roll before leaders
    #[tokio::test(start_paused = true)]
    async fn restarts_in_reverse_name_order() {
        let restarted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let restarted_clone = restarted.clone();

        let mut api = MockWorkloadApi::new();
        api.expect_list_deployments_labeled()
            .withf(|ns, selector| {
                ns == "linkerd" && selector == "linkerd.io/control-plane-ns=linkerd"
            })
            .returning(|_, _| {
                Ok(vec![
                    ready_cp_deployment("linkerd-destination"),
                    ready_cp_deployment("linkerd-proxy-injector"),
                    ready_cp_deployment("linkerd-identity"),
                ])
            });
        api.expect_merge_patch_deployment()
            .returning(move |_, name, _| {
                restarted_clone.lock().unwrap().push(name.to_string());
                Ok(())
            });
        api.expect_get_deployment()
            .returning(|_, name| Ok(Some(ready_cp_deployment(name))));

        let (status, capture) = recorder_with_capture();
        let engine = RolloutEngine::new(Arc::new(api), status);
        let mut obj = sample_rotation();

        engine.restart_control_plane(&mut obj).await.unwrap();

        assert_eq!(
            *restarted.lock().unwrap(),
            vec![
                "linkerd-proxy-injector",
                "linkerd-identity",
                "linkerd-destination",
            ]
        );

        let last = capture.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.phase, Some(Phase::RollingControlPlane));
        assert_eq!(last.reason, Some(Reason::ControlPlaneReady));
        assert!(last.progress.unwrap().control_plane_ready);
    }

    /// Story: a mesh with no labelled control-plane deployments is
    /// immediately ready (nothing to restart)
    #[tokio::test]
    async fn no_control_plane_deployments_is_immediately_ready() {
        let mut api = MockWorkloadApi::new();
        api.expect_list_deployments_labeled()
            .returning(|_, _| Ok(vec![]));

        let (status, capture) = recorder_with_capture();
        let engine = RolloutEngine::new(Arc::new(api), status);
        let mut obj = sample_rotation();

        engine.restart_control_plane(&mut obj).await.unwrap();

        let last = capture.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.reason, Some(Reason::ControlPlaneReady));
        assert!(last.progress.unwrap().control_plane_ready);
    }

    /// A failed control-plane restart propagates; the orchestrator marks
    /// the rotation Failed (no cursor exists for the control plane)
    #[tokio::test(start_paused = true)]
    async fn restart_failure_propagates() {
        let mut api = MockWorkloadApi::new();
        api.expect_list_deployments_labeled()
            .returning(|_, _| Ok(vec![ready_cp_deployment("linkerd-identity")]));
        api.expect_merge_patch_deployment()
            .returning(|_, _, _| Err(crate::Error::configuration("patch refused")));

        let (status, _capture) = recorder_with_capture();
        let engine = RolloutEngine::new(Arc::new(api), status);
        let mut obj = sample_rotation();

        let err = engine.restart_control_plane(&mut obj).await.unwrap_err();
        assert!(err.to_string().contains("patch refused"));
    }
}
