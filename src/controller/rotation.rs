//! LinkerdTrustRotation controller implementation
//!
//! The reconciler observes the rotation resource, decides whether the trust
//! bundle has entered the overlap state, and drives the phased restart of
//! the mesh until the cluster converges on the new anchor. Progress is
//! externalized on the status subresource, so a requeue, crash, or process
//! replacement resumes the rollout instead of restarting it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use tokio::time::sleep;
use tracing::{info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::bundle::{BundleInspector, KubeBundleSource};
use crate::crd::{BundleState, LinkerdTrustRotation, Phase, Reason};
use crate::rollout::{KubeWorkloadApi, RolloutEngine};
use crate::secrets::{KubeSecretStore, SecretSynchronizer};
use crate::status::{KubeStatusPatcher, StatusRecorder};
use crate::{Error, IDENTITY_ISSUER_SECRET};

/// Steady-state requeue interval
pub const REQUEUE_INTERVAL: Duration = Duration::from_secs(10);

/// Requeue interval after the retry budget is exhausted
const MAX_RETRIES_REQUEUE: Duration = Duration::from_secs(60);

/// Trait abstracting Kubernetes event emission
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emit a warning event on the rotation resource. Event delivery is
    /// best-effort; failures are logged, not propagated.
    async fn warn(&self, obj: &LinkerdTrustRotation, reason: &str, message: &str);
}

/// Real event sink publishing through the cluster event API
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    /// Create a new sink reporting as this controller
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: "linkerd-trust-rotator".to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn warn(&self, obj: &LinkerdTrustRotation, reason: &str, message: &str) {
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Rotate".to_string(),
            secondary: None,
        };
        let reference: k8s_openapi::api::core::v1::ObjectReference = ObjectRef::from_obj(obj).into();
        if let Err(error) = self.recorder.publish(&event, &reference).await {
            warn!(%error, reason, "failed to publish event");
        }
    }
}

/// Controller context containing the managers shared across reconciles
pub struct Context {
    /// Trust bundle inspector
    pub bundles: BundleInspector,
    /// Anchor secret synchronizer
    pub secrets: SecretSynchronizer,
    /// Status recorder (sole writer of the status subresource)
    pub status: StatusRecorder,
    /// Workload restart engine
    pub engine: RolloutEngine,
    /// Event emitter
    pub events: Arc<dyn EventSink>,
}

impl Context {
    /// Create a context with real cluster-backed managers
    pub fn new(client: Client) -> Self {
        let status = StatusRecorder::new(Arc::new(KubeStatusPatcher::new(client.clone())));
        Self {
            bundles: BundleInspector::new(Arc::new(KubeBundleSource::new(client.clone()))),
            secrets: SecretSynchronizer::new(Arc::new(KubeSecretStore::new(client.clone()))),
            engine: RolloutEngine::new(Arc::new(KubeWorkloadApi::new(client.clone())), status.clone()),
            status,
            events: Arc::new(KubeEventSink::new(client)),
        }
    }

    /// Create a context from preassembled managers (used by tests)
    pub fn with_parts(
        bundles: BundleInspector,
        secrets: SecretSynchronizer,
        status: StatusRecorder,
        engine: RolloutEngine,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            bundles,
            secrets,
            status,
            engine,
            events,
        }
    }
}

/// Reconcile a LinkerdTrustRotation resource
#[instrument(skip(rotation, ctx), fields(rotation = %rotation.name_any()))]
pub async fn reconcile(
    rotation: Arc<LinkerdTrustRotation>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let mut obj = (*rotation).clone();
    info!("reconciling trust rotation");

    if let Err(error) = obj.spec.validate() {
        warn!(%error, "rotation validation failed");
        ctx.status
            .mark_failed(&mut obj, Reason::RotationFailed, &error.to_string())
            .await?;
        // configuration errors require a spec change, not a retry
        return Ok(Action::await_change());
    }

    ctx.status
        .set_phase(
            &mut obj,
            Phase::Idle,
            None,
            "Watching for changes to the Linkerd trust anchor certificate",
        )
        .await?;
    ctx.status.set_progress(&mut obj, true, None, None).await?;

    let (bundle_state, detect_reason) = match detect(&ctx, &mut obj).await {
        Ok(detected) => detected,
        Err(error @ Error::Configuration(_)) => {
            // a missing bundle or anchor secret is the user's provisioning
            // problem; surface it on the status but keep observing
            ctx.status
                .mark_failed(&mut obj, Reason::RotationFailed, &error.to_string())
                .await?;
            return Ok(Action::requeue(REQUEUE_INTERVAL));
        }
        Err(error) => return Err(error),
    };

    if bundle_state == BundleState::Overlap {
        rotate(&ctx, &mut obj, detect_reason).await?;
        if obj.status.as_ref().and_then(|s| s.phase) == Some(Phase::Failed) {
            return Ok(Action::requeue(MAX_RETRIES_REQUEUE));
        }
        if obj.spec.dry_run {
            return Ok(Action::await_change());
        }
    }

    Ok(Action::requeue(REQUEUE_INTERVAL))
}

// Evaluates the configured triggers and records the observed trust state.
// Returns the bundle state driving the rotation decision and the reason to
// report when a rotation starts.
async fn detect(
    ctx: &Context,
    obj: &mut LinkerdTrustRotation,
) -> Result<(BundleState, Reason), Error> {
    let trigger = obj.spec.trigger.clone();

    match (trigger.on_anchor_divergence, trigger.on_bundle_change) {
        (true, false) => {
            let anchors = ctx.secrets.ensure_anchor_secrets(obj).await?;
            let state = if anchors.diverged {
                BundleState::Overlap
            } else {
                BundleState::Single
            };
            ctx.status
                .set_trust(obj, state, &anchors.current_fingerprint, &anchors.previous_fingerprint)
                .await?;
            Ok((state, Reason::SecretsDiverged))
        }
        (false, true) => {
            let inspection = ctx.bundles.load_and_inspect(obj).await?;
            let state = inspection.state;
            let (current, previous) = match inspection.fingerprints.as_slice() {
                [only] => (format!("sha256:{only}"), format!("sha256:{only}")),
                [previous, current] => (format!("sha256:{current}"), format!("sha256:{previous}")),
                _ => {
                    return Err(Error::bundle(
                        "more than 2 or 0 fingerprints found in trust bundle",
                    ));
                }
            };
            ctx.status.set_trust(obj, state, &current, &previous).await?;
            Ok((state, Reason::ConfigMapChanged))
        }
        (true, true) => {
            let anchors = ctx.secrets.ensure_anchor_secrets(obj).await?;
            let inspection = ctx.bundles.load_and_inspect(obj).await?;
            let state = if anchors.diverged && inspection.state == BundleState::Overlap {
                BundleState::Overlap
            } else {
                BundleState::Single
            };
            ctx.status
                .set_trust(obj, state, &anchors.current_fingerprint, &anchors.previous_fingerprint)
                .await?;
            Ok((state, Reason::SecretsDiverged))
        }
        (false, false) => Err(Error::configuration(
            "no rotation trigger enabled: at least one of trigger.onBundleChange or trigger.onAnchorDivergence must be true",
        )),
    }
}

// Drives a detected rotation to a terminal phase. On entry the bundle is in
// the overlap state; on exit the rotation is Succeeded, Failed, or an error
// has been recorded for the framework to retry.
async fn rotate(ctx: &Context, obj: &mut LinkerdTrustRotation, detect_reason: Reason) -> Result<(), Error> {
    if obj.spec.dry_run {
        let plan = ctx.engine.plan_builder().build(obj).await?;
        let dump = plan.dry_run_dump()?;
        ctx.status.set_dry_run_output(obj, &dump).await?;
        return Ok(());
    }

    let retries = obj
        .status
        .as_ref()
        .and_then(|s| s.retries.as_ref())
        .map(|r| r.count)
        .unwrap_or(0);
    let max_failures = obj.spec.protection.max_rollout_failures;
    if retries > max_failures {
        let message =
            format!("max retry limit reached ({retries} > {max_failures}); stopping rollout");
        warn!(%message, "aborting rotation");
        ctx.events.warn(obj, "MaxRetriesExceeded", &message).await;
        ctx.status
            .set_phase(obj, Phase::Failed, Some(Reason::MaxRetriesExceeded), &message)
            .await?;
        return Ok(());
    }

    let detect_message = format!(
        "Certificate mismatch detected for Linkerd trust anchor: {} vs {}",
        obj.spec.mesh.current_anchor_secret_name, obj.spec.mesh.previous_anchor_secret_name
    );
    ctx.status
        .set_phase(obj, Phase::Detecting, Some(detect_reason), &detect_message)
        .await?;

    if let Some(delay) = obj.spec.protection.before_rollout_delay()? {
        wait_with_purpose(delay, "before rollout delay").await;
    }

    ctx.secrets.delete_secret(obj, IDENTITY_ISSUER_SECRET).await?;

    if let Err(error) = ctx.engine.restart_control_plane(obj).await {
        ctx.status
            .mark_failed(obj, Reason::RotationFailed, &error.to_string())
            .await?;
        return Err(error);
    }

    if let Err(error) = ctx.engine.restart_data_plane(obj).await {
        ctx.status
            .mark_failed(obj, Reason::RotationFailed, &error.to_string())
            .await?;
        return Err(error);
    }

    let previous_name = obj.spec.mesh.previous_anchor_secret_name.clone();
    ctx.secrets.delete_secret(obj, &previous_name).await?;
    ctx.status
        .set_phase(
            obj,
            Phase::Cleanup,
            Some(Reason::PreviousSecretDeleted),
            "Deleted the previous trust anchor secret",
        )
        .await?;

    if obj.spec.protection.retrigger_after_cleanup {
        if let Some(delay) = obj.spec.protection.hold_after_cleanup()? {
            ctx.status
                .set_phase(
                    obj,
                    Phase::Hold,
                    Some(Reason::HoldTimerRunning),
                    "Holding before the data plane re-rollout",
                )
                .await?;
            wait_with_purpose(delay, "hold after cleanup").await;
        }

        ctx.secrets.ensure_anchor_secrets(obj).await?;

        if let Err(error) = ctx.engine.restart_data_plane(obj).await {
            ctx.status
                .mark_failed(obj, Reason::RotationFailed, &error.to_string())
                .await?;
            return Err(error);
        }
    }

    ctx.status
        .mark_succeeded(
            obj,
            "Linkerd trust anchor certificate rotation completed successfully",
        )
        .await
}

/// Error policy for the controller: requeue with a short backoff
pub fn error_policy(
    rotation: Arc<LinkerdTrustRotation>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(
        %error,
        rotation = %rotation.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

// Sleeps for the declared delay. Cancellation of the reconcile drops this
// future, so no further mutations are issued on a cancelled path.
async fn wait_with_purpose(delay: Duration, purpose: &str) {
    if delay.is_zero() {
        return;
    }
    info!(purpose, delay_secs = delay.as_secs(), "waiting");
    sleep(delay).await;
    info!(purpose, "wait finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::MockBundleSource;
    use crate::crd::{
        AnnotationSelector, LinkerdTrustRotationSpec, MeshSpec, ProtectionSpec, RetryStatus,
        RolloutSpec, RotationStatus, TargetScope, TriggerSpec, WorkloadKind,
    };
    use crate::rollout::{MockWorkloadApi, RESTARTED_AT_ANNOTATION};
    use crate::secrets::{MockSecretStore, SECRET_DATA_KEY};
    use crate::status::MockStatusPatcher;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{PodTemplateSpec, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const SELECTOR_KEY: &str = "linkerd.io/inject";
    const SELECTOR_VALUE: &str = "enabled";

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
                        annotation_key: SELECTOR_KEY.to_string(),
                        annotation_value: SELECTOR_VALUE.to_string(),
                        targets: vec![TargetScope {
                            kind_type: WorkloadKind::Deployment,
                            allowed_namespaces: vec!["ns1".to_string()],
                            rollout_strategy: None,
                            api_group: None,
                            version: None,
                            kind: None,
                            annotation_bump: None,
                        }],
                    },
                },
                protection: ProtectionSpec::default(),
                dry_run: false,
            },
            status: None,
        }
    }

    fn cert_pem(cn: &str) -> Vec<u8> {
        rcgen::generate_simple_self_signed(vec![format!("{cn}.example.com")])
            .expect("generate test certificate")
            .cert
            .pem()
            .into_bytes()
    }

    fn tls_secret(name: &str, pem: &[u8]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("linkerd".to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(BTreeMap::from([(
                SECRET_DATA_KEY.to_string(),
                ByteString(pem.to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn injected_deployment(namespace: &str, name: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        annotations: Some(BTreeMap::from([(
                            SELECTOR_KEY.to_string(),
                            SELECTOR_VALUE.to_string(),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
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

    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<RotationStatus>>>,
    }

    impl StatusCapture {
        fn last(&self) -> Option<RotationStatus> {
            self.updates.lock().unwrap().last().cloned()
        }

        // distinct phase transitions; every patch carries the current phase,
        // so consecutive repeats are collapsed
        fn phases(&self) -> Vec<Phase> {
            let mut transitions: Vec<Phase> = Vec::new();
            for status in self.updates.lock().unwrap().iter() {
                if let Some(phase) = status.phase {
                    if transitions.last() != Some(&phase) {
                        transitions.push(phase);
                    }
                }
            }
            transitions
        }
    }

    struct ContextParts {
        secret_store: MockSecretStore,
        bundle_source: MockBundleSource,
        workload_api: MockWorkloadApi,
        events: MockEventSink,
    }

    impl ContextParts {
        fn new() -> Self {
            Self {
                secret_store: MockSecretStore::new(),
                bundle_source: MockBundleSource::new(),
                workload_api: MockWorkloadApi::new(),
                events: MockEventSink::new(),
            }
        }

        fn build(self) -> (Arc<Context>, StatusCapture) {
            let capture = StatusCapture::default();
            let capture_clone = capture.clone();
            let mut patcher = MockStatusPatcher::new();
            patcher
                .expect_patch_rotation_status()
                .returning(move |_, _, status| {
                    capture_clone.updates.lock().unwrap().push(status.clone());
                    Ok(())
                });
            let status = StatusRecorder::new(Arc::new(patcher));

            let ctx = Context::with_parts(
                BundleInspector::new(Arc::new(self.bundle_source)),
                SecretSynchronizer::new(Arc::new(self.secret_store)),
                status.clone(),
                RolloutEngine::new(Arc::new(self.workload_api), status),
                Arc::new(self.events),
            );
            (Arc::new(ctx), capture)
        }
    }

    fn diverged_secrets(parts: &mut ContextParts) {
        let current = tls_secret("linkerd-trust-anchor", &cert_pem("anchor-b"));
        let previous = tls_secret("linkerd-previous-anchor", &cert_pem("anchor-a"));
        parts.secret_store.expect_get_secret().returning(move |_, name| {
            Ok(Some(if name == "linkerd-trust-anchor" {
                current.clone()
            } else {
                previous.clone()
            }))
        });
    }

    fn identical_secrets(parts: &mut ContextParts) {
        let pem = cert_pem("anchor-a");
        let current = tls_secret("linkerd-trust-anchor", &pem);
        let previous = tls_secret("linkerd-previous-anchor", &pem);
        parts.secret_store.expect_get_secret().returning(move |_, name| {
            Ok(Some(if name == "linkerd-trust-anchor" {
                current.clone()
            } else {
                previous.clone()
            }))
        });
    }

    /// Story: divergence is detected via the anchor secrets, the control
    /// plane (empty here) and the single data-plane deployment roll, the
    /// previous secret is cleaned up, and the rotation succeeds.
    #[tokio::test(start_paused = true)]
    async fn story_full_rotation_succeeds() {
        let mut parts = ContextParts::new();
        diverged_secrets(&mut parts);

        let deleted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let deleted_clone = deleted.clone();
        parts
            .secret_store
            .expect_delete_secret()
            .returning(move |_, name| {
                deleted_clone.lock().unwrap().push(name.to_string());
                Ok(true)
            });

        // no control-plane deployments; one injected data-plane deployment
        parts
            .workload_api
            .expect_list_deployments_labeled()
            .returning(|_, _| Ok(vec![]));
        parts
            .workload_api
            .expect_list_deployments()
            .returning(|ns| Ok(vec![injected_deployment(ns, "d1")]));
        parts
            .workload_api
            .expect_merge_patch_deployment()
            .withf(|_, name, patch| {
                name == "d1"
                    && patch["spec"]["template"]["metadata"]["annotations"]
                        [RESTARTED_AT_ANNOTATION]
                        .is_string()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        parts
            .workload_api
            .expect_get_deployment()
            .returning(|ns, name| Ok(Some(injected_deployment(ns, name))));

        let (ctx, capture) = parts.build();
        let action = reconcile(Arc::new(sample_rotation()), ctx)
            .await
            .expect("reconcile should succeed");

        assert_eq!(action, Action::requeue(REQUEUE_INTERVAL));

        let phases = capture.phases();
        assert!(phases.contains(&Phase::Idle));
        assert!(phases.contains(&Phase::Detecting));
        assert!(phases.contains(&Phase::RollingControlPlane));
        assert!(phases.contains(&Phase::RollingDataPlane));
        assert!(phases.contains(&Phase::Cleanup));
        assert_eq!(phases.last(), Some(&Phase::Succeeded));

        let final_status = capture.last().unwrap();
        assert!(final_status.completion_time.is_some());
        let cursor = final_status.cursor.unwrap();
        assert_eq!((cursor.next, cursor.total), (0, 1));
        assert_eq!(final_status.retries.unwrap().count, 0);

        // the identity issuer goes first, the previous anchor after the roll
        assert_eq!(
            *deleted.lock().unwrap(),
            vec![IDENTITY_ISSUER_SECRET, "linkerd-previous-anchor"]
        );
    }

    /// Story: retriggerAfterCleanup holds, re-validates the secrets, and
    /// rolls the data plane a second time before succeeding
    #[tokio::test(start_paused = true)]
    async fn story_retrigger_rolls_data_plane_twice() {
        let mut parts = ContextParts::new();
        diverged_secrets(&mut parts);
        parts
            .secret_store
            .expect_delete_secret()
            .returning(|_, _| Ok(true));

        parts
            .workload_api
            .expect_list_deployments_labeled()
            .returning(|_, _| Ok(vec![]));
        parts
            .workload_api
            .expect_list_deployments()
            .returning(|ns| Ok(vec![injected_deployment(ns, "d1")]));
        parts
            .workload_api
            .expect_merge_patch_deployment()
            .times(2)
            .returning(|_, _, _| Ok(()));
        parts
            .workload_api
            .expect_get_deployment()
            .returning(|ns, name| Ok(Some(injected_deployment(ns, name))));

        let (ctx, capture) = parts.build();
        let mut rotation = sample_rotation();
        rotation.spec.protection.retrigger_after_cleanup = true;
        rotation.spec.protection.hold_after_cleanup = Some("5m".to_string());

        let action = reconcile(Arc::new(rotation), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(REQUEUE_INTERVAL));
        let phases = capture.phases();
        assert!(phases.contains(&Phase::Cleanup));
        assert!(phases.contains(&Phase::Hold));
        assert_eq!(phases.last(), Some(&Phase::Succeeded));
    }

    /// Story: matching anchors mean nothing to do; the controller idles
    #[tokio::test]
    async fn story_single_state_idles() {
        let mut parts = ContextParts::new();
        identical_secrets(&mut parts);

        let (ctx, capture) = parts.build();
        let action = reconcile(Arc::new(sample_rotation()), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(REQUEUE_INTERVAL));
        assert_eq!(capture.phases(), vec![Phase::Idle]);
        let trust = capture.last().unwrap().trust.unwrap();
        assert_eq!(trust.bundle_state, Some(BundleState::Single));
    }

    /// Story: a spec without triggers fails terminally until edited
    #[tokio::test]
    async fn story_missing_triggers_fail_terminally() {
        let parts = ContextParts::new();
        let (ctx, capture) = parts.build();

        let mut rotation = sample_rotation();
        rotation.spec.trigger = TriggerSpec::default();

        let action = reconcile(Arc::new(rotation), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = capture.last().unwrap();
        assert_eq!(status.phase, Some(Phase::Failed));
        assert_eq!(status.reason, Some(Reason::RotationFailed));
        assert!(status.message.unwrap().contains("no rotation trigger enabled"));
    }

    /// Story: a missing anchor secret surfaces as Failed on the status but
    /// the controller keeps observing (the secret may appear later)
    #[tokio::test]
    async fn story_missing_anchor_secret_fails_but_keeps_watching() {
        let mut parts = ContextParts::new();
        parts
            .secret_store
            .expect_get_secret()
            .returning(|_, _| Ok(None));

        let (ctx, capture) = parts.build();
        let action = reconcile(Arc::new(sample_rotation()), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(REQUEUE_INTERVAL));
        let status = capture.last().unwrap();
        assert_eq!(status.phase, Some(Phase::Failed));
        assert!(status.message.unwrap().contains("current anchor secret"));
    }

    /// Story: dry run publishes the plan and restarts nothing
    #[tokio::test]
    async fn story_dry_run_publishes_plan_only() {
        let mut parts = ContextParts::new();
        diverged_secrets(&mut parts);
        parts
            .workload_api
            .expect_list_deployments()
            .returning(|ns| Ok(vec![injected_deployment(ns, "d1")]));
        parts.workload_api.expect_merge_patch_deployment().times(0);

        let (ctx, capture) = parts.build();
        let mut rotation = sample_rotation();
        rotation.spec.dry_run = true;

        let action = reconcile(Arc::new(rotation), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = capture.last().unwrap();
        assert_eq!(status.phase, Some(Phase::DryRun));
        let dump = status.dry_run_plan.unwrap();
        assert!(dump.contains("name: d1"));
        assert!(dump.contains("kind: Deployment"));
    }

    /// Story: once the retry budget is exhausted, the rotation aborts with
    /// a MaxRetriesExceeded event and retries a minute later
    #[tokio::test]
    async fn story_max_retries_aborts_with_event() {
        let mut parts = ContextParts::new();
        diverged_secrets(&mut parts);
        parts
            .events
            .expect_warn()
            .withf(|_, reason, message| {
                reason == "MaxRetriesExceeded" && message.contains("max retry limit reached")
            })
            .times(1)
            .returning(|_, _, _| ());

        let (ctx, capture) = parts.build();

        let mut rotation = sample_rotation();
        rotation.spec.protection.max_rollout_failures = 2;
        rotation.status = Some(RotationStatus {
            retries: Some(RetryStatus {
                count: 3,
                last_error: Some("timeout waiting for Deployment ns1/d1 rollout".to_string()),
                last_failed: None,
                last_error_time: None,
            }),
            ..Default::default()
        });

        let action = reconcile(Arc::new(rotation), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        let status = capture.last().unwrap();
        assert_eq!(status.phase, Some(Phase::Failed));
        assert_eq!(status.reason, Some(Reason::MaxRetriesExceeded));
    }

    /// Story: bundle-change detection maps one fingerprint to both anchors
    /// and two fingerprints to previous/current in sorted order
    #[tokio::test]
    async fn story_bundle_detection_maps_fingerprints() {
        use k8s_openapi::api::core::v1::ConfigMap;

        let bundle = {
            let a = String::from_utf8(cert_pem("anchor-a")).unwrap();
            let b = String::from_utf8(cert_pem("anchor-b")).unwrap();
            format!("{a}{b}")
        };
        let expected = crate::bundle::inspect(&bundle).unwrap();

        let mut parts = ContextParts::new();
        let bundle_clone = bundle.clone();
        parts
            .bundle_source
            .expect_get_config_map()
            .returning(move |_, _| {
                Ok(Some(ConfigMap {
                    data: Some(BTreeMap::from([(
                        crate::bundle::BUNDLE_DATA_KEY.to_string(),
                        bundle_clone.clone(),
                    )])),
                    ..Default::default()
                }))
            });

        parts
            .workload_api
            .expect_list_deployments()
            .returning(|_| Ok(vec![]));

        let (ctx, capture) = parts.build();
        let mut rotation = sample_rotation();
        rotation.spec.trigger = TriggerSpec {
            on_bundle_change: true,
            on_anchor_divergence: false,
        };
        rotation.spec.dry_run = true;

        let action = reconcile(Arc::new(rotation), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let trust = capture
            .updates
            .lock()
            .unwrap()
            .iter()
            .find_map(|s| s.trust.clone())
            .unwrap();
        assert_eq!(trust.bundle_state, Some(BundleState::Overlap));
        assert_eq!(
            trust.current_fingerprint.unwrap(),
            format!("sha256:{}", expected.fingerprints[1])
        );
        assert_eq!(
            trust.previous_fingerprint.unwrap(),
            format!("sha256:{}", expected.fingerprints[0])
        );
    }

    /// Story: with both triggers enabled, rotation requires secrets to
    /// diverge AND the bundle to overlap
    #[tokio::test]
    async fn story_combined_triggers_require_both_signals() {
        use k8s_openapi::api::core::v1::ConfigMap;

        let mut parts = ContextParts::new();
        diverged_secrets(&mut parts);

        // bundle still single: only one anchor present
        let single_bundle = String::from_utf8(cert_pem("anchor-a")).unwrap();
        parts
            .bundle_source
            .expect_get_config_map()
            .returning(move |_, _| {
                Ok(Some(ConfigMap {
                    data: Some(BTreeMap::from([(
                        crate::bundle::BUNDLE_DATA_KEY.to_string(),
                        single_bundle.clone(),
                    )])),
                    ..Default::default()
                }))
            });

        let (ctx, capture) = parts.build();
        let mut rotation = sample_rotation();
        rotation.spec.trigger = TriggerSpec {
            on_bundle_change: true,
            on_anchor_divergence: true,
        };

        let action = reconcile(Arc::new(rotation), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(REQUEUE_INTERVAL));
        // no rotation started
        assert_eq!(capture.phases(), vec![Phase::Idle]);
        let trust = capture.last().unwrap().trust.unwrap();
        assert_eq!(trust.bundle_state, Some(BundleState::Single));
    }

    /// Story: a control-plane restart failure marks the rotation Failed and
    /// propagates for the framework to retry
    #[tokio::test(start_paused = true)]
    async fn story_control_plane_failure_marks_failed() {
        let mut parts = ContextParts::new();
        diverged_secrets(&mut parts);
        parts
            .secret_store
            .expect_delete_secret()
            .returning(|_, _| Ok(true));
        parts
            .workload_api
            .expect_list_deployments_labeled()
            .returning(|_, _| {
                Err(crate::Error::configuration("control plane list refused"))
            });

        let (ctx, capture) = parts.build();
        let result = reconcile(Arc::new(sample_rotation()), ctx).await;

        assert!(result.is_err());
        let status = capture.last().unwrap();
        assert_eq!(status.phase, Some(Phase::Failed));
        assert_eq!(status.reason, Some(Reason::RotationFailed));
    }

    mod error_policy_behavior {
        use super::*;

        #[tokio::test]
        async fn always_requeues_with_short_backoff() {
            let parts = ContextParts::new();
            let (ctx, _capture) = parts.build();

            let action = error_policy(
                Arc::new(sample_rotation()),
                &crate::Error::timeout("waiting for Deployment"),
                ctx,
            );

            assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        }
    }
}
