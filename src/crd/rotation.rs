//! LinkerdTrustRotation Custom Resource Definition
//!
//! A LinkerdTrustRotation declares how the operator detects a trust anchor
//! rotation (bundle overlap and/or anchor secret divergence) and how the
//! affected workloads are restarted once it is detected.

use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{RolloutStrategy, RotationStatus, WorkloadKind};

/// Specification for a LinkerdTrustRotation
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trust-anchor.linkerd.edenlab.io",
    version = "v1alpha1",
    kind = "LinkerdTrustRotation",
    plural = "linkerdtrustrotations",
    shortname = "ltr",
    status = "RotationStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"CP","type":"boolean","jsonPath":".status.progress.controlPlaneReady"}"#,
    printcolumn = r#"{"name":"DP%","type":"integer","jsonPath":".status.progress.dataPlanePercent"}"#,
    printcolumn = r#"{"name":"Bundle","type":"string","jsonPath":".status.trust.bundleState"}"#,
    printcolumn = r#"{"name":"Updated","type":"date","jsonPath":".status.lastUpdated"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LinkerdTrustRotationSpec {
    /// Names of the mesh namespace and the documents managed by the operator
    pub mesh: MeshSpec,

    /// Conditions that initiate a rotation
    pub trigger: TriggerSpec,

    /// How workloads are selected and restarted
    pub rollout: RolloutSpec,

    /// Guard settings for the rotation process
    pub protection: ProtectionSpec,

    /// Dry-run mode: compute and publish the plan without restarting anything
    #[serde(default)]
    pub dry_run: bool,
}

impl LinkerdTrustRotationSpec {
    /// Validate the rotation specification.
    ///
    /// Only cross-field consistency is checked here; per-scope requirements
    /// (namespaces, custom-resource GVK) are validated when the plan is built.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if !self.trigger.on_bundle_change && !self.trigger.on_anchor_divergence {
            return Err(crate::Error::configuration(
                "no rotation trigger enabled: at least one of trigger.onBundleChange or trigger.onAnchorDivergence must be true",
            ));
        }

        Ok(())
    }
}

/// Mesh namespace and the documents the operator reads and manages
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshSpec {
    /// Namespace where the Linkerd control plane is installed
    pub namespace: String,

    /// Name of the ConfigMap holding the trust-roots bundle
    pub trust_roots_bundle_name: String,

    /// Name of the current trust anchor secret
    pub current_anchor_secret_name: String,

    /// Name of the previous trust anchor secret
    pub previous_anchor_secret_name: String,

    /// Whether the operator should create the previous anchor secret as a
    /// copy of the current one when it does not exist yet. If false, the
    /// operator assumes it is already provisioned.
    #[serde(default)]
    pub bootstrap_previous_if_missing: bool,
}

/// Conditions that initiate a trust rotation. At least one must be enabled.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    /// Start rotation when the trust-roots bundle enters the overlap state
    #[serde(default)]
    pub on_bundle_change: bool,

    /// Start rotation when the current and previous anchor secrets diverge
    #[serde(default)]
    pub on_anchor_divergence: bool,
}

/// How workloads are selected for restart during rotation
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSpec {
    /// Workload selection by pod-template annotation and per-kind scoping
    pub selector: AnnotationSelector,
}

/// Pod-template annotation selector with per-kind target scopes
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationSelector {
    /// Annotation key to match (e.g. "linkerd.io/inject")
    pub annotation_key: String,

    /// Expected value (e.g. "enabled")
    pub annotation_value: String,

    /// Target scopes, scanned in declaration order
    pub targets: Vec<TargetScope>,
}

/// Scope for a particular workload kind
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetScope {
    /// Kind of workload this scope selects
    pub kind_type: WorkloadKind,

    /// Whitelist of namespaces for this kind
    pub allowed_namespaces: Vec<String>,

    /// Rollout strategy; defaults to rolloutRestart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_strategy: Option<RolloutStrategy>,

    /// API group for custom kinds (required for CustomResource)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,

    /// API version for custom kinds (required for CustomResource)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Kind name for custom kinds (required for CustomResource)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Optional vendor annotation bump applied to custom resources instead
    /// of a pod-template restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_bump: Option<AnnotationBump>,
}

impl TargetScope {
    /// Effective rollout strategy for this scope
    pub fn strategy(&self) -> RolloutStrategy {
        self.rollout_strategy.unwrap_or_default()
    }
}

/// Annotation written to a custom resource's own metadata to trigger a
/// vendor-defined rolling restart
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationBump {
    /// Annotation key to bump
    pub key: String,

    /// Annotation value to write
    pub value: String,
}

/// Guard settings for the rotation process
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionSpec {
    /// Run `linkerd check --proxy` against each workload's namespace after
    /// its restart completes
    #[serde(default)]
    pub run_proxy_check: bool,

    /// Image for the proxy-check job; a pinned linkerd CLI image is used
    /// when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_check_image: Option<String>,

    /// Delay before starting rollouts after detecting a change (e.g. "30s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_rollout_delay: Option<String>,

    /// Hold time between cleanup and the optional re-rollout (e.g. "5m").
    /// Relevant only if retriggerAfterCleanup is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_after_cleanup: Option<String>,

    /// Run an additional data-plane restart after trust cleanup, ensuring
    /// proxies reload only the new trust anchor
    #[serde(default)]
    pub retrigger_after_cleanup: bool,

    /// Maximum number of tolerated rollout failures before the rotation is
    /// aborted
    #[serde(default)]
    pub max_rollout_failures: i32,
}

impl ProtectionSpec {
    /// Parsed pre-rollout delay, if configured
    pub fn before_rollout_delay(&self) -> Result<Option<Duration>, crate::Error> {
        parse_optional_duration(self.before_rollout_delay.as_deref(), "protection.beforeRolloutDelay")
    }

    /// Parsed hold-after-cleanup delay, if configured
    pub fn hold_after_cleanup(&self) -> Result<Option<Duration>, crate::Error> {
        parse_optional_duration(self.hold_after_cleanup.as_deref(), "protection.holdAfterCleanup")
    }
}

fn parse_optional_duration(raw: Option<&str>, field: &str) -> Result<Option<Duration>, crate::Error> {
    match raw {
        None => Ok(None),
        Some(s) => humantime::parse_duration(s)
            .map(Some)
            .map_err(|e| crate::Error::configuration(format!("{field}: invalid duration {s:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::WorkloadKind;

    fn sample_spec() -> LinkerdTrustRotationSpec {
        LinkerdTrustRotationSpec {
            mesh: MeshSpec {
                namespace: "linkerd".to_string(),
                trust_roots_bundle_name: "linkerd-identity-trust-roots".to_string(),
                current_anchor_secret_name: "linkerd-trust-anchor".to_string(),
                previous_anchor_secret_name: "linkerd-previous-anchor".to_string(),
                bootstrap_previous_if_missing: true,
            },
            trigger: TriggerSpec {
                on_bundle_change: false,
                on_anchor_divergence: true,
            },
            rollout: RolloutSpec {
                selector: AnnotationSelector {
                    annotation_key: "linkerd.io/inject".to_string(),
                    annotation_value: "enabled".to_string(),
                    targets: vec![TargetScope {
                        kind_type: WorkloadKind::Deployment,
                        allowed_namespaces: vec!["apps".to_string()],
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
        }
    }

    /// Story: a rotation with no trigger enabled is rejected up front
    ///
    /// Without a trigger the controller would never have a reason to act;
    /// accepting such a spec would silently do nothing forever.
    #[test]
    fn story_spec_without_triggers_is_rejected() {
        let mut spec = sample_spec();
        spec.trigger = TriggerSpec::default();

        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("no rotation trigger enabled"));
    }

    #[test]
    fn spec_with_either_trigger_is_valid() {
        let mut spec = sample_spec();
        spec.trigger.on_bundle_change = true;
        spec.trigger.on_anchor_divergence = false;
        assert!(spec.validate().is_ok());

        spec.trigger.on_bundle_change = false;
        spec.trigger.on_anchor_divergence = true;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn target_scope_strategy_defaults_to_restart() {
        let scope = sample_spec().rollout.selector.targets[0].clone();
        assert_eq!(scope.strategy(), RolloutStrategy::RolloutRestart);
    }

    /// Story: delays are declared as human-readable durations
    #[test]
    fn protection_durations_parse_humantime_strings() {
        let protection = ProtectionSpec {
            before_rollout_delay: Some("30s".to_string()),
            hold_after_cleanup: Some("5m".to_string()),
            ..Default::default()
        };

        assert_eq!(
            protection.before_rollout_delay().unwrap(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            protection.hold_after_cleanup().unwrap(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(ProtectionSpec::default().before_rollout_delay().unwrap(), None);
    }

    #[test]
    fn invalid_duration_is_a_configuration_error() {
        let protection = ProtectionSpec {
            before_rollout_delay: Some("soon".to_string()),
            ..Default::default()
        };

        let err = protection.before_rollout_delay().unwrap_err();
        assert!(err.to_string().contains("beforeRolloutDelay"));
    }

    /// Story: the spec round-trips through the wire format kubectl users see
    #[test]
    fn spec_wire_format_uses_camel_case() {
        let spec = sample_spec();
        let value = serde_json::to_value(&spec).unwrap();

        assert_eq!(value["mesh"]["trustRootsBundleName"], "linkerd-identity-trust-roots");
        assert_eq!(value["trigger"]["onAnchorDivergence"], true);
        assert_eq!(value["rollout"]["selector"]["annotationKey"], "linkerd.io/inject");
        assert_eq!(value["rollout"]["selector"]["targets"][0]["kindType"], "Deployment");

        let parsed: LinkerdTrustRotationSpec = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, spec);
    }
}
