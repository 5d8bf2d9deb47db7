//! Supporting types for the LinkerdTrustRotation CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// State of the trust anchor bundle stored in the trust-roots ConfigMap.
///
/// - `single`  - the bundle contains only the current trust anchor
/// - `overlap` - the bundle contains both current and previous anchors
///   (rotation in progress)
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BundleState {
    /// Bundle contains only the current trust anchor (steady state)
    Single,
    /// Bundle contains both the current and the previous trust anchors,
    /// allowing workloads to trust old and new certificates during rotation
    Overlap,
}

impl std::fmt::Display for BundleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Overlap => write!(f, "overlap"),
        }
    }
}

/// Lifecycle phase of a LinkerdTrustRotation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Phase {
    /// No changes detected, everything is fine (default)
    #[default]
    Idle,
    /// Trust roots change detected (bundle/secrets analyzed)
    Detecting,
    /// Dry-run completed; the plan dump is stored on the status
    DryRun,
    /// Previous secret created/verified (first initialization)
    Bootstrap,
    /// Running pre-checks before the rollout starts
    PreCheck,
    /// Restarting the control plane
    RollingControlPlane,
    /// Restarting the data plane (via annotation selector)
    RollingDataPlane,
    /// Verifying data-plane readiness
    Verifying,
    /// Waiting before cleanup
    Hold,
    /// Deleting the previous anchor secret, finalizing the bundle
    Cleanup,
    /// Rotation finished successfully
    Succeeded,
    /// Rotation failed (exceeded maxRolloutFailures, timeouts, etc.)
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Detecting => "Detecting",
            Self::DryRun => "DryRun",
            Self::Bootstrap => "Bootstrap",
            Self::PreCheck => "PreCheck",
            Self::RollingControlPlane => "RollingControlPlane",
            Self::RollingDataPlane => "RollingDataPlane",
            Self::Verifying => "Verifying",
            Self::Hold => "Hold",
            Self::Cleanup => "Cleanup",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Short, machine-readable identifier that explains why the object entered
/// the current phase.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Reason {
    /// Trust-roots bundle changed
    ConfigMapChanged,
    /// Current and previous anchor secrets diverged
    SecretsDiverged,
    /// Previous anchor secret was bootstrapped
    PreviousSecretCreated,
    /// Previous anchor secret was validated
    PreviousSecretValidated,
    /// Post-rollout proxy check failed
    ProxyCheckFailed,
    /// Retry budget exhausted; rotation aborted
    #[serde(rename = "ReasonMaxRetriesExceeded")]
    MaxRetriesExceeded,
    /// Control plane restart in progress
    ControlPlaneRestarting,
    /// Control plane restart finished
    ControlPlaneReady,
    /// Data plane restart in progress
    DataPlaneBatchRestarting,
    /// Data plane restart finished
    DataPlaneThresholdReached,
    /// Post-rollout verification passed
    VerificationPassed,
    /// Post-rollout verification failed
    VerificationFailed,
    /// Hold timer before cleanup is running
    HoldTimerRunning,
    /// Previous anchor secret deleted
    PreviousSecretDeleted,
    /// Dry run finished; no changes were made
    DryRunCompleted,
    /// Rotation completed successfully
    RotationSucceeded,
    /// Rotation failed
    RotationFailed,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ConfigMapChanged => "ConfigMapChanged",
            Self::SecretsDiverged => "SecretsDiverged",
            Self::PreviousSecretCreated => "PreviousSecretCreated",
            Self::PreviousSecretValidated => "PreviousSecretValidated",
            Self::ProxyCheckFailed => "ProxyCheckFailed",
            Self::MaxRetriesExceeded => "ReasonMaxRetriesExceeded",
            Self::ControlPlaneRestarting => "ControlPlaneRestarting",
            Self::ControlPlaneReady => "ControlPlaneReady",
            Self::DataPlaneBatchRestarting => "DataPlaneBatchRestarting",
            Self::DataPlaneThresholdReached => "DataPlaneThresholdReached",
            Self::VerificationPassed => "VerificationPassed",
            Self::VerificationFailed => "VerificationFailed",
            Self::HoldTimerRunning => "HoldTimerRunning",
            Self::PreviousSecretDeleted => "PreviousSecretDeleted",
            Self::DryRunCompleted => "DryRunCompleted",
            Self::RotationSucceeded => "RotationSucceeded",
            Self::RotationFailed => "RotationFailed",
        };
        write!(f, "{s}")
    }
}

/// Workload kinds supported by the rollout plan
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// apps/v1 DaemonSet
    DaemonSet,
    /// Schemaless custom resource (group/version/kind from the target scope)
    CustomResource,
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
            Self::CustomResource => "CustomResource",
        };
        write!(f, "{s}")
    }
}

/// How a work item is restarted
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RolloutStrategy {
    /// Bump the pod-template restart annotation (same as `kubectl rollout restart`)
    #[default]
    RolloutRestart,
    /// Delete pods one-by-one, waiting for each replacement (StatefulSet-safe)
    RolloutDelete,
}

impl std::fmt::Display for RolloutStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RolloutRestart => write!(f, "rolloutRestart"),
            Self::RolloutDelete => write!(f, "rolloutDelete"),
        }
    }
}

/// Stable reference to a workload in the plan
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkRef {
    /// Workload kind ("Deployment", "StatefulSet", ...)
    pub kind: String,
    /// Workload namespace
    pub namespace: String,
    /// Workload name
    pub name: String,
}

/// Control-plane/data-plane rollout progress
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStatus {
    /// Whether control-plane workloads are rolled out and ready
    pub control_plane_ready: bool,

    /// Percentage of data-plane workloads updated and ready
    pub data_plane_percent: i32,
}

/// Trust anchor information observed during detection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrustStatus {
    /// Bundle state: single | overlap
    pub bundle_state: Option<BundleState>,

    /// Current trust anchor fingerprint
    pub current_fingerprint: Option<String>,

    /// Previous trust anchor fingerprint
    pub previous_fingerprint: Option<String>,
}

/// Retry counters and last error for the rollout loop
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryStatus {
    /// Number of recorded failures
    pub count: i32,

    /// Last error message if any
    pub last_error: Option<String>,

    /// Work item that caused the last failure
    pub last_failed: Option<WorkRef>,

    /// Timestamp of the last error
    pub last_error_time: Option<DateTime<Utc>>,
}

/// Cursor tracking progress through the ordered work plan.
///
/// The cursor is the externalized state of the rollout loop: as long as the
/// freshly computed plan hash matches `plan_hash`, a new reconcile resumes
/// at index `next` instead of restarting the plan.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutCursor {
    /// Hash of the current plan, used to detect spec/selection changes
    pub plan_hash: Option<String>,

    /// Index of the next item to process (0..=total), incremented on success
    pub next: i32,

    /// Total number of items in the plan
    pub total: i32,

    /// Last successfully processed item (for logs/diagnostics)
    pub last_done: Option<WorkRef>,
}

/// Observed state of a LinkerdTrustRotation.
///
/// None of these fields use `skip_serializing_if`: the status recorder sends
/// the full document as a JSON merge patch, and explicit nulls are what
/// erase cleared fields on the server.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RotationStatus {
    /// Current phase of the rotation process
    pub phase: Option<Phase>,

    /// Reason for the current phase
    pub reason: Option<Reason>,

    /// Human-readable message with details
    pub message: Option<String>,

    /// Timestamp of the last meaningful status change
    pub last_updated: Option<DateTime<Utc>>,

    /// Timestamp of completion (if succeeded or failed)
    pub completion_time: Option<DateTime<Utc>>,

    /// Progress information
    pub progress: Option<ProgressStatus>,

    /// Trust anchor information
    pub trust: Option<TrustStatus>,

    /// Number of retries and last error
    pub retries: Option<RetryStatus>,

    /// Cursor tracking rollout position for resume on failure
    pub cursor: Option<RolloutCursor>,

    /// Human-readable dump of the last dry-run plan
    pub dry_run_plan: Option<String>,
}
