//! Custom Resource Definitions for the trust rotator
//!
//! This module contains the LinkerdTrustRotation CRD and its supporting types.

mod rotation;
mod types;

pub use rotation::{
    AnnotationBump, AnnotationSelector, LinkerdTrustRotation, LinkerdTrustRotationSpec, MeshSpec,
    ProtectionSpec, RolloutSpec, TargetScope, TriggerSpec,
};
pub use types::{
    BundleState, Phase, ProgressStatus, Reason, RetryStatus, RolloutCursor, RolloutStrategy,
    RotationStatus, TrustStatus, WorkRef, WorkloadKind,
};
