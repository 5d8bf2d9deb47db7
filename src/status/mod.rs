//! Status subresource updates
//!
//! All writes to the LinkerdTrustRotation status flow through the
//! [`StatusRecorder`]. Every mutator deep-copies the live status, applies
//! the mutation, and compares old and new with `lastUpdated` ignored; only a
//! meaningful change is patched, with `lastUpdated` stamped at write time.
//! This keeps `lastUpdated` a true change marker and prevents status-write
//! feedback loops (status change -> requeue -> status change).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    BundleState, LinkerdTrustRotation, Phase, ProgressStatus, Reason, RetryStatus, RolloutCursor,
    RotationStatus, TrustStatus, WorkRef,
};
use crate::Result;

/// Trait abstracting the status subresource patch
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusPatcher: Send + Sync {
    /// Merge-patch the status subresource of the named rotation
    async fn patch_rotation_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RotationStatus,
    ) -> Result<()>;
}

/// Real status patcher backed by the cluster API
pub struct KubeStatusPatcher {
    client: Client,
}

impl KubeStatusPatcher {
    /// Create a new patcher wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusPatcher for KubeStatusPatcher {
    async fn patch_rotation_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RotationStatus,
    ) -> Result<()> {
        let api: Api<LinkerdTrustRotation> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Owns all status writes for LinkerdTrustRotation resources
#[derive(Clone)]
pub struct StatusRecorder {
    patcher: Arc<dyn StatusPatcher>,
}

impl StatusRecorder {
    /// Create a new recorder over the given patcher
    pub fn new(patcher: Arc<dyn StatusPatcher>) -> Self {
        Self { patcher }
    }

    /// Apply `mutate` to a copy of the live status and patch it if anything
    /// meaningful changed. The in-memory object is updated on success so
    /// later mutators in the same reconcile diff against current state.
    pub async fn patch<F>(
        &self,
        obj: &mut LinkerdTrustRotation,
        operation: &str,
        mutate: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut RotationStatus),
    {
        let before = obj.status.clone().unwrap_or_default();
        let mut after = before.clone();
        mutate(&mut after);

        if status_equal_ignoring_timestamp(&before, &after) {
            return Ok(());
        }

        after.last_updated = Some(Utc::now());

        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        debug!(rotation = %name, operation, "patching status");
        self.patcher
            .patch_rotation_status(&namespace, &name, &after)
            .await?;

        obj.status = Some(after);
        Ok(())
    }

    /// Set the high-level phase with optional reason and a message
    pub async fn set_phase(
        &self,
        obj: &mut LinkerdTrustRotation,
        phase: Phase,
        reason: Option<Reason>,
        message: &str,
    ) -> Result<()> {
        let message = message.to_string();
        self.patch(obj, "SetPhase", |st| {
            st.phase = Some(phase);
            st.reason = reason;
            st.message = Some(message);
        })
        .await
    }

    /// Set control-plane readiness and the data-plane percentage computed
    /// from `next`/`total` (0 when either is absent or total is 0)
    pub async fn set_progress(
        &self,
        obj: &mut LinkerdTrustRotation,
        control_plane_ready: bool,
        next: Option<i32>,
        total: Option<i32>,
    ) -> Result<()> {
        let percent = match (next, total) {
            (Some(next), Some(total)) => calc_percent(next, total),
            _ => 0,
        };
        self.patch(obj, "SetProgress", |st| {
            st.progress = Some(ProgressStatus {
                control_plane_ready,
                data_plane_percent: percent,
            });
        })
        .await
    }

    /// Set the bundle state and anchor fingerprints
    pub async fn set_trust(
        &self,
        obj: &mut LinkerdTrustRotation,
        bundle_state: BundleState,
        current_fingerprint: &str,
        previous_fingerprint: &str,
    ) -> Result<()> {
        let current = non_empty(current_fingerprint);
        let previous = non_empty(previous_fingerprint);
        self.patch(obj, "SetTrust", |st| {
            st.trust = Some(TrustStatus {
                bundle_state: Some(bundle_state),
                current_fingerprint: current,
                previous_fingerprint: previous,
            });
        })
        .await
    }

    /// Replace the rollout cursor, stamping `lastDone`
    pub async fn set_cursor(
        &self,
        obj: &mut LinkerdTrustRotation,
        last_done: Option<WorkRef>,
        next: i32,
        total: i32,
        plan_hash: &str,
    ) -> Result<()> {
        let plan_hash = plan_hash.to_string();
        self.patch(obj, "SetCursor", |st| {
            st.cursor = Some(RolloutCursor {
                plan_hash: Some(plan_hash),
                next,
                total,
                last_done,
            });
        })
        .await
    }

    /// Replace the retry counters. `lastErrorTime` is stamped only when a
    /// real failure is being recorded (count > 0 and a non-empty error).
    pub async fn set_retry(
        &self,
        obj: &mut LinkerdTrustRotation,
        last_failed: Option<WorkRef>,
        count: i32,
        last_error: &str,
    ) -> Result<()> {
        let last_error_time = (count > 0 && !last_error.is_empty()).then(Utc::now);
        let last_error = non_empty(last_error);
        self.patch(obj, "SetRetry", |st| {
            st.retries = Some(RetryStatus {
                count,
                last_error,
                last_failed,
                last_error_time,
            });
        })
        .await
    }

    /// Store the dry-run plan dump and mark the dry run completed
    pub async fn set_dry_run_output(
        &self,
        obj: &mut LinkerdTrustRotation,
        plan_dump: &str,
    ) -> Result<()> {
        let plan_dump = plan_dump.to_string();
        self.patch(obj, "SetDryRunOutput", |st| {
            st.phase = Some(Phase::DryRun);
            st.reason = Some(Reason::DryRunCompleted);
            st.message = Some("The data-plane dry run has completed successfully".to_string());
            st.dry_run_plan = Some(plan_dump);
            st.progress = None;
        })
        .await
    }

    /// Mark the rotation succeeded, stamping the completion time
    pub async fn mark_succeeded(
        &self,
        obj: &mut LinkerdTrustRotation,
        message: &str,
    ) -> Result<()> {
        let message = message.to_string();
        let now = Utc::now();
        self.patch(obj, "MarkSucceeded", |st| {
            st.phase = Some(Phase::Succeeded);
            st.reason = Some(Reason::RotationSucceeded);
            st.message = Some(message);
            st.completion_time = Some(now);
        })
        .await
    }

    /// Mark the rotation failed, stamping the completion time
    pub async fn mark_failed(
        &self,
        obj: &mut LinkerdTrustRotation,
        reason: Reason,
        message: &str,
    ) -> Result<()> {
        let message = message.to_string();
        let now = Utc::now();
        self.patch(obj, "MarkFailed", |st| {
            st.phase = Some(Phase::Failed);
            st.reason = Some(reason);
            st.message = Some(message);
            st.completion_time = Some(now);
        })
        .await
    }
}

fn status_equal_ignoring_timestamp(before: &RotationStatus, after: &RotationStatus) -> bool {
    let mut a = before.clone();
    let mut b = after.clone();
    a.last_updated = None;
    b.last_updated = None;
    a == b
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Data-plane percentage: `round(100 * current / total)` clamped to [0, 100],
/// 0 when total is 0.
pub fn calc_percent(current: i32, total: i32) -> i32 {
    if total <= 0 {
        return 0;
    }
    let current = current.clamp(0, total);
    let percent = (f64::from(current) * 100.0 / f64::from(total)).round() as i32;
    percent.clamp(0, 100)
}
