//! Reconciliation logic for LinkerdTrustRotation resources
//!
//! The controller composes the bundle inspector, secret synchronizer,
//! status recorder, and rollout engine into the rotation state machine:
//! detect the overlap state, restart the control plane, restart the data
//! plane, clean up the previous anchor, and mark the rotation terminal.

mod rotation;

pub use rotation::{
    error_policy, reconcile, Context, EventSink, KubeEventSink, REQUEUE_INTERVAL,
};
