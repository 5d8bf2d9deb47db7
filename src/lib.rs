//! linkerd-trust-rotator - zero-downtime Linkerd trust anchor rotation
//!
//! The operator watches `LinkerdTrustRotation` resources and coordinates a
//! phased, resumable restart of the mesh whenever the trust bundle enters the
//! overlap state (old and new anchors present at the same time).
//!
//! # Architecture
//!
//! The rotation is driven by a single reconciliation loop that composes a
//! handful of managers:
//! - the bundle inspector classifies the trust-roots bundle (single/overlap)
//! - the secret synchronizer validates and bootstraps the anchor secrets
//! - the plan builder scans the cluster for injected workloads and emits a
//!   deterministic, content-hashed work plan
//! - the rollout engine restarts the plan item by item, persisting a cursor
//!   on the resource status so a failed or interrupted rollout resumes where
//!   it stopped
//! - the status recorder owns all writes to the status subresource
//!
//! # Modules
//!
//! - [`crd`] - the LinkerdTrustRotation custom resource definition
//! - [`bundle`] - trust bundle parsing and fingerprinting
//! - [`secrets`] - current/previous anchor secret management
//! - [`status`] - diff-gated status subresource updates
//! - [`rollout`] - work plan construction and the restart engine
//! - [`controller`] - the reconciliation state machine
//! - [`error`] - error types for the operator

#![deny(missing_docs)]

pub mod bundle;
pub mod controller;
pub mod crd;
pub mod error;
pub mod rollout;
pub mod secrets;
pub mod status;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the Linkerd identity issuer secret deleted before a rotation so
/// the control plane re-issues workload certificates from the new anchor.
pub const IDENTITY_ISSUER_SECRET: &str = "linkerd-identity-issuer";
