//! Anchor secret management
//!
//! The current and previous trust anchor secrets live in the mesh namespace
//! as TLS secrets. This module validates the current secret, optionally
//! bootstraps the previous one as a byte-for-byte copy, computes bundle
//! fingerprints for both, and reports divergence. It is also the deletion
//! path for the identity-issuer and previous-anchor secrets during cleanup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client};
use sha2::{Digest, Sha256};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::bundle::parse_pem_certs;
use crate::crd::LinkerdTrustRotation;
use crate::{Error, Result};

/// Key under which the anchor certificate bundle is stored in the secrets
pub const SECRET_DATA_KEY: &str = "tls.crt";

/// Annotation marking secrets the operator bootstrapped itself
pub const CREATED_ANNOTATION: &str = "trust-anchor.linkerd.edenlab.io/created";

const BOOTSTRAP_WAIT_BUDGET: Duration = Duration::from_secs(3);
const BOOTSTRAP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Trait abstracting the Secret operations used by the synchronizer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret, returning None when it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create a secret
    async fn create_secret(&self, secret: &Secret) -> Result<()>;

    /// Delete a secret with zero grace and background propagation.
    /// Returns false when the secret was already gone.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// Real secret store backed by the cluster API
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
        self.api(namespace).create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool> {
        let params = DeleteParams::background().grace_period(0);
        match self.api(namespace).delete(name, &params).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Outcome of ensuring the anchor secrets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnchorSecrets {
    /// Whether the previous secret carries the operator's bootstrap marker
    pub created_previous: bool,

    /// Fingerprint of the current secret's certificate bundle
    pub current_fingerprint: String,

    /// Fingerprint of the previous secret's certificate bundle
    pub previous_fingerprint: String,

    /// True when the two secrets' data maps differ
    pub diverged: bool,
}

/// Validates and bootstraps the current/previous anchor secrets
pub struct SecretSynchronizer {
    store: Arc<dyn SecretStore>,
}

impl SecretSynchronizer {
    /// Create a new synchronizer over the given store
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Validate the current secret, optionally bootstrap the previous one,
    /// and return fingerprints to drive the rotation decision.
    ///
    /// The previous secret, once present, is never overwritten.
    pub async fn ensure_anchor_secrets(
        &self,
        rotation: &LinkerdTrustRotation,
    ) -> Result<AnchorSecrets> {
        let mesh = &rotation.spec.mesh;
        let namespace = &mesh.namespace;

        let current = self
            .store
            .get_secret(namespace, &mesh.current_anchor_secret_name)
            .await?
            .ok_or_else(|| {
                Error::configuration(format!(
                    "current anchor secret {namespace}/{} not found",
                    mesh.current_anchor_secret_name
                ))
            })?;

        let previous = match self
            .store
            .get_secret(namespace, &mesh.previous_anchor_secret_name)
            .await?
        {
            Some(previous) => previous,
            None if mesh.bootstrap_previous_if_missing => {
                self.bootstrap_previous(&current, rotation).await?;
                let previous = self
                    .wait_secret_visible(namespace, &mesh.previous_anchor_secret_name)
                    .await?;
                info!(
                    namespace = %namespace,
                    secret = %mesh.previous_anchor_secret_name,
                    source = %mesh.current_anchor_secret_name,
                    "bootstrapped previous anchor secret"
                );
                previous
            }
            None => {
                return Err(Error::configuration(format!(
                    "previous anchor secret {namespace}/{} not found and mesh.bootstrapPreviousIfMissing is disabled",
                    mesh.previous_anchor_secret_name
                )));
            }
        };

        let current_fingerprint = fingerprint_secret(&current)?;
        let previous_fingerprint = fingerprint_secret(&previous)?;

        let created_previous = previous
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(CREATED_ANNOTATION))
            .map(|v| v == "true")
            .unwrap_or(false);

        let diverged = !secret_data_equal(&current, &previous);

        Ok(AnchorSecrets {
            created_previous,
            current_fingerprint,
            previous_fingerprint,
            diverged,
        })
    }

    /// Delete a secret in the mesh namespace. Not-found is success.
    pub async fn delete_secret(&self, rotation: &LinkerdTrustRotation, name: &str) -> Result<()> {
        let namespace = &rotation.spec.mesh.namespace;
        if self.store.delete_secret(namespace, name).await? {
            info!(namespace = %namespace, secret = %name, "deleted secret");
        } else {
            debug!(namespace = %namespace, secret = %name, "secret already deleted");
        }
        Ok(())
    }

    async fn bootstrap_previous(
        &self,
        current: &Secret,
        rotation: &LinkerdTrustRotation,
    ) -> Result<()> {
        let mesh = &rotation.spec.mesh;
        let previous = Secret {
            metadata: ObjectMeta {
                name: Some(mesh.previous_anchor_secret_name.clone()),
                namespace: Some(mesh.namespace.clone()),
                annotations: Some(BTreeMap::from([(
                    CREATED_ANNOTATION.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: current.data.clone(),
            ..Default::default()
        };

        self.store.create_secret(&previous).await
    }

    async fn wait_secret_visible(&self, namespace: &str, name: &str) -> Result<Secret> {
        let deadline = Instant::now() + BOOTSTRAP_WAIT_BUDGET;
        loop {
            if let Some(secret) = self.store.get_secret(namespace, name).await? {
                return Ok(secret);
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout(format!(
                    "timeout waiting for secret {namespace}/{name}"
                )));
            }
            sleep(BOOTSTRAP_POLL_INTERVAL).await;
        }
    }
}

/// Fingerprint of a secret's certificate bundle under `tls.crt`:
/// `"sha256:" + hex(SHA-256(concatenated DER of all CERTIFICATE blocks))`.
pub fn fingerprint_secret(secret: &Secret) -> Result<String> {
    let pem_bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(SECRET_DATA_KEY))
        .map(|b| b.0.as_slice())
        .unwrap_or_default();
    fingerprint_pem_certs(pem_bytes)
}

/// Fingerprint a PEM certificate bundle by concatenating the DER encodings
/// of its CERTIFICATE blocks and hashing with SHA-256.
pub fn fingerprint_pem_certs(pem_bytes: &[u8]) -> Result<String> {
    let certs = parse_pem_certs(pem_bytes)?;
    if certs.is_empty() {
        return Err(Error::bundle("no CERTIFICATE blocks found"));
    }
    let der = certs.concat();
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(&der))))
}

// Empty and absent data maps are equivalent.
fn secret_data_equal(a: &Secret, b: &Secret) -> bool {
    let empty = BTreeMap::new();
    let da = a.data.as_ref().unwrap_or(&empty);
    let db = b.data.as_ref().unwrap_or(&empty);
    da == db
}
