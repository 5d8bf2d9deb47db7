//! linkerd-trust-rotator - zero-downtime Linkerd trust anchor rotation operator

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use linkerd_trust_rotator::controller::{error_policy, reconcile, Context};
use linkerd_trust_rotator::crd::LinkerdTrustRotation;

/// Kubernetes operator automating zero-downtime rotation of the Linkerd
/// trust anchor
#[derive(Parser, Debug)]
#[command(name = "linkerd-trust-rotator", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&LinkerdTrustRotation::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let rotations: Api<LinkerdTrustRotation> = Api::all(client.clone());
    let ctx = Arc::new(Context::new(client));

    tracing::info!("starting LinkerdTrustRotation controller");

    Controller::new(rotations, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("controller shutting down");
    Ok(())
}
