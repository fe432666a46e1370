//! Koney operator - honeytokens and cyber deception for Kubernetes

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use koney::controller::{error_policy, map_workload_event, reconcile, Context, WorkloadChangeTracker};
use koney::crd::DeceptionPolicy;
use koney::workload::WorkloadKind;

/// Koney - Kubernetes operator for honeytokens and cyber deception
#[derive(Parser, Debug)]
#[command(name = "koney", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML
        let crd = serde_yaml::to_string(&DeceptionPolicy::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller().await
}

/// Run the DeceptionPolicy controller until shutdown.
async fn run_controller() -> anyhow::Result<()> {
    tracing::info!("Koney controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let policies: Api<DeceptionPolicy> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());

    let ctx = Arc::new(Context::new(client));
    let tracker = Arc::new(WorkloadChangeTracker::new());

    tracing::info!("Starting DeceptionPolicy controller...");

    let controller = Controller::new(policies, WatcherConfig::default());
    let store = controller.store();

    let pod_store = store.clone();
    let pod_tracker = tracker.clone();
    let deployment_store = store;
    let deployment_tracker = tracker;

    controller
        .watches(pods, WatcherConfig::default(), move |pod: Pod| {
            map_workload_event(&pod_tracker, &pod_store, WorkloadKind::Pod, &pod.metadata)
        })
        .watches(
            deployments,
            WatcherConfig::default(),
            move |deployment: Deployment| {
                map_workload_event(
                    &deployment_tracker,
                    &deployment_store,
                    WorkloadKind::Deployment,
                    &deployment.metadata,
                )
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Koney controller shutting down");
    Ok(())
}
