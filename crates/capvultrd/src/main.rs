mod manifest;

use anyhow::Context;
use capvultr_api::{Cluster, Machine, Resource, VultrCluster, VultrMachine};
use capvultr_cloud::CloudProvider;
use capvultr_cloud_vultr::VultrProvider;
use capvultr_controller::config::DEFAULT_RECONCILE_TIMEOUT;
use capvultr_controller::{
    AddressPolicy, ClusterReconciler, ClusterToVultrCluster, ClusterToVultrMachines, Controller,
    ControllerConfig, FileStore, MachineReconciler, MachineToVultrMachine, Snapshot, Store,
    VultrClusterToVultrMachines,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "capvultrd")]
#[command(about = "Cluster API infrastructure controllers for Vultr", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run both controllers until interrupted
    Run {
        /// Directory holding the persisted object state
        #[arg(long, env = "CAPVULTR_STATE_DIR", default_value = ".capvultr")]
        state_dir: PathBuf,

        /// Upper bound for a single reconcile, in seconds
        #[arg(long, env = "CAPVULTR_RECONCILE_TIMEOUT", default_value_t = DEFAULT_RECONCILE_TIMEOUT.as_secs())]
        reconcile_timeout: u64,

        /// What to do when an instance reports no address (strict or lenient)
        #[arg(long, env = "CAPVULTR_ADDRESS_POLICY", default_value_t = AddressPolicy::Lenient)]
        address_policy: AddressPolicy,

        /// YAML manifests whose objects are created before the controllers start
        #[arg(short, long = "manifest")]
        manifests: Vec<PathBuf>,
    },
    /// Print readiness and failures of the stored resources as JSON
    Status {
        #[arg(long, env = "CAPVULTR_STATE_DIR", default_value = ".capvultr")]
        state_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            state_dir,
            reconcile_timeout,
            address_policy,
            manifests,
        } => {
            let config = ControllerConfig {
                reconcile_timeout: Duration::from_secs(reconcile_timeout),
                address_policy,
                ..Default::default()
            };
            run(&state_dir, &manifests, config).await
        }
        Commands::Status { state_dir } => status(&state_dir).await,
    }
}

async fn run(state_dir: &Path, manifests: &[PathBuf], config: ControllerConfig) -> anyhow::Result<()> {
    let store = Arc::new(
        FileStore::open(state_dir)
            .await
            .with_context(|| format!("Failed to open state directory {}", state_dir.display()))?,
    );

    for path in manifests {
        let created = manifest::apply(store.as_ref(), path).await?;
        tracing::info!(manifest = %path.display(), created, "Applied manifest");
    }

    let provider: Arc<dyn CloudProvider> =
        Arc::new(VultrProvider::from_env().context("Failed to configure the Vultr provider")?);
    tracing::info!(
        provider = provider.name(),
        state_dir = %state_dir.display(),
        reconcile_timeout_secs = config.reconcile_timeout.as_secs(),
        address_policy = %config.address_policy,
        "Starting controllers"
    );

    let clusters = Controller::new(
        Arc::new(ClusterReconciler::new(
            store.clone(),
            provider.clone(),
            config.clone(),
        )),
        config.clone(),
    )
    .owns(store.watch(VultrCluster::KIND))
    .watches(
        store.watch(Cluster::KIND),
        Arc::new(ClusterToVultrCluster::new(store.clone())),
    );

    let machines = Controller::new(
        Arc::new(MachineReconciler::new(
            store.clone(),
            provider.clone(),
            config.clone(),
        )),
        config,
    )
    .owns(store.watch(VultrMachine::KIND))
    .watches(
        store.watch(Machine::KIND),
        Arc::new(MachineToVultrMachine::new(store.clone())),
    )
    .watches(
        store.watch(VultrCluster::KIND),
        Arc::new(VultrClusterToVultrMachines::new(store.clone())),
    )
    .watches(
        store.watch(Cluster::KIND),
        Arc::new(ClusterToVultrMachines::new(store.clone())),
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Interrupt received, shutting down"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for interrupt, shutting down"),
        }
        let _ = stop_tx.send(true);
    });

    tokio::join!(
        clusters.run(stopped(stop_rx.clone())),
        machines.run(stopped(stop_rx)),
    );

    tracing::info!("Controllers stopped");
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    // a dropped sender also means stop
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn status(state_dir: &Path) -> anyhow::Result<()> {
    let snapshot = Snapshot::load(state_dir)
        .await
        .with_context(|| format!("Failed to load state from {}", state_dir.display()))?;
    let report = status_report(&snapshot)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn status_report(snapshot: &Snapshot) -> anyhow::Result<serde_json::Value> {
    let clusters: Vec<_> = snapshot
        .objects_of::<VultrCluster>()?
        .into_iter()
        .map(|vc| {
            let endpoint = &vc.spec.control_plane_endpoint;
            serde_json::json!({
                "name": vc.key().to_string(),
                "ready": vc.status.ready,
                "loadBalancerId": vc.load_balancer_id(),
                "endpoint": endpoint.is_set().then(|| format!("{}:{}", endpoint.host, endpoint.port)),
                "deleting": vc.metadata.is_deleting(),
                "failureMessage": vc.status.failure_message,
            })
        })
        .collect();

    let machines: Vec<_> = snapshot
        .objects_of::<VultrMachine>()?
        .into_iter()
        .map(|vm| {
            serde_json::json!({
                "name": vm.key().to_string(),
                "ready": vm.status.ready,
                "providerID": vm.spec.provider_id,
                "subscriptionStatus": vm.status.subscription_status,
                "addresses": vm.status.addresses,
                "deleting": vm.metadata.is_deleting(),
                "failureReason": vm.status.failure_reason,
                "failureMessage": vm.status.failure_message,
            })
        })
        .collect();

    Ok(serde_json::json!({
        "updatedAt": snapshot.updated_at,
        "vultrClusters": clusters,
        "vultrMachines": machines,
    }))
}
