//! schemahero-manager: schema controller manager
//!
//! Watches schema resources and drives each one toward its declared state.
//!
//! ## Architecture
//! ```text
//! Table/View ──> plan (plugin) ──> Migration ──approve──> ConfigMap + apply Pod
//!                                      ^                            │
//!                                      └──── apply-pod collector <──┘
//! Function/DatabaseExtension ──> plan + deploy (plugin)
//! DataMigration ──> compile ──> Migration
//! ```
//!
//! ## Configuration
//! - `--config` / SCHEMAHERO_CONFIG: YAML configuration file
//! - SCHEMAHERO__MANAGER__MANAGED_DATABASES: databases this manager owns (`*` for all)
//! - SCHEMAHERO_LOG: log filter (default `info`)
//! - VAULT_ADDR: enables Vault lookups while planning

use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use schemahero::api::{Table, View};
use schemahero::config::Config;
use schemahero::controllers::extension::ExtensionReconciler;
use schemahero::controllers::function::FunctionReconciler;
use schemahero::controllers::{
    ApplyPodReconciler, Context, Controller, DataMigrationReconciler, MigrationReconciler,
    Reconciler, SchemaReconciler, Settings,
};
use schemahero::plugin::{self, codec, PluginManager};
use schemahero::secrets::{SecretResolver, VaultClient};
use schemahero::store::{Cluster, ResourceStore};
use schemahero::utils::bootstrap::{init_tracing, shutdown_signal};

#[derive(Parser)]
#[command(name = "schemahero-manager", about = "Reconcile declarative database schemas")]
struct Cli {
    /// Configuration file.
    #[arg(long, short)]
    config: Option<String>,
}

fn spawn<R: Reconciler>(
    set: &mut JoinSet<()>,
    stop: &broadcast::Sender<()>,
    controller: Controller<R>,
) {
    let mut stopped = stop.subscribe();
    set.spawn(controller.run(async move {
        let _ = stopped.recv().await;
    }));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        managed = ?config.manager.managed_databases,
        workers = config.manager.workers,
        namespace = ?config.manager.namespace,
        "Starting schemahero-manager"
    );

    let client = kube::Client::try_default().await?;
    let cluster = Cluster::kube(client, config.manager.namespace.as_deref());

    codec::register_payload_types();
    let plugins = plugin::global::init(PluginManager::from_config(&config.plugins)?);
    match plugins.discover_plugins().await {
        Ok(found) => info!(plugins = found, "Plugin discovery finished"),
        Err(e) => warn!(error = %e, "Plugin discovery failed; plugins will be downloaded on demand"),
    }

    let mut secrets = SecretResolver::new(cluster.secrets.clone());
    if config.vault.address.is_some() {
        secrets = secrets.with_vault(Arc::new(VaultClient::new(&config.vault)));
    } else {
        info!("VAULT_ADDR not set, Vault connection values cannot be planned");
    }
    let ctx = Arc::new(
        Context::new(cluster.clone(), plugins.clone())
            .with_settings(Settings::from_config(&config))
            .with_secrets(secrets),
    );

    let workers = config.manager.workers;
    let (stop, _) = broadcast::channel::<()>(1);
    let mut controllers = JoinSet::new();

    spawn(
        &mut controllers,
        &stop,
        Controller::new(Arc::new(SchemaReconciler::<Table>::new(ctx.clone()))).workers(workers),
    );
    spawn(
        &mut controllers,
        &stop,
        Controller::new(Arc::new(SchemaReconciler::<View>::new(ctx.clone()))).workers(workers),
    );
    spawn(
        &mut controllers,
        &stop,
        Controller::new(Arc::new(MigrationReconciler::new(ctx.clone())))
            .owns(cluster.pods.watch())
            .workers(workers),
    );
    spawn(
        &mut controllers,
        &stop,
        Controller::new(Arc::new(ApplyPodReconciler::new(ctx.clone()))),
    );
    spawn(
        &mut controllers,
        &stop,
        Controller::new(Arc::new(FunctionReconciler::new(ctx.clone()))).workers(workers),
    );
    spawn(
        &mut controllers,
        &stop,
        Controller::new(Arc::new(ExtensionReconciler::new(ctx.clone()))).workers(workers),
    );
    spawn(
        &mut controllers,
        &stop,
        Controller::new(Arc::new(DataMigrationReconciler::new(ctx))).workers(workers),
    );

    info!(controllers = controllers.len(), "Controllers running");
    shutdown_signal().await;

    let _ = stop.send(());
    while let Some(joined) = controllers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Controller task failed");
        }
    }
    plugins.cleanup().await;

    info!("schemahero-manager stopped");
    Ok(())
}
