//! Hypertune operator - hyperparameter search on Kubernetes

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};

use hypertune::algorithm::GrpcAlgorithmClient;
use hypertune::config::{OperatorConfig, DEFAULT_CONFIG_MAP};
use hypertune::crd::{all_crds, crds_yaml};
use hypertune::observation::GrpcObservationStore;
use hypertune::provider::JobProviderRegistry;
use hypertune::retry::{retry_if, retry_with_backoff, RetryConfig};
use hypertune::runner::{
    build_experiment_controllers, build_suggestion_controllers, build_trial_controllers,
};
use hypertune::telemetry::{init_telemetry, LogFormat};
use hypertune::{Error, DEFAULT_DB_MANAGER_ADDRESS, FIELD_MANAGER};

/// Hypertune - CRD-driven hyperparameter search operator
#[derive(Parser, Debug)]
#[command(name = "hypertune", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Read operator configuration from a local YAML file instead of the ConfigMap
    #[arg(long, env = "HYPERTUNE_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// ConfigMap holding the operator configuration
    #[arg(long, default_value = DEFAULT_CONFIG_MAP)]
    config_map: String,

    /// Namespace the operator runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = "hypertune")]
    namespace: String,

    /// Address of the observation store
    #[arg(long, env = "DB_MANAGER_ADDRESS", default_value = DEFAULT_DB_MANAGER_ADDRESS)]
    db_manager_address: String,

    /// Concurrent reconciles per controller
    #[arg(long, default_value_t = 4)]
    workers: u16,

    /// Only honour job conditions whose status is "True"
    #[arg(long)]
    require_true_condition: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crds_yaml()?);
        return Ok(());
    }

    init_telemetry(cli.log_format)?;
    run_controllers(cli).await
}

async fn run_controllers(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {e}"))?;

    tracing::info!("Installing CRDs...");
    retry_with_backoff(&RetryConfig::startup(), "install crds", || {
        ensure_crds_installed(&client)
    })
    .await?;

    let config = Arc::new(load_config(&client, &cli).await?);
    tracing::info!(
        algorithms = ?config.suggestions.keys().collect::<Vec<_>>(),
        "operator configuration loaded"
    );

    let providers = Arc::new(JobProviderRegistry::with_defaults(cli.require_true_condition));
    let installed = providers.discover_installed(client.clone()).await;

    tracing::info!("Starting controllers:");
    let mut controllers = build_experiment_controllers(client.clone(), cli.workers)?;
    controllers.extend(build_trial_controllers(
        client.clone(),
        cli.workers,
        providers,
        installed,
        Arc::new(GrpcObservationStore::new(cli.db_manager_address.clone())),
    ));
    controllers.extend(build_suggestion_controllers(
        client,
        cli.workers,
        config,
        Arc::new(GrpcAlgorithmClient::new()),
    ));

    futures::future::join_all(controllers).await;
    tracing::info!("Controllers stopped");
    Ok(())
}

/// Server-side apply every CRD so their versions match the binary
async fn ensure_crds_installed(client: &Client) -> Result<(), Error> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    for crd in all_crds() {
        api.patch(&crd.name_any(), &params, &Patch::Apply(&crd))
            .await?;
        tracing::debug!(crd = %crd.name_any(), "CRD applied");
    }
    Ok(())
}

async fn load_config(client: &Client, cli: &Cli) -> Result<OperatorConfig, Error> {
    if let Some(path) = &cli.config_file {
        return OperatorConfig::from_file(path);
    }
    retry_if(
        &RetryConfig::startup(),
        "load operator config",
        Error::is_retryable,
        || OperatorConfig::load_from_configmap(client, &cli.namespace, &cli.config_map),
    )
    .await
}
